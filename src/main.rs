use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use autoseg::{
    backend_metrics, init_telemetry, AdvanceOutcome, AutosegConfig, HttpBackend, Stage,
    StagingReport, UploadFile, WorkflowStateMachine,
};

#[derive(Parser)]
#[command(name = "autoseg")]
#[command(about = "Drive a remote DICOM segmentation service from the command line")]
#[command(long_about = "Autoseg stages DICOM files on a segmentation backend, validates them, \
                       runs inference while tracking progress, and downloads the result. \
                       Get started with 'autoseg run <files>'.")]
struct Cli {
    /// Configuration file (defaults to ./autoseg.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload files or directories of files to the staging area
    Upload {
        #[arg(required = true, help = "Files or directories to upload")]
        paths: Vec<PathBuf>,
    },
    /// Show the files currently staged on the backend
    Refresh,
    /// Remove every staged file from the backend
    Clear,
    /// Validate, process and download in one go
    Run {
        #[arg(help = "Files or directories to upload before validating")]
        paths: Vec<PathBuf>,
    },
    /// Abandon any work and clear the staging area
    Reset,
    /// Show configuration and backend status
    Status,
    /// Inspect or write configuration
    Config {
        /// Write the effective configuration to this path
        #[arg(long, value_name = "PATH")]
        write: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    AutosegConfig::load_env_file()?;
    let config = AutosegConfig::load(cli.config.as_deref())?;
    init_telemetry(&config.observability)?;

    let result = match cli.command {
        Commands::Config { write } => config_command(&config, write.as_deref()),
        Commands::Upload { paths } => block_on(upload_command(&config, &paths)),
        Commands::Refresh => block_on(refresh_command(&config)),
        Commands::Clear => block_on(clear_command(&config)),
        Commands::Run { paths } => block_on(run_command(&config, &paths)),
        Commands::Reset => block_on(reset_command(&config)),
        Commands::Status => block_on(status_command(&config)),
    };

    backend_metrics().log_stats();
    result
}

fn block_on<F: Future<Output = Result<()>>>(command: F) -> Result<()> {
    tokio::runtime::Runtime::new()?.block_on(command)
}

fn build_workflow(config: &AutosegConfig) -> Result<WorkflowStateMachine> {
    let backend = HttpBackend::new(&config.backend.base_url, config.backend.request_timeout())
        .context("failed to build HTTP client")?;
    Ok(WorkflowStateMachine::new(Arc::new(backend), config))
}

async fn upload_command(config: &AutosegConfig, paths: &[PathBuf]) -> Result<()> {
    let mut workflow = build_workflow(config)?;
    let files = collect_upload_files(paths).await?;
    println!("📤 Uploading {} file(s) to {}", files.len(), config.backend.base_url);

    let report = workflow.upload(files).await?;
    print_report(&report);
    if report.succeeded() {
        Ok(())
    } else {
        Err(anyhow!(report.message))
    }
}

async fn refresh_command(config: &AutosegConfig) -> Result<()> {
    let mut workflow = build_workflow(config)?;
    let count = workflow.refresh_files().await?;

    println!("📂 {count} file(s) staged");
    for file in workflow.staging().files() {
        println!("   • {}", file.name);
    }
    Ok(())
}

async fn clear_command(config: &AutosegConfig) -> Result<()> {
    let mut workflow = build_workflow(config)?;
    let report = workflow.clear_files().await?;
    print_report(&report);
    if report.succeeded() {
        Ok(())
    } else {
        Err(anyhow!(report.message))
    }
}

async fn reset_command(config: &AutosegConfig) -> Result<()> {
    let mut workflow = build_workflow(config)?;
    let report = workflow.reset().await?;
    print_report(&report);
    println!("🔄 {}", workflow.state().status_message());
    Ok(())
}

async fn status_command(config: &AutosegConfig) -> Result<()> {
    println!("🩻 autoseg status");
    println!("   Backend:          {}", config.backend.base_url);
    println!(
        "   Poll intervals:   inference {} ms, upload {} ms",
        config.polling.inference_interval_ms, config.polling.upload_interval_ms
    );
    println!("   Allowed types:    {}", config.staging.allowed_extensions.join(", "));
    println!("   Output directory: {}", config.download.output_dir.display());

    let mut workflow = build_workflow(config)?;
    match workflow.refresh_files().await {
        Ok(count) => println!("   Staged files:     {count}"),
        Err(e) => println!("   ⚠️  Backend unavailable: {e}"),
    }
    Ok(())
}

async fn run_command(config: &AutosegConfig, paths: &[PathBuf]) -> Result<()> {
    let mut workflow = build_workflow(config)?;

    if paths.is_empty() {
        let count = workflow.refresh_files().await?;
        println!("📂 Using {count} file(s) already staged");
    } else {
        let files = collect_upload_files(paths).await?;
        let report = workflow.upload(files).await?;
        print_report(&report);
        if !report.succeeded() {
            bail!(report.message);
        }
    }

    let mut updates = workflow.subscribe();
    let printer = tokio::spawn(async move {
        let mut last_progress = None;
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            let progress = snapshot.active_job.as_ref().map(|job| job.progress);
            if snapshot.stage == Stage::Processing && progress != last_progress {
                if let Some(progress) = progress {
                    println!("   ⏳ {progress}%");
                }
                last_progress = progress;
            }
        }
    });

    let finished = tokio::select! {
        outcome = drive_to_download(&mut workflow) => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
    };
    printer.abort();

    match finished {
        Some(outcome) => outcome.map(|_| ()),
        None => {
            println!("🛑 Interrupted, resetting workflow");
            let report = workflow.reset().await?;
            print_report(&report);
            bail!("interrupted")
        }
    }
}

async fn drive_to_download(workflow: &mut WorkflowStateMachine) -> Result<PathBuf> {
    loop {
        match workflow.advance().await {
            AdvanceOutcome::Validated { message } => println!("✅ {message}"),
            AdvanceOutcome::ValidationRejected { message } => bail!(message),
            AdvanceOutcome::ProcessingStarted { job_id } => {
                println!("🧠 Processing (job {job_id})");
                if workflow.settle().await != Stage::Downloading {
                    bail!(workflow.state().status_message().to_string());
                }
                println!("✅ {}", workflow.state().status_message());
            }
            AdvanceOutcome::Downloaded { path, bytes } => {
                println!("💾 Saved {bytes} bytes to {}", path.display());
                return Ok(path);
            }
            AdvanceOutcome::Busy => bail!("workflow is busy"),
            AdvanceOutcome::Failed { message } => bail!(message),
        }
    }
}

fn config_command(config: &AutosegConfig, write: Option<&Path>) -> Result<()> {
    match write {
        Some(path) => {
            config
                .save_to_file(path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("📝 Configuration written to {}", path.display());
        }
        None => print!("{}", toml::to_string_pretty(config)?),
    }
    Ok(())
}

fn print_report(report: &StagingReport) {
    let icon = if report.succeeded() { "✅" } else { "❌" };
    println!("{icon} {} ({} file(s) staged)", report.message, report.file_count);
    for name in &report.skipped {
        println!("   ⚠️  Skipped {name}: unsupported file type");
    }
}

/// Read every file named in `paths`. Directories contribute their direct
/// children.
async fn collect_upload_files(paths: &[PathBuf]) -> Result<Vec<UploadFile>> {
    let mut files = Vec::new();
    for path in paths {
        if tokio::fs::metadata(path)
            .await
            .with_context(|| format!("cannot access {}", path.display()))?
            .is_dir()
        {
            let mut entries = tokio::fs::read_dir(path).await?;
            let mut children = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_file() {
                    children.push(entry.path());
                }
            }
            children.sort();
            for child in children {
                files.push(read_upload_file(&child).await?);
            }
        } else {
            files.push(read_upload_file(path).await?);
        }
    }
    Ok(files)
}

async fn read_upload_file(path: &Path) -> Result<UploadFile> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("invalid file name: {}", path.display()))?;
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(UploadFile::new(name, bytes))
}
