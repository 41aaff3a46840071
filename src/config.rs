use anyhow::{bail, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::JobType;

/// Main configuration structure for autoseg
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AutosegConfig {
    /// Backend connection settings
    pub backend: BackendConfig,
    /// Progress polling settings
    pub polling: PollingConfig,
    /// Upload staging settings
    pub staging: StagingConfig,
    /// Result download settings
    pub download: DownloadConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Base URL all endpoint paths are appended to
    pub base_url: String,
    /// Per-request timeout
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PollingConfig {
    /// Poll interval for inference jobs
    pub inference_interval_ms: u64,
    /// Poll interval for upload jobs
    pub upload_interval_ms: u64,
    /// Consecutive transient poll failures tolerated before giving up
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StagingConfig {
    /// File extensions accepted for upload (lowercase, no dot)
    pub allowed_extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DownloadConfig {
    /// Directory result files are written to
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Default log filter directive
    pub log_level: String,
    /// Emit JSON lines instead of human-readable logs
    pub json_logs: bool,
}

impl Default for AutosegConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                base_url: "http://localhost:5000/api".to_string(),
                request_timeout_secs: 30,
            },
            polling: PollingConfig::default(),
            staging: StagingConfig {
                allowed_extensions: vec!["dcm".to_string()],
            },
            download: DownloadConfig {
                output_dir: PathBuf::from("generatedfiles"),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: false,
            },
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            inference_interval_ms: 1000,
            upload_interval_ms: 100,
            max_consecutive_failures: 3,
        }
    }
}

impl PollingConfig {
    pub fn interval_for(&self, job_type: JobType) -> Duration {
        match job_type {
            JobType::Inference => Duration::from_millis(self.inference_interval_ms),
            JobType::Upload => Duration::from_millis(self.upload_interval_ms),
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl AutosegConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (`autoseg.toml` in the working directory, or `path`)
    /// 3. Environment variables (prefixed with AUTOSEG__, e.g. AUTOSEG__BACKEND__BASE_URL)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path).required(true));
            }
            None => {
                if Path::new("autoseg.toml").exists() {
                    builder = builder.add_source(File::with_name("autoseg"));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("AUTOSEG")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("staging.allowed_extensions")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let mut autoseg_config: AutosegConfig = config.try_deserialize()?;
        autoseg_config.normalize();
        autoseg_config.validate()?;
        Ok(autoseg_config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    fn normalize(&mut self) {
        for ext in &mut self.staging.allowed_extensions {
            *ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
        }
        self.staging.allowed_extensions.retain(|ext| !ext.is_empty());
    }

    /// Reject values the poller cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.polling.inference_interval_ms == 0 {
            bail!("polling.inference_interval_ms must be greater than zero");
        }
        if self.polling.upload_interval_ms == 0 {
            bail!("polling.upload_interval_ms must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_intervals() {
        let config = AutosegConfig::default();
        assert_eq!(
            config.polling.interval_for(JobType::Inference),
            Duration::from_millis(1000)
        );
        assert_eq!(
            config.polling.interval_for(JobType::Upload),
            Duration::from_millis(100)
        );
        assert_eq!(config.polling.max_consecutive_failures, 3);
        assert_eq!(config.staging.allowed_extensions, vec!["dcm".to_string()]);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[backend]
base_url = "http://segmentation.internal:8080/api"
request_timeout_secs = 5

[polling]
inference_interval_ms = 250
upload_interval_ms = 50
max_consecutive_failures = 5

[staging]
allowed_extensions = [".DCM", "ima"]
"#
        )
        .unwrap();

        let config = AutosegConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.backend.base_url, "http://segmentation.internal:8080/api");
        assert_eq!(config.backend.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.polling.max_consecutive_failures, 5);
        assert_eq!(config.staging.allowed_extensions, vec!["dcm", "ima"]);
        // untouched sections keep their defaults
        assert_eq!(config.download.output_dir, PathBuf::from("generatedfiles"));
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autoseg.toml");
        let mut original = AutosegConfig::default();
        original.polling.inference_interval_ms = 2000;
        original.save_to_file(&path).unwrap();

        let loaded = AutosegConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.polling.inference_interval_ms, 2000);
    }

    #[test]
    fn test_zero_poll_interval_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autoseg.toml");
        std::fs::write(&path, "[polling]\ninference_interval_ms = 0\n").unwrap();

        let error = AutosegConfig::load(Some(&path)).unwrap_err();
        assert!(error.to_string().contains("inference_interval_ms"));

        let mut config = AutosegConfig::default();
        config.polling.upload_interval_ms = 0;
        assert!(config.validate().is_err());
        assert!(AutosegConfig::default().validate().is_ok());
    }
}
