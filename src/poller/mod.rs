//! Recurring progress polling for a single backend job.
//!
//! A [`ProgressPoller`] owns one spawned tokio task that queries
//! `get_progress` on a fixed interval, tolerates a bounded run of transient
//! failures, and fetches the result exactly once when progress reaches 100.
//! Callbacks go to a [`PollObserver`]; the poller never touches workflow
//! state itself.

pub mod tracker;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, Job, JobClient, JobId, JobType, ResultRef};
use crate::config::PollingConfig;
use crate::observability::backend_metrics;

pub use tracker::{Observation, ProgressTracker};

/// Receives poll outcomes.
///
/// Callbacks run on the poll task while its dispatch gate is held, so they
/// must be quick and must not call [`ProgressPoller::stop`] on the poller
/// that invoked them.
pub trait PollObserver: Send + Sync {
    fn on_update(&self, job_id: &JobId, seq: u64, progress: u8);
    fn on_complete(&self, job_id: &JobId, result: Option<ResultRef>);
    fn on_error(&self, job_id: &JobId, error: BackendError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    /// Transient failures in a row that are retried before escalating.
    pub max_consecutive_failures: u32,
}

impl PollSettings {
    pub fn for_job(config: &PollingConfig, job_type: JobType) -> Self {
        Self {
            interval: config.interval_for(job_type),
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }
}

/// A poll outcome as delivered through a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    Progress {
        job_id: JobId,
        seq: u64,
        progress: u8,
    },
    Completed {
        job_id: JobId,
        result: Option<ResultRef>,
    },
    Failed {
        job_id: JobId,
        error: BackendError,
    },
}

impl PollEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            PollEvent::Progress { job_id, .. }
            | PollEvent::Completed { job_id, .. }
            | PollEvent::Failed { job_id, .. } => job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PollEvent::Progress { .. })
    }
}

/// Observer that forwards every callback into an unbounded channel so a
/// single owner can apply them in order.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<PollEvent>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::UnboundedSender<PollEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PollEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn forward(&self, event: PollEvent) {
        if self.tx.send(event).is_err() {
            debug!("Poll event receiver dropped");
        }
    }
}

impl PollObserver for ChannelObserver {
    fn on_update(&self, job_id: &JobId, seq: u64, progress: u8) {
        self.forward(PollEvent::Progress {
            job_id: job_id.clone(),
            seq,
            progress,
        });
    }

    fn on_complete(&self, job_id: &JobId, result: Option<ResultRef>) {
        self.forward(PollEvent::Completed {
            job_id: job_id.clone(),
            result,
        });
    }

    fn on_error(&self, job_id: &JobId, error: BackendError) {
        self.forward(PollEvent::Failed {
            job_id: job_id.clone(),
            error,
        });
    }
}

/// State shared between a poller handle and its task.
#[derive(Debug)]
struct PollGate {
    active: Mutex<bool>,
    cancel: CancellationToken,
}

impl PollGate {
    fn lock(&self) -> MutexGuard<'_, bool> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run `callback` only while the poller is active. Returns whether it ran.
    fn dispatch(&self, callback: impl FnOnce()) -> bool {
        let active = self.lock();
        if !*active {
            return false;
        }
        callback();
        true
    }

    /// Deactivate, then run the final `callback` if we were still active.
    fn finish(&self, callback: impl FnOnce()) {
        let mut active = self.lock();
        if !*active {
            return;
        }
        *active = false;
        self.cancel.cancel();
        callback();
    }

    fn close(&self) -> bool {
        let mut active = self.lock();
        let was_active = *active;
        *active = false;
        self.cancel.cancel();
        was_active
    }

    fn is_open(&self) -> bool {
        *self.lock()
    }
}

/// Handle to the poll task of one job. Dropping the handle stops polling.
#[derive(Debug)]
pub struct ProgressPoller {
    job_id: JobId,
    job_type: JobType,
    gate: Arc<PollGate>,
    task: Option<JoinHandle<()>>,
}

impl ProgressPoller {
    /// Begin polling `job`. Must be called from within a tokio runtime.
    pub fn start(
        client: Arc<dyn JobClient>,
        job: &Job,
        settings: PollSettings,
        observer: Arc<dyn PollObserver>,
    ) -> Self {
        let gate = Arc::new(PollGate {
            active: Mutex::new(true),
            cancel: CancellationToken::new(),
        });

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            interval_ms = settings.interval.as_millis() as u64,
            "Starting progress poller"
        );

        let task = tokio::spawn(poll_job(
            client,
            job.id.clone(),
            job.job_type,
            settings,
            observer,
            gate.clone(),
        ));

        Self {
            job_id: job.id.clone(),
            job_type: job.job_type,
            gate,
            task: Some(task),
        }
    }

    /// Resolves once the poll task has exited, with the panic message if it
    /// died. Every event the task sent is already queued by then.
    /// Cancel safe; after it resolves once, later calls never resolve.
    pub async fn exited(&mut self) -> Result<(), String> {
        let Some(task) = self.task.as_mut() else {
            return std::future::pending().await;
        };
        let joined = task.await;
        self.task = None;
        joined.map_err(|error| error.to_string())
    }

    /// Whether the poll task is no longer running.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel polling. Once this returns no further callback fires.
    /// Returns `false` if the poller had already stopped.
    pub fn stop(&self) -> bool {
        let was_active = self.gate.close();
        if was_active {
            debug!(job_id = %self.job_id, "Progress poller stopped");
        }
        was_active
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_open()
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }
}

impl Drop for ProgressPoller {
    fn drop(&mut self) {
        self.gate.close();
    }
}

async fn poll_job(
    client: Arc<dyn JobClient>,
    job_id: JobId,
    job_type: JobType,
    settings: PollSettings,
    observer: Arc<dyn PollObserver>,
    gate: Arc<PollGate>,
) {
    let mut ticker = tokio::time::interval(settings.interval);
    // a tick that comes due while a request is in flight is dropped
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut seq: u64 = 0;
    let mut consecutive_failures: u32 = 0;

    loop {
        tokio::select! {
            _ = gate.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        seq += 1;
        backend_metrics().record_poll();
        let response = tokio::select! {
            _ = gate.cancel.cancelled() => return,
            response = client.get_progress(&job_id) => response,
        };

        match response {
            Ok(progress) => {
                consecutive_failures = 0;
                if !gate.dispatch(|| observer.on_update(&job_id, seq, progress)) {
                    return;
                }
                if progress >= 100 {
                    finish_job(client.as_ref(), &job_id, job_type, observer.as_ref(), &gate).await;
                    return;
                }
            }
            Err(error)
                if error.is_transient() && consecutive_failures < settings.max_consecutive_failures =>
            {
                consecutive_failures += 1;
                backend_metrics().record_poll_failure();
                warn!(
                    job_id = %job_id,
                    seq,
                    attempt = consecutive_failures,
                    max_retries = settings.max_consecutive_failures,
                    error = %error,
                    "Progress poll failed, retrying on next tick"
                );
            }
            Err(error) => {
                backend_metrics().record_poll_failure();
                warn!(
                    job_id = %job_id,
                    seq,
                    error_kind = error.kind(),
                    error = %error,
                    "Progress polling gave up"
                );
                gate.finish(|| observer.on_error(&job_id, error));
                return;
            }
        }
    }
}

/// Progress hit 100: fetch the result once and report the terminal outcome.
async fn finish_job(
    client: &dyn JobClient,
    job_id: &JobId,
    job_type: JobType,
    observer: &dyn PollObserver,
    gate: &PollGate,
) {
    if !job_type.has_result() {
        gate.finish(|| observer.on_complete(job_id, None));
        return;
    }

    let result = tokio::select! {
        _ = gate.cancel.cancelled() => return,
        result = client.get_result(job_id) => result,
    };

    match result {
        Ok(result) => {
            info!(job_id = %job_id, result = %result, "Job finished");
            gate.finish(|| observer.on_complete(job_id, Some(result)));
        }
        Err(error) => {
            warn!(job_id = %job_id, error = %error, "Result retrieval failed");
            gate.finish(|| observer.on_error(job_id, error));
        }
    }
}
