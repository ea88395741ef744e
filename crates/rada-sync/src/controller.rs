//! Single-flight sweep control and progress reporting.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rada_core::{SweepMode, SweepPhase, SweepStatus};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::journal::ActionLog;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("Download already in progress")]
    AlreadyRunning,
    #[error("session {0} not found on the portal")]
    SessionNotFound(u32),
}

/// Receives coarse progress and human-readable actions from a running sweep.
/// Status updates stay in memory; actions may be persisted.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    fn status(&self, task: &str, progress: u8, error: Option<&str>);
    async fn action(&self, action: &str, details: &str);
}

/// Logs progress only; used where no dashboard is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl ProgressSink for TracingSink {
    fn status(&self, task: &str, progress: u8, error: Option<&str>) {
        match error {
            Some(error) => warn!(task, progress, error, "sweep status"),
            None => info!(task, progress, "sweep status"),
        }
    }

    async fn action(&self, action: &str, details: &str) {
        info!(action, details, "sweep action");
    }
}

/// Shared status record plus the single-flight flag for the whole process.
pub struct SweepController {
    status: Mutex<SweepStatus>,
    cancel: Mutex<Option<CancellationToken>>,
    log: Option<Arc<ActionLog>>,
}

impl SweepController {
    pub fn new(log: Option<Arc<ActionLog>>) -> Self {
        Self {
            status: Mutex::new(SweepStatus::default()),
            cancel: Mutex::new(None),
            log,
        }
    }

    pub fn snapshot(&self) -> SweepStatus {
        self.lock_status().clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock_status().is_running()
    }

    /// Claims the single sweep slot. Test-and-set happens under one lock.
    pub fn try_begin(self: &Arc<Self>, mode: SweepMode) -> Result<SweepGuard, SweepError> {
        let token = CancellationToken::new();
        let run_id = Uuid::new_v4();
        {
            let mut status = self.lock_status();
            if status.is_running() {
                return Err(SweepError::AlreadyRunning);
            }
            *status = SweepStatus {
                run_id: Some(run_id),
                phase: SweepPhase::Running,
                mode: Some(mode),
                current_task: format!("Starting {mode} sweep"),
                progress: 0,
                last_update: Some(Utc::now()),
                error: None,
            };
        }
        *self.lock_cancel() = Some(token.clone());
        Ok(SweepGuard {
            controller: self.clone(),
            mode,
            run_id,
            token,
            settled: false,
        })
    }

    /// Requests cancellation of the running sweep. Returns false when idle.
    pub fn cancel(&self) -> bool {
        match self.lock_cancel().as_ref() {
            Some(token) => {
                token.cancel();
                info!("sweep cancellation requested");
                true
            }
            None => false,
        }
    }

    fn settle(&self, phase: SweepPhase, error: Option<String>) {
        {
            let mut status = self.lock_status();
            status.phase = phase;
            status.last_update = Some(Utc::now());
            if error.is_some() {
                status.error = error;
            }
        }
        *self.lock_cancel() = None;
    }

    fn lock_status(&self) -> MutexGuard<'_, SweepStatus> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_cancel(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.cancel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ProgressSink for SweepController {
    fn status(&self, task: &str, progress: u8, error: Option<&str>) {
        {
            let mut status = self.lock_status();
            status.current_task = task.to_string();
            status.progress = progress.min(100);
            status.last_update = Some(Utc::now());
            status.error = error.map(str::to_string);
        }
        TracingSink.status(task, progress, error);
    }

    async fn action(&self, action: &str, details: &str) {
        TracingSink.action(action, details).await;
        if let Some(log) = &self.log {
            if let Err(err) = log.append(action, details).await {
                warn!(error = %format!("{err:#}"), "failed to write action log");
            }
        }
    }
}

/// Held for the lifetime of one sweep. Dropping it without settling marks the
/// sweep failed so the slot is never left claimed.
pub struct SweepGuard {
    controller: Arc<SweepController>,
    mode: SweepMode,
    run_id: Uuid,
    token: CancellationToken,
    settled: bool,
}

impl SweepGuard {
    pub fn mode(&self) -> SweepMode {
        self.mode
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn controller(&self) -> &Arc<SweepController> {
        &self.controller
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.controller.settle(SweepPhase::Succeeded, None);
    }

    pub fn fail(mut self, error: impl Into<String>) {
        self.settled = true;
        self.controller.settle(SweepPhase::Failed, Some(error.into()));
    }
}

impl Drop for SweepGuard {
    fn drop(&mut self) {
        if !self.settled {
            warn!(run_id = %self.run_id, "sweep ended without settling");
            self.controller
                .settle(SweepPhase::Failed, Some("sweep aborted".to_string()));
        }
    }
}
