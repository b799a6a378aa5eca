use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tlhs_adapters::Credential;
use tlhs_core::SyncError;
use tokio::sync::RwLock;
use tracing::{info, Instrument};

use crate::driver::{RunSummary, SyncDriver};

/// Process-wide session: the source credential, the run-active flag and the
/// outcome of the last finished run.
#[derive(Debug, Default)]
pub struct SessionContext {
    credential: Credential,
    run_active: AtomicBool,
    last_run: RwLock<Option<RunSummary>>,
}

impl SessionContext {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            run_active: AtomicBool::new(false),
            last_run: RwLock::new(None),
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn is_running(&self) -> bool {
        self.run_active.load(Ordering::SeqCst)
    }

    /// Claims the run slot. `None` when another run holds it.
    pub fn try_begin_run(self: &Arc<Self>) -> Option<RunGuard> {
        self.run_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard {
                session: Arc::clone(self),
            })
    }

    pub async fn last_run(&self) -> Option<RunSummary> {
        self.last_run.read().await.clone()
    }

    pub async fn record_run(&self, summary: RunSummary) {
        *self.last_run.write().await = Some(summary);
    }
}

/// Releases the run slot on drop.
#[derive(Debug)]
pub struct RunGuard {
    session: Arc<SessionContext>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.session.run_active.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    Started,
    AlreadyRunning,
}

/// Starts a background run unless one is active. Requires a held credential.
pub async fn spawn_run(session: &Arc<SessionContext>, driver: &Arc<SyncDriver>) -> Result<TriggerOutcome, SyncError> {
    if !session.credential().is_held().await {
        return Err(SyncError::AuthMissing);
    }
    let Some(guard) = session.try_begin_run() else {
        info!("sync requested while a run is active");
        return Ok(TriggerOutcome::AlreadyRunning);
    };

    let session = Arc::clone(session);
    let driver = Arc::clone(driver);
    tokio::spawn(
        async move {
            let summary = driver.run().await;
            session.record_run(summary).await;
            drop(guard);
        }
        .in_current_span(),
    );
    Ok(TriggerOutcome::Started)
}
