use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tlhs_core::{ActionRecord, EntityKind, SyncDecision, SyncError};
use tlhs_storage::ActionLog;
use tracing::error;
use uuid::Uuid;

/// Run-scoped writer in front of the [`ActionLog`] that also tallies decisions.
#[derive(Debug)]
pub struct RunJournal {
    log: Arc<ActionLog>,
    run_id: Option<Uuid>,
    tally: BTreeMap<SyncDecision, usize>,
}

impl RunJournal {
    pub fn new(log: Arc<ActionLog>, run_id: Option<Uuid>) -> Self {
        Self {
            log,
            run_id,
            tally: BTreeMap::new(),
        }
    }

    pub async fn record(&mut self, entity: EntityKind, id: &str, action: SyncDecision, message: impl Into<String>) {
        self.write(entity, id, action, message.into(), None).await;
    }

    pub async fn record_error(&mut self, entity: EntityKind, id: &str, message: impl Into<String>, err: &SyncError) {
        let message = format!("{}: {err}", message.into());
        self.write(entity, id, SyncDecision::Error, message, Some(err.payload()))
            .await;
    }

    async fn write(
        &mut self,
        entity: EntityKind,
        id: &str,
        action: SyncDecision,
        message: String,
        error: Option<serde_json::Value>,
    ) {
        *self.tally.entry(action).or_default() += 1;
        let record = ActionRecord {
            timestamp: Utc::now(),
            run_id: self.run_id,
            entity,
            id: id.to_string(),
            action,
            message,
            error,
        };
        if let Err(err) = self.log.append(&record).await {
            error!(error = %err, entity = %entity, id, "failed to persist action record");
        }
    }

    pub fn count(&self, action: SyncDecision) -> usize {
        self.tally.get(&action).copied().unwrap_or(0)
    }

    pub fn tally(&self) -> &BTreeMap<SyncDecision, usize> {
        &self.tally
    }
}
