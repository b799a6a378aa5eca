use std::collections::HashSet;
use std::sync::Arc;

use tlhs_adapters::DestinationCrm;
use tlhs_core::{AssociationKind, EntityKind, SyncDecision, SyncError};

use crate::journal::RunJournal;

/// Establishes named associations between destination records, once per pair per run.
pub struct AssociationLinker {
    destination: Arc<dyn DestinationCrm>,
    linked: HashSet<(AssociationKind, String, String)>,
}

impl AssociationLinker {
    pub fn new(destination: Arc<dyn DestinationCrm>) -> Self {
        Self {
            destination,
            linked: HashSet::new(),
        }
    }

    /// Returns whether the pair is linked afterwards. Failures are journaled and
    /// swallowed unless the destination rejected the credential.
    pub async fn link(
        &mut self,
        journal: &mut RunJournal,
        kind: AssociationKind,
        from_id: &str,
        to_id: &str,
        entity: EntityKind,
        source_id: &str,
    ) -> Result<bool, SyncError> {
        let key = (kind, from_id.to_string(), to_id.to_string());
        if self.linked.contains(&key) {
            return Ok(true);
        }
        match self.destination.associate(kind, from_id, to_id).await {
            Ok(()) => {
                self.linked.insert(key);
                journal
                    .record(
                        entity,
                        source_id,
                        SyncDecision::Linked,
                        format!("{} {from_id} -> {to_id}", kind.label()),
                    )
                    .await;
                Ok(true)
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                journal
                    .record_error(entity, source_id, format!("{} {from_id} -> {to_id} failed", kind.label()), &err)
                    .await;
                Ok(false)
            }
        }
    }

    pub fn linked_pairs(&self) -> usize {
        self.linked.len()
    }
}
