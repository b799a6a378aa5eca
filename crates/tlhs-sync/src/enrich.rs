use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tlhs_adapters::SourceCrm;
use tlhs_core::{Deal, EnrichedDeal, SyncError, User};
use tracing::warn;

/// Resolves phase names, pipeline names and responsible users for deals,
/// caching every lookup for the rest of the run.
///
/// Enrichment is best effort: lookups that fail for non-credential reasons
/// leave the field empty.
pub struct DealEnricher {
    source: Arc<dyn SourceCrm>,
    phases: HashMap<String, String>,
    pipelines: HashMap<String, String>,
    users: HashMap<String, Option<User>>,
}

impl DealEnricher {
    pub fn new(source: Arc<dyn SourceCrm>) -> Self {
        Self {
            source,
            phases: HashMap::new(),
            pipelines: HashMap::new(),
            users: HashMap::new(),
        }
    }

    /// Enriches deals of one customer that has `sibling_deals` other deals besides each.
    pub async fn enrich_all(&mut self, deals: Vec<Deal>, sibling_deals: usize) -> Result<Vec<EnrichedDeal>, SyncError> {
        self.prefetch(&deals).await?;
        let mut out = Vec::with_capacity(deals.len());
        for deal in deals {
            out.push(self.assemble(deal, sibling_deals).await?);
        }
        Ok(out)
    }

    pub async fn enrich(&mut self, deal: Deal, sibling_deals: usize) -> Result<EnrichedDeal, SyncError> {
        self.prefetch(std::slice::from_ref(&deal)).await?;
        self.assemble(deal, sibling_deals).await
    }

    async fn prefetch(&mut self, deals: &[Deal]) -> Result<(), SyncError> {
        let phase_ids: Vec<String> = deals
            .iter()
            .filter_map(|d| d.current_phase.as_ref().map(|p| p.id.clone()))
            .filter(|id| !self.phases.contains_key(id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if !phase_ids.is_empty() {
            match self.source.deal_phases(&phase_ids).await {
                Ok(phases) => self.phases.extend(phases.into_iter().map(|p| (p.id, p.name))),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!(error = %err, "deal phase lookup failed"),
            }
        }

        let pipeline_ids: Vec<String> = deals
            .iter()
            .filter_map(|d| d.pipeline.as_ref().map(|p| p.id.clone()))
            .filter(|id| !self.pipelines.contains_key(id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if !pipeline_ids.is_empty() {
            match self.source.pipelines(&pipeline_ids).await {
                Ok(pipelines) => self.pipelines.extend(pipelines.into_iter().map(|p| (p.id, p.name))),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!(error = %err, "pipeline lookup failed"),
            }
        }
        Ok(())
    }

    async fn assemble(&mut self, deal: Deal, sibling_deals: usize) -> Result<EnrichedDeal, SyncError> {
        let responsible_user = match deal.responsible_user.as_ref().map(|u| u.id.clone()) {
            Some(user_id) => self.user(&user_id).await?,
            None => None,
        };
        let phase_name = deal
            .current_phase
            .as_ref()
            .and_then(|p| self.phases.get(&p.id).cloned());
        let pipeline_name = deal
            .pipeline
            .as_ref()
            .and_then(|p| self.pipelines.get(&p.id).cloned());
        Ok(EnrichedDeal {
            deal,
            phase_name,
            pipeline_name,
            responsible_user,
            sibling_deals,
        })
    }

    async fn user(&mut self, id: &str) -> Result<Option<User>, SyncError> {
        if let Some(cached) = self.users.get(id) {
            return Ok(cached.clone());
        }
        let user = match self.source.user(id).await {
            Ok(user) => Some(user),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(user = id, error = %err, "responsible user lookup failed");
                None
            }
        };
        self.users.insert(id.to_string(), user.clone());
        Ok(user)
    }
}
