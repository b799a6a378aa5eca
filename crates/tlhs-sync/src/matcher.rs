//! Finds existing destination records by ordered candidate keys.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tlhs_adapters::DestinationCrm;
use tlhs_core::{Company, Deal, DestinationRecord, EntityKind, Filter, FilterGroup, ObjectType, SyncError};
use tracing::debug;

use crate::journal::RunJournal;
use crate::mapper::normalize_domain;

/// The destination caps the number of OR-ed filter groups per search.
pub const MAX_FILTER_GROUPS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(String),
    NotFound,
    /// More than one destination record claims the same identity.
    Ambiguous(Vec<String>),
}

/// Decides whether a search hit may be taken for the entity being matched.
type Accept<'a> = &'a (dyn Fn(&str, &DestinationRecord) -> bool + Sync);

#[derive(Clone)]
pub struct DestinationMatcher {
    destination: Arc<dyn DestinationCrm>,
    deal_title_fallback: bool,
}

/// A title hit is only ours when no other source deal owns it.
fn claimable_by(record: &DestinationRecord, deal_id: &str) -> bool {
    match record.properties.get("teamleader_id") {
        None | Some(JsonValue::Null) => true,
        Some(JsonValue::String(owner)) => owner.trim().is_empty() || owner == deal_id,
        Some(_) => false,
    }
}

impl DestinationMatcher {
    pub fn new(destination: Arc<dyn DestinationCrm>, deal_title_fallback: bool) -> Self {
        Self {
            destination,
            deal_title_fallback,
        }
    }

    /// Exact match on any of the given emails.
    ///
    /// A failed search chunk is journaled against the contact and treated as
    /// "no match" for those addresses; only credential failures propagate.
    pub async fn find_contact(
        &self,
        journal: &mut RunJournal,
        source_id: &str,
        emails: &[String],
    ) -> Result<Lookup, SyncError> {
        let mut ids: Vec<String> = Vec::new();
        for chunk in emails.chunks(MAX_FILTER_GROUPS) {
            let groups = chunk
                .iter()
                .map(|email| FilterGroup::single(Filter::eq("email", email)))
                .collect();
            match self.destination.search(ObjectType::Contacts, groups).await {
                Ok(found) => {
                    for record in found.results {
                        if !ids.contains(&record.id) {
                            ids.push(record.id);
                        }
                    }
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    let message = format!("searching contacts by email {}", chunk.join(", "));
                    journal.record_error(EntityKind::Contact, source_id, message, &err).await;
                }
            }
        }
        Ok(match ids.len() {
            0 => Lookup::NotFound,
            1 => Lookup::Found(ids.remove(0)),
            _ => Lookup::Ambiguous(ids),
        })
    }

    /// Tries VAT number, then domain, then name; the first key with any hit wins.
    pub async fn find_company(&self, journal: &mut RunJournal, company: &Company) -> Result<Option<String>, SyncError> {
        let keys = [
            ("vat_number", company.vat_number.clone()),
            ("domain", company.website.as_deref().and_then(normalize_domain)),
            ("name", Some(company.name.clone())),
        ];
        self.first_hit(journal, EntityKind::Company, &company.id, ObjectType::Companies, &keys, &|_, _| true)
            .await
    }

    /// External id first, then (when enabled) exact title among deals no other
    /// source deal owns.
    pub async fn find_deal(&self, journal: &mut RunJournal, deal: &Deal) -> Result<Option<String>, SyncError> {
        let mut keys = vec![("teamleader_id", Some(deal.id.clone()))];
        if self.deal_title_fallback {
            keys.push(("dealname", deal.title.clone()));
        }
        let accept = |property: &str, record: &DestinationRecord| {
            property == "teamleader_id" || claimable_by(record, &deal.id)
        };
        self.first_hit(journal, EntityKind::Deal, &deal.id, ObjectType::Deals, &keys, &accept)
            .await
    }

    async fn first_hit(
        &self,
        journal: &mut RunJournal,
        entity: EntityKind,
        source_id: &str,
        object: ObjectType,
        keys: &[(&'static str, Option<String>)],
        accept: Accept<'_>,
    ) -> Result<Option<String>, SyncError> {
        for (property, value) in keys {
            let Some(value) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) else {
                continue;
            };
            let groups = vec![FilterGroup::single(Filter::eq(property, value))];
            match self.destination.search(object, groups).await {
                Ok(found) => {
                    let hit = found.results.into_iter().find(|record| accept(*property, record));
                    if let Some(record) = hit {
                        debug!(object = object.path_segment(), key = property, id = %record.id, "matched");
                        return Ok(Some(record.id));
                    }
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    let message = format!("searching {} by {property}", object.path_segment());
                    journal.record_error(entity, source_id, message, &err).await;
                }
            }
        }
        Ok(None)
    }
}
