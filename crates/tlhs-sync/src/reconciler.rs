//! Per-entity match, create-or-update and link, with run-scoped memory.
//!
//! Every method returns `Err` only for failures that must end the run
//! (credential problems). Anything else is journaled as an `error` decision
//! and the method yields `Ok(None)` so the caller moves on to the next entity.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tlhs_adapters::{DestinationCrm, SourceCrm};
use tlhs_core::{
    AssociationKind, Company, Contact, EnrichedDeal, EntityKind, ObjectType, PropertySet, SyncDecision, SyncError,
};
use tracing::debug;

use crate::config::OwnerMap;
use crate::journal::RunJournal;
use crate::linker::AssociationLinker;
use crate::mapper::{classify_by_age, company_properties, contact_properties, deal_properties, AgeClass};
use crate::matcher::{DestinationMatcher, Lookup};

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub owner_map: OwnerMap,
    pub deal_title_fallback: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            owner_map: OwnerMap::new(),
            deal_title_fallback: true,
        }
    }
}

pub struct Reconciler {
    source: Arc<dyn SourceCrm>,
    destination: Arc<dyn DestinationCrm>,
    matcher: DestinationMatcher,
    linker: AssociationLinker,
    journal: RunJournal,
    owners: OwnerMap,
    now: DateTime<Utc>,
    /// source deal id -> destination id, for deals written this run
    deals_synced: HashMap<String, String>,
    company_details: HashMap<String, Company>,
    /// source company id -> destination id found while attaching a new contact
    company_matches: HashMap<String, String>,
    /// source company id -> destination id, for companies written this run
    companies_synced: HashMap<String, String>,
}

fn first_duplicate(emails: &[String]) -> Option<&str> {
    emails
        .iter()
        .enumerate()
        .find(|(i, email)| emails[..*i].contains(email))
        .map(|(_, email)| email.as_str())
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn SourceCrm>,
        destination: Arc<dyn DestinationCrm>,
        journal: RunJournal,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            matcher: DestinationMatcher::new(destination.clone(), options.deal_title_fallback),
            linker: AssociationLinker::new(destination.clone()),
            source,
            destination,
            journal,
            owners: options.owner_map,
            now: Utc::now(),
            deals_synced: HashMap::new(),
            company_details: HashMap::new(),
            company_matches: HashMap::new(),
            companies_synced: HashMap::new(),
        }
    }

    /// Pins the reference time used for age classification.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn journal(&self) -> &RunJournal {
        &self.journal
    }

    pub fn deal_destination(&self, source_deal_id: &str) -> Option<&str> {
        self.deals_synced.get(source_deal_id).map(String::as_str)
    }

    /// Journals a non-fatal failure; hands fatal ones back to the caller.
    pub async fn absorb_failure(
        &mut self,
        entity: EntityKind,
        id: &str,
        message: &str,
        err: SyncError,
    ) -> Result<(), SyncError> {
        if err.is_fatal() {
            return Err(err);
        }
        self.journal.record_error(entity, id, message, &err).await;
        Ok(())
    }

    pub async fn reconcile_contact(
        &mut self,
        contact: &Contact,
        related_deals: &[EnrichedDeal],
    ) -> Result<Option<String>, SyncError> {
        let emails = contact.normalized_emails();
        if emails.is_empty() {
            self.journal
                .record(EntityKind::Contact, &contact.id, SyncDecision::SkippedNoEmail, "no usable email address")
                .await;
            return Ok(None);
        }
        if let Some(duplicate) = first_duplicate(&emails) {
            let message = format!("email {duplicate} is listed more than once");
            self.journal
                .record(EntityKind::Contact, &contact.id, SyncDecision::SkippedDuplicateEmail, message)
                .await;
            return Ok(None);
        }
        let age = classify_by_age(contact.updated_at, self.now);
        if age == AgeClass::Stale {
            self.journal
                .record(EntityKind::Contact, &contact.id, SyncDecision::SkippedStale, "not updated in over 5 years")
                .await;
            return Ok(None);
        }

        let properties = contact_properties(contact, age);
        let existing = match self.matcher.find_contact(&mut self.journal, &contact.id, &emails).await? {
            Lookup::Found(id) => Some(id),
            Lookup::NotFound => None,
            Lookup::Ambiguous(ids) => {
                let message = format!("emails match {} destination contacts: {}", ids.len(), ids.join(", "));
                self.journal
                    .record(EntityKind::Contact, &contact.id, SyncDecision::Error, message)
                    .await;
                return Ok(None);
            }
        };

        let Some((contact_id, decision)) = self
            .upsert(ObjectType::Contacts, EntityKind::Contact, &contact.id, existing, &properties)
            .await?
        else {
            return Ok(None);
        };

        if decision == SyncDecision::Created {
            if let Some(company_id) = contact.company_id() {
                self.attach_company(&contact_id, company_id, &contact.id).await?;
            }
        }

        for deal in related_deals {
            self.reconcile_deal(deal, Some(&contact_id)).await?;
        }
        Ok(Some(contact_id))
    }

    pub async fn reconcile_deal(
        &mut self,
        enriched: &EnrichedDeal,
        contact_id: Option<&str>,
    ) -> Result<Option<String>, SyncError> {
        let deal = &enriched.deal;
        if let Some(deal_id) = self.deals_synced.get(&deal.id).cloned() {
            debug!(deal = %deal.id, "deal already written this run; linking only");
            if let Some(contact_id) = contact_id {
                self.link(AssociationKind::DealToContact, &deal_id, contact_id, EntityKind::Deal, &deal.id)
                    .await?;
            }
            return Ok(Some(deal_id));
        }

        let age = classify_by_age(deal.updated_at, self.now);
        let Some(properties) = deal_properties(enriched, age, &self.owners) else {
            self.journal
                .record(EntityKind::Deal, &deal.id, SyncDecision::SkippedStale, "not updated in over 5 years")
                .await;
            return Ok(None);
        };

        let existing = self.matcher.find_deal(&mut self.journal, deal).await?;
        let Some((deal_id, _)) = self
            .upsert(ObjectType::Deals, EntityKind::Deal, &deal.id, existing, &properties)
            .await?
        else {
            return Ok(None);
        };
        self.deals_synced.insert(deal.id.clone(), deal_id.clone());

        if let Some(contact_id) = contact_id {
            self.link(AssociationKind::DealToContact, &deal_id, contact_id, EntityKind::Deal, &deal.id)
                .await?;
        }
        Ok(Some(deal_id))
    }

    /// Companies are only written when at least one of their contacts was synced.
    pub async fn reconcile_company(
        &mut self,
        company: &Company,
        contact_ids: &[String],
    ) -> Result<Option<String>, SyncError> {
        if contact_ids.is_empty() {
            self.skip_unlinked_company(&company.id).await;
            return Ok(None);
        }

        let company_id = match self.companies_synced.get(&company.id).cloned() {
            Some(id) => id,
            None => {
                let existing = match self.company_matches.get(&company.id).cloned() {
                    Some(id) => Some(id),
                    None => self.matcher.find_company(&mut self.journal, company).await?,
                };
                let properties = company_properties(company);
                let Some((id, _)) = self
                    .upsert(ObjectType::Companies, EntityKind::Company, &company.id, existing, &properties)
                    .await?
                else {
                    return Ok(None);
                };
                self.companies_synced.insert(company.id.clone(), id.clone());
                id
            }
        };

        for contact_id in contact_ids {
            self.link(AssociationKind::CompanyToContact, &company_id, contact_id, EntityKind::Company, &company.id)
                .await?;
        }
        Ok(Some(company_id))
    }

    pub async fn skip_unlinked_company(&mut self, company_id: &str) {
        self.journal
            .record(
                EntityKind::Company,
                company_id,
                SyncDecision::SkippedNoLinkedContacts,
                "no linked contact was synced",
            )
            .await;
    }

    /// Company detail, fetched at most once per run. Fetch failures are journaled.
    pub async fn company_detail(&mut self, id: &str) -> Result<Option<Company>, SyncError> {
        if let Some(company) = self.company_details.get(id) {
            return Ok(Some(company.clone()));
        }
        match self.source.company(id).await {
            Ok(company) => {
                self.company_details.insert(id.to_string(), company.clone());
                Ok(Some(company))
            }
            Err(err) => {
                self.absorb_failure(EntityKind::Company, id, "fetching company detail", err)
                    .await?;
                Ok(None)
            }
        }
    }

    pub async fn link(
        &mut self,
        kind: AssociationKind,
        from_id: &str,
        to_id: &str,
        entity: EntityKind,
        source_id: &str,
    ) -> Result<bool, SyncError> {
        self.linker
            .link(&mut self.journal, kind, from_id, to_id, entity, source_id)
            .await
    }

    /// Links a freshly created contact to its company when the company already
    /// exists in the destination. Missing companies are left to the page's
    /// company pass, which is the only place companies are written.
    async fn attach_company(
        &mut self,
        contact_id: &str,
        company_source_id: &str,
        contact_source_id: &str,
    ) -> Result<(), SyncError> {
        let known = self
            .companies_synced
            .get(company_source_id)
            .or_else(|| self.company_matches.get(company_source_id))
            .cloned();
        let company_id = match known {
            Some(id) => Some(id),
            None => {
                let Some(company) = self.company_detail(company_source_id).await? else {
                    return Ok(());
                };
                let found = self.matcher.find_company(&mut self.journal, &company).await?;
                if let Some(id) = &found {
                    self.company_matches.insert(company_source_id.to_string(), id.clone());
                }
                found
            }
        };

        match company_id {
            Some(company_id) => {
                self.link(
                    AssociationKind::ContactToCompany,
                    contact_id,
                    &company_id,
                    EntityKind::Contact,
                    contact_source_id,
                )
                .await?;
            }
            None => {
                self.journal
                    .record(
                        EntityKind::Company,
                        company_source_id,
                        SyncDecision::SkippedNoMatch,
                        format!("no destination company yet for contact {contact_source_id}"),
                    )
                    .await;
            }
        }
        Ok(())
    }

    async fn upsert(
        &mut self,
        object: ObjectType,
        entity: EntityKind,
        source_id: &str,
        existing: Option<String>,
        properties: &PropertySet,
    ) -> Result<Option<(String, SyncDecision)>, SyncError> {
        let outcome = match existing {
            Some(id) => self
                .destination
                .update(object, &id, properties)
                .await
                .map(|()| (id, SyncDecision::Updated)),
            None => self
                .destination
                .create(object, properties)
                .await
                .map(|id| (id, SyncDecision::Created)),
        };
        match outcome {
            Ok((id, decision)) => {
                self.journal
                    .record(entity, source_id, decision, format!("{decision} {} {id}", object.path_segment()))
                    .await;
                Ok(Some((id, decision)))
            }
            Err(err) => {
                let message = format!("writing {}", object.path_segment());
                self.absorb_failure(entity, source_id, &message, err).await?;
                Ok(None)
            }
        }
    }
}
