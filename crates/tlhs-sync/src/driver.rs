//! Pager / driver: walks source pages and feeds them through the reconciler.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tlhs_adapters::{DestinationCrm, PageCursor, PageRequest, SourceCrm};
use tlhs_core::{AssociationKind, CustomerKind, Deal, EnrichedDeal, EntityKind, SyncDecision, SyncError};
use tlhs_storage::ActionLog;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::{SyncConfig, SyncMode};
use crate::enrich::DealEnricher;
use crate::journal::RunJournal;
use crate::mapper::{classify_by_age, AgeClass};
use crate::reconciler::{ReconcileOptions, Reconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: SyncMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages: u32,
    pub outcome: RunOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub decisions: BTreeMap<SyncDecision, usize>,
}

impl RunSummary {
    pub fn count(&self, decision: SyncDecision) -> usize {
        self.decisions.get(&decision).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub mode: SyncMode,
    pub page_size: u32,
    pub page_delay: Duration,
    pub start_page: Option<u32>,
    pub total_pages: Option<u32>,
    pub reconcile: ReconcileOptions,
}

impl DriverOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            mode: config.mode,
            page_size: config.records_per_page,
            page_delay: config.page_delay,
            start_page: config.start_page,
            total_pages: config.total_pages,
            reconcile: ReconcileOptions {
                owner_map: config.owner_map.clone(),
                deal_title_fallback: config.deal_title_fallback,
            },
        }
    }
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            mode: SyncMode::Contacts,
            page_size: 20,
            page_delay: Duration::from_secs(30),
            start_page: None,
            total_pages: None,
            reconcile: ReconcileOptions::default(),
        }
    }
}

/// Source company id -> destination records seen on the current page.
#[derive(Debug, Default)]
struct CompanyBuckets(BTreeMap<String, CompanyBucket>);

#[derive(Debug, Default)]
struct CompanyBucket {
    contacts: Vec<String>,
    /// (source deal id, destination deal id)
    deals: Vec<(String, String)>,
}

impl CompanyBuckets {
    fn add_contact(&mut self, company: &str, contact_id: &str) {
        let bucket = self.0.entry(company.to_string()).or_default();
        if !bucket.contacts.iter().any(|c| c == contact_id) {
            bucket.contacts.push(contact_id.to_string());
        }
    }

    fn add_deal(&mut self, company: &str, source_deal_id: &str, deal_id: &str) {
        let bucket = self.0.entry(company.to_string()).or_default();
        if !bucket.deals.iter().any(|(s, _)| s == source_deal_id) {
            bucket.deals.push((source_deal_id.to_string(), deal_id.to_string()));
        }
    }
}

/// A source contact as resolved while walking deals.
#[derive(Debug, Clone, Default)]
struct ResolvedContact {
    destination_id: Option<String>,
    company: Option<String>,
}

/// State that lives for one run only.
struct RunState {
    reconciler: Reconciler,
    enricher: DealEnricher,
    contacts: HashMap<String, ResolvedContact>,
    /// Deal ids per lead customer, listed once per run.
    customer_deals: HashMap<(CustomerKind, String), Vec<String>>,
}

pub struct SyncDriver {
    source: Arc<dyn SourceCrm>,
    destination: Arc<dyn DestinationCrm>,
    log: Arc<ActionLog>,
    options: DriverOptions,
}

impl SyncDriver {
    pub fn new(
        source: Arc<dyn SourceCrm>,
        destination: Arc<dyn DestinationCrm>,
        log: Arc<ActionLog>,
        options: DriverOptions,
    ) -> Self {
        Self {
            source,
            destination,
            log,
            options,
        }
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log.path()
    }

    /// Runs one full sync. Never fails: aborts are reported in the summary.
    pub async fn run(&self) -> RunSummary {
        self.run_at(Utc::now()).await
    }

    /// Same as [`run`](Self::run) with a pinned reference time for age classification.
    pub async fn run_at(&self, now: DateTime<Utc>) -> RunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, mode = ?self.options.mode);
        self.run_inner(run_id, now).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, now: DateTime<Utc>) -> RunSummary {
        let started_at = Utc::now();
        let journal = RunJournal::new(self.log.clone(), Some(run_id));
        let mut state = RunState {
            reconciler: Reconciler::new(
                self.source.clone(),
                self.destination.clone(),
                journal,
                self.options.reconcile.clone(),
            )
            .with_now(now),
            enricher: DealEnricher::new(self.source.clone()),
            contacts: HashMap::new(),
            customer_deals: HashMap::new(),
        };

        let mut cursor = match self.options.mode {
            SyncMode::Contacts => None,
            SyncMode::Deals => self.options.start_page.map(PageCursor::Number),
        };
        let mut pages = 0u32;
        info!(page_size = self.options.page_size, "sync run started");

        let failure = loop {
            let request = PageRequest {
                size: self.options.page_size,
                cursor: cursor.clone(),
            };
            let page_span = info_span!("page", number = pages + 1);
            let result = match self.options.mode {
                SyncMode::Contacts => self.contacts_page(&mut state, &request).instrument(page_span).await,
                SyncMode::Deals => self.deals_page(&mut state, &request).instrument(page_span).await,
            };
            match result {
                Ok(next) => {
                    pages += 1;
                    match next.filter(|c| !self.past_last_page(c)) {
                        Some(next) => {
                            cursor = Some(next);
                            if !self.options.page_delay.is_zero() {
                                info!(delay_secs = self.options.page_delay.as_secs(), "pausing before next page");
                                tokio::time::sleep(self.options.page_delay).await;
                            }
                        }
                        None => break None,
                    }
                }
                Err(err) => break Some(err),
            }
        };

        let (outcome, error) = match failure {
            None => (RunOutcome::Completed, None),
            Some(err) => {
                error!(error = %err, pages, "sync run aborted");
                (RunOutcome::Aborted, Some(err.to_string()))
            }
        };
        let decisions = state.reconciler.journal().tally().clone();
        info!(pages, ?outcome, "sync run finished");

        RunSummary {
            run_id,
            mode: self.options.mode,
            started_at,
            finished_at: Utc::now(),
            pages,
            outcome,
            error,
            decisions,
        }
    }

    fn past_last_page(&self, cursor: &PageCursor) -> bool {
        match (self.options.mode, cursor, self.options.total_pages) {
            (SyncMode::Deals, PageCursor::Number(n), Some(total)) => *n > total,
            _ => false,
        }
    }

    /// One page of contacts, each with its own deals. Returns the next cursor.
    async fn contacts_page(
        &self,
        state: &mut RunState,
        request: &PageRequest,
    ) -> Result<Option<PageCursor>, SyncError> {
        let page = self.source.list_contacts(request).await?;
        info!(contacts = page.items.len(), "processing contact page");
        let mut buckets = CompanyBuckets::default();
        let rec = &mut state.reconciler;

        for summary in &page.items {
            let contact = match self.source.contact(&summary.id).await {
                Ok(contact) => contact,
                Err(err) => {
                    rec.absorb_failure(EntityKind::Contact, &summary.id, "fetching contact detail", err)
                        .await?;
                    continue;
                }
            };

            let eligible = !contact.normalized_emails().is_empty()
                && classify_by_age(contact.updated_at, rec.now()) != AgeClass::Stale;
            let deals = if eligible {
                match self.source.deals_for_customer(&contact.id, CustomerKind::Contact).await {
                    Ok(deals) => deals,
                    Err(err) => {
                        rec.absorb_failure(EntityKind::Contact, &contact.id, "listing related deals", err)
                            .await?;
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };
            let siblings = deals.len().saturating_sub(1);
            let (current, stale): (Vec<Deal>, Vec<Deal>) = deals
                .into_iter()
                .partition(|d| classify_by_age(d.updated_at, rec.now()) != AgeClass::Stale);
            let mut related = state.enricher.enrich_all(current, siblings).await?;
            related.extend(stale.into_iter().map(EnrichedDeal::bare));

            let Some(contact_id) = rec.reconcile_contact(&contact, &related).await? else {
                continue;
            };
            if let Some(company) = contact.company_id() {
                buckets.add_contact(company, &contact_id);
            }
            for enriched in &related {
                let company = enriched.deal.company_id().or(contact.company_id());
                if let (Some(company), Some(deal_id)) = (company, rec.deal_destination(&enriched.deal.id)) {
                    buckets.add_deal(company, &enriched.deal.id, deal_id);
                }
            }
        }

        self.sync_companies(rec, buckets).await?;
        Ok(page.next)
    }

    /// One numbered page of deals, resolving each deal's contact person first.
    async fn deals_page(&self, state: &mut RunState, request: &PageRequest) -> Result<Option<PageCursor>, SyncError> {
        let page = self.source.list_deals(request).await?;
        info!(deals = page.items.len(), number = request.page_number(), "processing deal page");
        let mut buckets = CompanyBuckets::default();

        for deal in page.items {
            if classify_by_age(deal.updated_at, state.reconciler.now()) == AgeClass::Stale {
                state.reconciler.reconcile_deal(&EnrichedDeal::bare(deal), None).await?;
                continue;
            }

            let contact = match deal.contact_id() {
                Some(contact_id) => self.resolve_contact(state, contact_id).await?,
                None => ResolvedContact::default(),
            };
            let siblings = self.sibling_deals(state, &deal).await?;
            let enriched = state.enricher.enrich(deal, siblings).await?;
            let Some(deal_id) = state
                .reconciler
                .reconcile_deal(&enriched, contact.destination_id.as_deref())
                .await?
            else {
                continue;
            };

            if let (Some(company), Some(contact_id)) = (&contact.company, &contact.destination_id) {
                buckets.add_contact(company, contact_id);
            }
            let company = enriched.deal.company_id().map(str::to_string).or(contact.company);
            if let Some(company) = company {
                buckets.add_deal(&company, &enriched.deal.id, &deal_id);
            }
        }

        self.sync_companies(&mut state.reconciler, buckets).await?;
        Ok(page.next)
    }

    /// Fetches and reconciles a deal's contact person once per run.
    async fn resolve_contact(&self, state: &mut RunState, contact_id: &str) -> Result<ResolvedContact, SyncError> {
        if let Some(resolved) = state.contacts.get(contact_id) {
            return Ok(resolved.clone());
        }
        let rec = &mut state.reconciler;
        let resolved = match self.source.contact(contact_id).await {
            Ok(contact) => ResolvedContact {
                destination_id: rec.reconcile_contact(&contact, &[]).await?,
                company: contact.company_id().map(str::to_string),
            },
            Err(err) => {
                rec.absorb_failure(EntityKind::Contact, contact_id, "fetching contact detail", err)
                    .await?;
                ResolvedContact::default()
            }
        };
        state.contacts.insert(contact_id.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Other deals of the deal's lead customer. A failed listing is journaled and counts none.
    async fn sibling_deals(&self, state: &mut RunState, deal: &Deal) -> Result<usize, SyncError> {
        let Some(customer) = deal.lead_customer() else {
            return Ok(0);
        };
        let key = (customer.kind, customer.id.to_string());
        if !state.customer_deals.contains_key(&key) {
            let ids = match self.source.deals_for_customer(customer.id, customer.kind).await {
                Ok(deals) => deals.into_iter().map(|d| d.id).collect(),
                Err(err) => {
                    let entity = match customer.kind {
                        CustomerKind::Contact => EntityKind::Contact,
                        CustomerKind::Company => EntityKind::Company,
                    };
                    state
                        .reconciler
                        .absorb_failure(entity, customer.id, "listing related deals", err)
                        .await?;
                    Vec::new()
                }
            };
            state.customer_deals.insert(key.clone(), ids);
        }
        Ok(state
            .customer_deals
            .get(&key)
            .map_or(0, |ids| ids.iter().filter(|id| **id != deal.id).count()))
    }

    /// Page-end pass: upsert each company that has synced contacts and link its deals.
    async fn sync_companies(&self, rec: &mut Reconciler, buckets: CompanyBuckets) -> Result<(), SyncError> {
        for (company_id, bucket) in buckets.0 {
            if bucket.contacts.is_empty() {
                rec.skip_unlinked_company(&company_id).await;
                continue;
            }
            let Some(company) = rec.company_detail(&company_id).await? else {
                continue;
            };
            let Some(destination_company) = rec.reconcile_company(&company, &bucket.contacts).await? else {
                continue;
            };
            for (source_deal_id, deal_id) in &bucket.deals {
                rec.link(
                    AssociationKind::DealToCompany,
                    deal_id,
                    &destination_company,
                    EntityKind::Deal,
                    source_deal_id,
                )
                .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{company, contact, deal, unavailable, FakeDestination, FakeSource};
    use chrono::{Duration as Age, TimeZone};
    use tlhs_core::{CompanyRef, EntityRef, ObjectType, Service};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap()
    }

    fn recent() -> DateTime<Utc> {
        now() - Age::days(90)
    }

    fn options(mode: SyncMode, page_size: u32) -> DriverOptions {
        DriverOptions {
            mode,
            page_size,
            page_delay: Duration::ZERO,
            ..DriverOptions::default()
        }
    }

    fn driver(source: &Arc<FakeSource>, dest: &Arc<FakeDestination>, options: DriverOptions) -> (SyncDriver, Arc<ActionLog>) {
        let log = Arc::new(ActionLog::in_memory());
        (SyncDriver::new(source.clone(), dest.clone(), log.clone(), options), log)
    }

    fn employee(id: &str, email: &str, company_id: &str) -> tlhs_core::Contact {
        let mut c = contact(id, &[email], recent());
        c.company = Some(CompanyRef {
            id: company_id.into(),
            name: Some("Acme".into()),
        });
        c
    }

    #[tokio::test]
    async fn contact_pages_sync_contacts_deals_and_their_company() {
        let source = Arc::new(FakeSource::new());
        source.add_company(company("co1", "Acme", Some("BE0123"), Some("acme.be")));
        source.add_contact(employee("c1", "a@acme.be", "co1"));
        source.add_contact(employee("c2", "b@acme.be", "co1"));
        source.add_deal(deal("d1", "Roof", "c1", false, recent()));
        let dest = Arc::new(FakeDestination::new());
        let (driver, _log) = driver(&source, &dest, options(SyncMode::Contacts, 1));

        let summary = driver.run_at(now()).await;

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.pages, 2);
        assert_eq!(dest.objects(ObjectType::Contacts).len(), 2);
        assert_eq!(dest.objects(ObjectType::Deals).len(), 1);
        assert_eq!(dest.objects(ObjectType::Companies).len(), 1);
        assert_eq!(summary.count(SyncDecision::Created), 4);

        let kinds: Vec<AssociationKind> = dest.associations().into_iter().map(|(k, _, _)| k).collect();
        assert!(kinds.contains(&AssociationKind::DealToContact));
        assert!(kinds.contains(&AssociationKind::DealToCompany));
        assert!(kinds.contains(&AssociationKind::ContactToCompany));
        assert_eq!(
            kinds.iter().filter(|k| **k == AssociationKind::CompanyToContact).count(),
            2
        );
    }

    #[tokio::test]
    async fn rerunning_updates_without_duplicates() {
        let source = Arc::new(FakeSource::new());
        source.add_company(company("co1", "Acme", Some("BE0123"), None));
        source.add_contact(employee("c1", "a@acme.be", "co1"));
        source.add_deal(deal("d1", "Roof", "c1", false, recent()));
        let dest = Arc::new(FakeDestination::new());
        let (driver, _log) = driver(&source, &dest, options(SyncMode::Contacts, 10));

        let first = driver.run_at(now()).await;
        let second = driver.run_at(now()).await;

        assert_eq!(first.count(SyncDecision::Created), 3);
        assert_eq!(second.count(SyncDecision::Created), 0);
        assert_eq!(second.count(SyncDecision::Updated), 3);
        assert_eq!(dest.objects(ObjectType::Contacts).len(), 1);
        assert_eq!(dest.objects(ObjectType::Deals).len(), 1);
        assert_eq!(dest.objects(ObjectType::Companies).len(), 1);
        assert_ne!(first.run_id, second.run_id);
    }

    #[tokio::test]
    async fn failing_detail_is_recorded_and_the_page_continues() {
        let source = Arc::new(FakeSource::new());
        source.add_contact(contact("c1", &["a@x.com"], recent()));
        source.add_contact(contact("c2", &["b@x.com"], recent()));
        source.fail_detail("c1", unavailable());
        let dest = Arc::new(FakeDestination::new());
        let (driver, log) = driver(&source, &dest, options(SyncMode::Contacts, 10));

        let summary = driver.run_at(now()).await;

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.count(SyncDecision::Error), 1);
        assert_eq!(summary.count(SyncDecision::Created), 1);
        let records = log.records().await.unwrap();
        assert!(records.iter().all(|r| r.run_id == Some(summary.run_id)));
    }

    #[tokio::test]
    async fn expired_credential_aborts_the_run() {
        let source = Arc::new(FakeSource::new());
        source.add_contact(contact("c1", &["a@x.com"], recent()));
        source.add_contact(contact("c2", &["b@x.com"], recent()));
        source.fail_detail(
            "c1",
            SyncError::AuthExpired {
                service: Service::Teamleader,
            },
        );
        let dest = Arc::new(FakeDestination::new());
        let (driver, _log) = driver(&source, &dest, options(SyncMode::Contacts, 10));

        let summary = driver.run_at(now()).await;

        assert_eq!(summary.outcome, RunOutcome::Aborted);
        assert!(summary.error.as_deref().unwrap().contains("teamleader"));
        assert!(dest.calls().is_empty());
    }

    #[tokio::test]
    async fn listing_failure_aborts_before_any_page() {
        let source = Arc::new(FakeSource::new());
        source.fail_listing(unavailable());
        let dest = Arc::new(FakeDestination::new());
        let (driver, _log) = driver(&source, &dest, options(SyncMode::Contacts, 10));

        let summary = driver.run_at(now()).await;
        assert_eq!(summary.outcome, RunOutcome::Aborted);
        assert_eq!(summary.pages, 0);
    }

    #[tokio::test]
    async fn deal_mode_honours_page_bounds() {
        let source = Arc::new(FakeSource::new());
        for i in 1..=5 {
            source.add_deal(deal(&format!("d{i}"), &format!("Deal {i}"), "nobody", false, recent()));
        }
        let dest = Arc::new(FakeDestination::new());
        let (driver, _log) = driver(
            &source,
            &dest,
            DriverOptions {
                start_page: Some(2),
                total_pages: Some(3),
                ..options(SyncMode::Deals, 1)
            },
        );

        let summary = driver.run_at(now()).await;

        assert_eq!(summary.pages, 2);
        let listings: Vec<String> = source
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("deals.list page"))
            .collect();
        assert_eq!(listings, vec!["deals.list page 2", "deals.list page 3"]);
        assert_eq!(dest.objects(ObjectType::Deals).len(), 2);
    }

    #[tokio::test]
    async fn deal_mode_skips_stale_deals_without_resolving_contacts() {
        let source = Arc::new(FakeSource::new());
        source.add_contact(contact("c1", &["a@x.com"], recent()));
        source.add_deal(deal("d1", "Foo", "c1", false, now() - Age::days(6 * 365)));
        let dest = Arc::new(FakeDestination::new());
        let (driver, _log) = driver(&source, &dest, options(SyncMode::Deals, 10));

        let summary = driver.run_at(now()).await;

        assert_eq!(summary.count(SyncDecision::SkippedStale), 1);
        assert!(dest.calls().is_empty());
        assert!(!source.calls().iter().any(|c| c.starts_with("contacts.info")));
    }

    #[tokio::test]
    async fn deal_mode_links_contact_and_company_once_per_contact() {
        let source = Arc::new(FakeSource::new());
        source.add_company(company("co1", "Acme", None, Some("acme.be")));
        source.add_contact(employee("c1", "a@acme.be", "co1"));
        source.add_deal(deal("d1", "One", "c1", false, recent()));
        source.add_deal(deal("d2", "Two", "c1", false, recent()));
        let dest = Arc::new(FakeDestination::new());
        let (driver, _log) = driver(&source, &dest, options(SyncMode::Deals, 10));

        let summary = driver.run_at(now()).await;

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(source.calls().iter().filter(|c| c.starts_with("contacts.info")).count(), 1);
        assert_eq!(dest.objects(ObjectType::Contacts).len(), 1);
        assert_eq!(dest.objects(ObjectType::Companies).len(), 1);
        let deal_to_company = dest
            .associations()
            .into_iter()
            .filter(|(k, _, _)| *k == AssociationKind::DealToCompany)
            .count();
        assert_eq!(deal_to_company, 2);
        let (_, props) = &dest.objects(ObjectType::Deals)[0];
        assert_eq!(props.get("dealtype").map(String::as_str), Some("existingbusiness"));
    }

    fn dealtype_of(dest: &FakeDestination, source_deal: &str) -> Option<String> {
        dest.objects(ObjectType::Deals)
            .into_iter()
            .find(|(_, props)| props.get("teamleader_id").map(String::as_str) == Some(source_deal))
            .and_then(|(_, props)| props.get("dealtype").cloned())
    }

    fn company_deal(id: &str, title: &str, company_id: &str, person: &str) -> Deal {
        let mut d = deal(id, title, company_id, true, recent());
        d.lead.contact_person = Some(EntityRef {
            id: person.into(),
            kind: Some("contact".into()),
        });
        d
    }

    #[tokio::test]
    async fn deal_mode_counts_siblings_of_the_lead_customer() {
        let source = Arc::new(FakeSource::new());
        source.add_company(company("co1", "Acme", None, Some("acme.be")));
        source.add_contact(employee("c1", "a@acme.be", "co1"));
        source.add_contact(contact("c2", &["solo@x.com"], recent()));
        source.add_deal(company_deal("d1", "Roof", "co1", "c1"));
        source.add_deal(company_deal("d2", "Gutter", "co1", "c1"));
        source.add_deal(deal("d3", "Private", "c1", false, recent()));
        source.add_deal(deal("d4", "Single", "c2", false, recent()));
        let dest = Arc::new(FakeDestination::new());
        let (driver, _log) = driver(&source, &dest, options(SyncMode::Deals, 10));

        let summary = driver.run_at(now()).await;

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(dealtype_of(&dest, "d1").as_deref(), Some("existingbusiness"));
        assert_eq!(dealtype_of(&dest, "d2").as_deref(), Some("existingbusiness"));
        assert_eq!(dealtype_of(&dest, "d3").as_deref(), Some("newbusiness"));
        assert_eq!(dealtype_of(&dest, "d4").as_deref(), Some("newbusiness"));
        let company_listings = source
            .calls()
            .into_iter()
            .filter(|c| c == "deals.list company co1")
            .count();
        assert_eq!(company_listings, 1);
    }

    #[tokio::test]
    async fn failed_related_listing_is_recorded_and_the_deal_still_syncs() {
        let source = Arc::new(FakeSource::new());
        source.add_company(company("co1", "Acme", None, Some("acme.be")));
        source.add_contact(employee("c1", "a@acme.be", "co1"));
        source.add_deal(company_deal("d1", "Roof", "co1", "c1"));
        source.add_deal(company_deal("d2", "Gutter", "co1", "c1"));
        source.fail_related("co1", unavailable());
        let dest = Arc::new(FakeDestination::new());
        let (driver, log) = driver(&source, &dest, options(SyncMode::Deals, 10));

        let summary = driver.run_at(now()).await;

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.count(SyncDecision::Error), 1);
        assert_eq!(dest.objects(ObjectType::Deals).len(), 2);
        assert_eq!(dealtype_of(&dest, "d1").as_deref(), Some("newbusiness"));
        let records = log.records().await.unwrap();
        let failure = records
            .iter()
            .find(|r| r.action == SyncDecision::Error)
            .expect("error record");
        assert_eq!((failure.entity, failure.id.as_str()), (EntityKind::Company, "co1"));
        assert!(failure.message.contains("listing related deals"));
        assert!(failure.error.is_some());
    }

    #[tokio::test]
    async fn contact_mode_does_not_enrich_stale_deals() {
        let source = Arc::new(FakeSource::new());
        source.add_contact(contact("c1", &["a@x.com"], recent()));
        source.add_deal(deal("d1", "Current", "c1", false, recent()));
        let mut old = deal("d2", "Old", "c1", false, now() - Age::days(6 * 365));
        old.current_phase = Some(EntityRef {
            id: "ph-old".into(),
            kind: None,
        });
        old.responsible_user = Some(EntityRef {
            id: "u-old".into(),
            kind: None,
        });
        source.add_deal(old);
        let dest = Arc::new(FakeDestination::new());
        let (driver, _log) = driver(&source, &dest, options(SyncMode::Contacts, 10));

        let summary = driver.run_at(now()).await;

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.count(SyncDecision::SkippedStale), 1);
        assert_eq!(dest.objects(ObjectType::Deals).len(), 1);
        assert_eq!(dealtype_of(&dest, "d1").as_deref(), Some("existingbusiness"));
        let calls = source.calls();
        assert!(!calls.iter().any(|c| c == "dealPhases.list"));
        assert!(!calls.iter().any(|c| c.starts_with("users.info")));
    }

    #[tokio::test]
    async fn company_without_synced_contacts_is_skipped() {
        let source = Arc::new(FakeSource::new());
        source.add_company(company("co1", "Acme", None, None));
        source.add_deal(deal("d1", "Direct", "co1", true, recent()));
        let dest = Arc::new(FakeDestination::new());
        let (driver, _log) = driver(&source, &dest, options(SyncMode::Deals, 10));

        let summary = driver.run_at(now()).await;

        assert_eq!(summary.count(SyncDecision::SkippedNoLinkedContacts), 1);
        assert!(dest.objects(ObjectType::Companies).is_empty());
        assert!(!source.calls().iter().any(|c| c.starts_with("companies.info")));
    }
}
