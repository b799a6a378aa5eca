//! In-memory doubles of both CRMs that record every call.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tlhs_adapters::{DestinationCrm, Page, PageCursor, PageRequest, SourceCrm};
use tlhs_core::{
    AssociationKind, Company, Contact, ContactSummary, CustomerKind, Deal, DealPhase, DestinationRecord, EmailAddress,
    FilterGroup, ObjectType, Pipeline, PropertySet, PropertyValue, SearchResult, Service, SyncError, User,
};

#[derive(Debug, Clone, PartialEq)]
pub enum DestCall {
    Search { object: ObjectType, groups: Vec<FilterGroup> },
    Create { object: ObjectType, properties: PropertySet },
    Update { object: ObjectType, id: String, properties: PropertySet },
    Associate { kind: AssociationKind, from: String, to: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestOp {
    Search(ObjectType, String),
    Create(ObjectType),
    Update(ObjectType),
    Associate(AssociationKind),
}

pub fn unavailable() -> SyncError {
    SyncError::RemoteUnavailable {
        service: Service::Hubspot,
        message: "http status 503 Service Unavailable".into(),
        body: Some(serde_json::json!({"status": "error", "message": "try again"})),
    }
}

pub fn rejected() -> SyncError {
    SyncError::ValidationRejected {
        service: Service::Hubspot,
        status: 400,
        body: Some(serde_json::json!({"status": "error", "category": "VALIDATION_ERROR"})),
    }
}

#[derive(Debug, Default)]
struct DestState {
    objects: Vec<(ObjectType, String, BTreeMap<String, String>)>,
    calls: Vec<DestCall>,
    failures: Vec<(DestOp, SyncError)>,
    next_id: usize,
}

/// Destination double: searches evaluate filter groups against stored objects.
#[derive(Debug, Default)]
pub struct FakeDestination {
    state: Mutex<DestState>,
}

fn text_value(value: &PropertyValue) -> String {
    match value {
        PropertyValue::Bool(b) => b.to_string(),
        PropertyValue::Number(n) => n.to_string(),
        PropertyValue::Text(s) => s.clone(),
    }
}

impl FakeDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an existing destination record and returns its id.
    pub fn seed(&self, object: ObjectType, id: &str, props: &[(&str, &str)]) -> String {
        let mut state = self.state.lock().unwrap();
        state.objects.push((
            object,
            id.to_string(),
            props.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        ));
        id.to_string()
    }

    pub fn fail(&self, op: DestOp, err: SyncError) {
        self.state.lock().unwrap().failures.push((op, err));
    }

    pub fn calls(&self) -> Vec<DestCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn objects(&self, object: ObjectType) -> Vec<(String, BTreeMap<String, String>)> {
        self.state
            .lock()
            .unwrap()
            .objects
            .iter()
            .filter(|(o, _, _)| *o == object)
            .map(|(_, id, props)| (id.clone(), props.clone()))
            .collect()
    }

    pub fn associations(&self) -> Vec<(AssociationKind, String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DestCall::Associate { kind, from, to } => Some((kind, from, to)),
                _ => None,
            })
            .collect()
    }

    /// Property names searched on, in call order.
    pub fn searched_properties(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DestCall::Search { groups, .. } => Some(groups),
                _ => None,
            })
            .flat_map(|groups| groups.into_iter().flat_map(|g| g.filters))
            .map(|f| f.property_name)
            .collect()
    }

    pub fn writes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, DestCall::Create { .. } | DestCall::Update { .. }))
            .count()
    }

    fn failure(state: &DestState, op: &DestOp) -> Option<SyncError> {
        state
            .failures
            .iter()
            .find(|(o, _)| o == op)
            .map(|(_, e)| e.clone())
    }
}

#[async_trait]
impl DestinationCrm for FakeDestination {
    async fn search(&self, object: ObjectType, groups: Vec<FilterGroup>) -> Result<SearchResult, SyncError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DestCall::Search {
            object,
            groups: groups.clone(),
        });
        for group in &groups {
            for filter in &group.filters {
                let op = DestOp::Search(object, filter.property_name.clone());
                if let Some(err) = Self::failure(&state, &op) {
                    return Err(err);
                }
            }
        }
        let results: Vec<DestinationRecord> = state
            .objects
            .iter()
            .filter(|(o, _, props)| {
                *o == object
                    && groups.iter().any(|g| {
                        g.filters
                            .iter()
                            .all(|f| props.get(&f.property_name) == Some(&f.value))
                    })
            })
            .map(|(_, id, props)| DestinationRecord {
                id: id.clone(),
                properties: props
                    .iter()
                    .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
                    .collect(),
            })
            .collect();
        Ok(SearchResult {
            total: results.len() as u64,
            results,
        })
    }

    async fn create(&self, object: ObjectType, properties: &PropertySet) -> Result<String, SyncError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DestCall::Create {
            object,
            properties: properties.clone(),
        });
        if let Some(err) = Self::failure(&state, &DestOp::Create(object)) {
            return Err(err);
        }
        state.next_id += 1;
        let id = format!("hs-{}-{}", object.path_segment(), state.next_id);
        let props = properties.iter().map(|(k, v)| (k.clone(), text_value(v))).collect();
        state.objects.push((object, id.clone(), props));
        Ok(id)
    }

    async fn update(&self, object: ObjectType, id: &str, properties: &PropertySet) -> Result<(), SyncError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DestCall::Update {
            object,
            id: id.to_string(),
            properties: properties.clone(),
        });
        if let Some(err) = Self::failure(&state, &DestOp::Update(object)) {
            return Err(err);
        }
        let Some((_, _, props)) = state
            .objects
            .iter_mut()
            .find(|(o, existing, _)| *o == object && existing == id)
        else {
            return Err(SyncError::NotFound { what: id.to_string() });
        };
        for (k, v) in properties.iter() {
            props.insert(k.clone(), text_value(v));
        }
        Ok(())
    }

    async fn associate(&self, kind: AssociationKind, from_id: &str, to_id: &str) -> Result<(), SyncError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DestCall::Associate {
            kind,
            from: from_id.to_string(),
            to: to_id.to_string(),
        });
        match Self::failure(&state, &DestOp::Associate(kind)) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
struct SourceState {
    contacts: BTreeMap<String, Contact>,
    companies: HashMap<String, Company>,
    deals: Vec<Deal>,
    phases: Vec<DealPhase>,
    pipelines: Vec<Pipeline>,
    users: Vec<User>,
    failing_details: HashMap<String, SyncError>,
    failing_listing: Option<SyncError>,
    failing_related: HashMap<String, SyncError>,
    calls: Vec<String>,
}

/// Source double; contacts list in id order, deals in insertion order.
#[derive(Debug, Default)]
pub struct FakeSource {
    state: Mutex<SourceState>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_contact(&self, contact: Contact) {
        self.state.lock().unwrap().contacts.insert(contact.id.clone(), contact);
    }

    pub fn add_company(&self, company: Company) {
        self.state.lock().unwrap().companies.insert(company.id.clone(), company);
    }

    pub fn add_deal(&self, deal: Deal) {
        self.state.lock().unwrap().deals.push(deal);
    }

    pub fn add_phase(&self, id: &str, name: &str) {
        self.state.lock().unwrap().phases.push(DealPhase {
            id: id.into(),
            name: name.into(),
        });
    }

    pub fn add_pipeline(&self, id: &str, name: &str) {
        self.state.lock().unwrap().pipelines.push(Pipeline {
            id: id.into(),
            name: name.into(),
        });
    }

    pub fn add_user(&self, user: User) {
        self.state.lock().unwrap().users.push(user);
    }

    pub fn fail_detail(&self, id: &str, err: SyncError) {
        self.state.lock().unwrap().failing_details.insert(id.into(), err);
    }

    pub fn fail_listing(&self, err: SyncError) {
        self.state.lock().unwrap().failing_listing = Some(err);
    }

    /// Fails the related-deal listing of one customer.
    pub fn fail_related(&self, customer_id: &str, err: SyncError) {
        self.state.lock().unwrap().failing_related.insert(customer_id.into(), err);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn detail<T>(
        &self,
        what: &str,
        id: &str,
        pick: impl FnOnce(&SourceState) -> Option<T>,
    ) -> Result<T, SyncError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{what}.info {id}"));
        if let Some(err) = state.failing_details.get(id) {
            return Err(err.clone());
        }
        pick(&state).ok_or_else(|| SyncError::NotFound {
            what: format!("{what} {id}"),
        })
    }
}

#[async_trait]
impl SourceCrm for FakeSource {
    async fn list_contacts(&self, page: &PageRequest) -> Result<Page<ContactSummary>, SyncError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("contacts.list".into());
        if let Some(err) = &state.failing_listing {
            return Err(err.clone());
        }
        let after = match &page.cursor {
            Some(PageCursor::After(id)) => Some(id.clone()),
            _ => None,
        };
        let remaining: Vec<ContactSummary> = state
            .contacts
            .values()
            .filter(|c| after.as_ref().map_or(true, |a| &c.id > a))
            .map(|c| ContactSummary {
                id: c.id.clone(),
                updated_at: c.updated_at,
            })
            .collect();
        let size = page.size as usize;
        let items: Vec<_> = remaining.iter().take(size).cloned().collect();
        let next = (remaining.len() > size)
            .then(|| items.last().map(|c| PageCursor::After(c.id.clone())))
            .flatten();
        Ok(Page { items, next })
    }

    async fn list_deals(&self, page: &PageRequest) -> Result<Page<Deal>, SyncError> {
        let mut state = self.state.lock().unwrap();
        let number = page.page_number();
        state.calls.push(format!("deals.list page {number}"));
        if let Some(err) = &state.failing_listing {
            return Err(err.clone());
        }
        let size = page.size as usize;
        let start = (number as usize - 1) * size;
        let items: Vec<Deal> = state.deals.iter().skip(start).take(size).cloned().collect();
        let next = (state.deals.len() > start + size).then(|| PageCursor::Number(number + 1));
        Ok(Page { items, next })
    }

    async fn contact(&self, id: &str) -> Result<Contact, SyncError> {
        self.detail("contacts", id, |s| s.contacts.get(id).cloned())
    }

    async fn company(&self, id: &str) -> Result<Company, SyncError> {
        self.detail("companies", id, |s| s.companies.get(id).cloned())
    }

    async fn user(&self, id: &str) -> Result<User, SyncError> {
        self.detail("users", id, |s| s.users.iter().find(|u| u.id == id).cloned())
    }

    async fn deals_for_customer(&self, customer_id: &str, kind: CustomerKind) -> Result<Vec<Deal>, SyncError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("deals.list {} {customer_id}", kind.as_str()));
        if let Some(err) = state.failing_related.get(customer_id) {
            return Err(err.clone());
        }
        Ok(state
            .deals
            .iter()
            .filter(|d| d.lead_customer().is_some_and(|c| c.id == customer_id && c.kind == kind))
            .cloned()
            .collect())
    }

    async fn deal_phases(&self, ids: &[String]) -> Result<Vec<DealPhase>, SyncError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("dealPhases.list".into());
        Ok(state.phases.iter().filter(|p| ids.contains(&p.id)).cloned().collect())
    }

    async fn pipelines(&self, ids: &[String]) -> Result<Vec<Pipeline>, SyncError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("dealPipelines.list".into());
        Ok(state.pipelines.iter().filter(|p| ids.contains(&p.id)).cloned().collect())
    }
}

pub fn contact(id: &str, emails: &[&str], updated_at: DateTime<Utc>) -> Contact {
    Contact {
        id: id.into(),
        first_name: Some("Test".into()),
        last_name: Some(id.to_uppercase()),
        emails: emails
            .iter()
            .enumerate()
            .map(|(i, e)| EmailAddress {
                kind: if i == 0 { "primary".into() } else { "secondary".into() },
                email: (*e).into(),
            })
            .collect(),
        telephones: Vec::new(),
        job_title: None,
        language: None,
        company: None,
        opt_out: false,
        updated_at: Some(updated_at),
    }
}

pub fn company(id: &str, name: &str, vat: Option<&str>, website: Option<&str>) -> Company {
    Company {
        id: id.into(),
        name: name.into(),
        vat_number: vat.map(Into::into),
        website: website.map(Into::into),
        address: None,
        addresses: Vec::new(),
    }
}

/// Deal whose lead customer is the given contact (or company when `company` is set).
pub fn deal(id: &str, title: &str, customer: &str, company: bool, updated_at: DateTime<Utc>) -> Deal {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "title": title,
        "status": "open",
        "lead": {"customer": {"type": if company { "company" } else { "contact" }, "id": customer}},
        "created_at": updated_at,
        "updated_at": updated_at
    }))
    .unwrap()
}
