//! Core domain model for the Teamleader → HubSpot sync: source entities,
//! destination payloads, reconciliation decisions and the error taxonomy.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tlhs-core";

/// Destination properties that are owned by marketing attribution and must never be written.
pub const PROTECTED_PROPERTIES: [&str; 2] = ["eerste_bron", "laatste_bron"];

// ---------------------------------------------------------------------------
// Source (Teamleader) entities
// ---------------------------------------------------------------------------

/// `{type, id}` pointer as used throughout the source API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EmailAddress {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Telephone {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Row returned by the contact listing; details are fetched separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactSummary {
    pub id: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub emails: Vec<EmailAddress>,
    #[serde(default)]
    pub telephones: Vec<Telephone>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub company: Option<CompanyRef>,
    #[serde(default)]
    pub opt_out: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Contact {
    /// Every usable email address, trimmed and lowercased, primary addresses first.
    ///
    /// Duplicates are kept so callers can reject contacts that list the same address twice.
    pub fn normalized_emails(&self) -> Vec<String> {
        let (primary, other): (Vec<_>, Vec<_>) = self
            .emails
            .iter()
            .partition(|e| e.kind.eq_ignore_ascii_case("primary"));
        primary
            .into_iter()
            .chain(other)
            .map(|e| e.email.trim().to_ascii_lowercase())
            .filter(|e| e.contains('@'))
            .collect()
    }

    pub fn first_phone(&self) -> Option<&str> {
        self.telephones
            .iter()
            .map(|t| t.number.trim())
            .find(|n| !n.is_empty())
    }

    pub fn company_id(&self) -> Option<&str> {
        self.company.as_ref().map(|c| c.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Address {
    #[serde(default, alias = "line1")]
    pub line_1: Option<String>,
    #[serde(default, alias = "locality")]
    pub city: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressEntry {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vat_number: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default)]
    pub addresses: Vec<AddressEntry>,
}

impl Company {
    /// Flat `address` if present, otherwise the primary (or first) structured address.
    pub fn primary_address(&self) -> Option<&Address> {
        self.address.as_ref().or_else(|| {
            self.addresses
                .iter()
                .find(|a| a.kind.eq_ignore_ascii_case("primary"))
                .or_else(|| self.addresses.first())
                .map(|a| &a.address)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DealStatus {
    #[default]
    Open,
    Won,
    Lost,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Money {
    pub amount: f64,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DealLead {
    #[serde(default)]
    pub customer: Option<EntityRef>,
    #[serde(default)]
    pub contact_person: Option<EntityRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CustomerKind {
    Contact,
    Company,
}

impl CustomerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contact => "contact",
            Self::Company => "company",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadCustomer<'a> {
    pub id: &'a str,
    pub kind: CustomerKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub status: DealStatus,
    #[serde(default)]
    pub estimated_value: Option<Money>,
    #[serde(default)]
    pub current_phase: Option<EntityRef>,
    #[serde(default)]
    pub pipeline: Option<EntityRef>,
    #[serde(default)]
    pub responsible_user: Option<EntityRef>,
    #[serde(default)]
    pub lead: DealLead,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Deal {
    pub fn lead_customer(&self) -> Option<LeadCustomer<'_>> {
        let customer = self.lead.customer.as_ref()?;
        let kind = match customer.kind.as_deref() {
            Some("company") => CustomerKind::Company,
            Some("contact") => CustomerKind::Contact,
            _ => return None,
        };
        Some(LeadCustomer {
            id: &customer.id,
            kind,
        })
    }

    /// Contact person on the lead, falling back to the customer when it is a contact.
    pub fn contact_id(&self) -> Option<&str> {
        if let Some(person) = &self.lead.contact_person {
            return Some(&person.id);
        }
        self.lead_customer()
            .filter(|c| c.kind == CustomerKind::Contact)
            .map(|c| c.id)
    }

    pub fn company_id(&self) -> Option<&str> {
        self.lead_customer()
            .filter(|c| c.kind == CustomerKind::Company)
            .map(|c| c.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealPhase {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// A deal together with the related entities resolved by the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedDeal {
    pub deal: Deal,
    pub phase_name: Option<String>,
    pub pipeline_name: Option<String>,
    pub responsible_user: Option<User>,
    /// Other deals known for the same customer.
    pub sibling_deals: usize,
}

impl EnrichedDeal {
    pub fn bare(deal: Deal) -> Self {
        Self {
            deal,
            phase_name: None,
            pipeline_name: None,
            responsible_user: None,
            sibling_deals: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Destination (HubSpot) payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Contacts,
    Companies,
    Deals,
}

impl ObjectType {
    pub fn path_segment(self) -> &'static str {
        match self {
            Self::Contacts => "contacts",
            Self::Companies => "companies",
            Self::Deals => "deals",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Outgoing destination properties, ordered for stable payloads.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertySet(BTreeMap<String, PropertyValue>);

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Inserts only when the value is present and not blank.
    pub fn insert_text(&mut self, key: &str, value: Option<&str>) {
        if let Some(v) = value.map(str::trim).filter(|v| !v.is_empty()) {
            self.insert(key, v);
        }
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.0.get(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(PropertyValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.0.iter()
    }

    pub fn strip_protected(mut self) -> Self {
        for key in PROTECTED_PROPERTIES {
            self.0.remove(key);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationRecord {
    pub id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub property_name: String,
    pub operator: String,
    pub value: String,
}

impl Filter {
    pub fn eq(property_name: &str, value: &str) -> Self {
        Self {
            property_name: property_name.to_string(),
            operator: "EQ".to_string(),
            value: value.to_string(),
        }
    }
}

/// Filters inside a group are AND-ed; groups are OR-ed by the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterGroup {
    pub filters: Vec<Filter>,
}

impl FilterGroup {
    pub fn single(filter: Filter) -> Self {
        Self {
            filters: vec![filter],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub results: Vec<DestinationRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationKind {
    ContactToCompany,
    CompanyToContact,
    DealToContact,
    DealToCompany,
}

impl AssociationKind {
    pub fn from_object(self) -> ObjectType {
        match self {
            Self::ContactToCompany => ObjectType::Contacts,
            Self::CompanyToContact => ObjectType::Companies,
            Self::DealToContact | Self::DealToCompany => ObjectType::Deals,
        }
    }

    pub fn to_object(self) -> ObjectType {
        match self {
            Self::ContactToCompany | Self::DealToCompany => ObjectType::Companies,
            Self::CompanyToContact | Self::DealToContact => ObjectType::Contacts,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::ContactToCompany => "contact_to_company",
            Self::CompanyToContact => "company_to_contact",
            Self::DealToContact => "deal_to_contact",
            Self::DealToCompany => "deal_to_company",
        }
    }
}

// ---------------------------------------------------------------------------
// Decisions and the action log record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Contact,
    Company,
    Deal,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Contact => "contact",
            Self::Company => "company",
            Self::Deal => "deal",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDecision {
    Created,
    Updated,
    SkippedNoEmail,
    SkippedDuplicateEmail,
    SkippedStale,
    SkippedNoMatch,
    SkippedNoLinkedContacts,
    Linked,
    Error,
}

impl SyncDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::SkippedNoEmail => "skipped_no_email",
            Self::SkippedDuplicateEmail => "skipped_duplicate_email",
            Self::SkippedStale => "skipped_stale",
            Self::SkippedNoMatch => "skipped_no_match",
            Self::SkippedNoLinkedContacts => "skipped_no_linked_contacts",
            Self::Linked => "linked",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SyncDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the append-only action log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub entity: EntityKind,
    pub id: String,
    pub action: SyncDecision,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonValue>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Teamleader,
    Hubspot,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Teamleader => "teamleader",
            Self::Hubspot => "hubspot",
        })
    }
}

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("no source credential held; authorize first")]
    AuthMissing,
    #[error("{service} rejected the bearer credential")]
    AuthExpired { service: Service },
    #[error("{service} unavailable: {message}")]
    RemoteUnavailable {
        service: Service,
        message: String,
        body: Option<JsonValue>,
    },
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("{service} rejected the payload (status {status})")]
    ValidationRejected {
        service: Service,
        status: u16,
        body: Option<JsonValue>,
    },
}

impl SyncError {
    /// Credential failures abort the whole run; everything else is entity-scoped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthMissing | Self::AuthExpired { .. })
    }

    /// Raw remote payload (or the message) for the action log.
    pub fn payload(&self) -> JsonValue {
        match self {
            Self::RemoteUnavailable {
                body: Some(body), ..
            }
            | Self::ValidationRejected {
                body: Some(body), ..
            } => body.clone(),
            other => JsonValue::String(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contact_emails_are_normalized_primary_first() {
        let contact: Contact = serde_json::from_value(serde_json::json!({
            "id": "c1",
            "emails": [
                {"type": "invoicing", "email": "Billing@Example.com "},
                {"type": "primary", "email": " Jane@Example.com"},
                {"type": "other", "email": "not-an-address"}
            ]
        }))
        .unwrap();
        assert_eq!(
            contact.normalized_emails(),
            vec!["jane@example.com".to_string(), "billing@example.com".to_string()]
        );
    }

    #[test]
    fn deal_lead_resolution() {
        let deal: Deal = serde_json::from_value(serde_json::json!({
            "id": "d1",
            "status": "won",
            "lead": {"customer": {"type": "company", "id": "co1"}, "contact_person": {"type": "contact", "id": "c9"}}
        }))
        .unwrap();
        assert_eq!(deal.status, DealStatus::Won);
        assert_eq!(deal.company_id(), Some("co1"));
        assert_eq!(deal.contact_id(), Some("c9"));

        let deal: Deal = serde_json::from_value(serde_json::json!({
            "id": "d2",
            "status": "something-new",
            "lead": {"customer": {"type": "contact", "id": "c2"}}
        }))
        .unwrap();
        assert_eq!(deal.status, DealStatus::Unknown);
        assert_eq!(deal.company_id(), None);
        assert_eq!(deal.contact_id(), Some("c2"));
    }

    #[test]
    fn company_address_falls_back_to_structured_list() {
        let company: Company = serde_json::from_value(serde_json::json!({
            "id": "co1",
            "name": "Acme",
            "addresses": [{"type": "primary", "address": {"line_1": "Main 1", "city": "Gent", "country": "BE"}}]
        }))
        .unwrap();
        let address = company.primary_address().unwrap();
        assert_eq!(address.city.as_deref(), Some("Gent"));
        assert_eq!(address.line_1.as_deref(), Some("Main 1"));
    }

    #[test]
    fn protected_properties_are_stripped() {
        let mut props = PropertySet::new();
        props.insert("email", "a@x.com");
        props.insert("eerste_bron", "web");
        props.insert("laatste_bron", "ads");
        let props = props.strip_protected();
        assert_eq!(props.len(), 1);
        assert!(!props.contains_key("eerste_bron"));
    }

    #[test]
    fn action_record_serializes_as_jsonl_shape() {
        let record = ActionRecord {
            timestamp: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            run_id: None,
            entity: EntityKind::Contact,
            id: "c1".into(),
            action: SyncDecision::SkippedNoEmail,
            message: "No email".into(),
            error: None,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "contact");
        assert_eq!(value["action"], "skipped_no_email");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn only_auth_errors_are_fatal() {
        assert!(SyncError::AuthMissing.is_fatal());
        assert!(SyncError::AuthExpired {
            service: Service::Teamleader
        }
        .is_fatal());
        assert!(!SyncError::NotFound { what: "x".into() }.is_fatal());
    }
}
