//! Pure transforms from source entities to destination property sets.

use chrono::{DateTime, Months, SecondsFormat, Utc};
use serde::Serialize;
use tlhs_core::{Company, Contact, DealStatus, EnrichedDeal, PropertySet};
use url::Url;

use crate::config::OwnerMap;

pub const FRESH_MONTHS: u32 = 24;
pub const AGING_MONTHS: u32 = 60;
pub const DEFAULT_DEAL_TITLE: &str = "No title";
pub const DEFAULT_PIPELINE: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgeClass {
    Fresh,
    Aging,
    Stale,
}

/// Buckets a record by how long ago it was last touched.
///
/// Both boundaries are inclusive: exactly 24 months old is still fresh and
/// exactly 60 months old is still aging. A record without a timestamp is stale.
pub fn classify_by_age(updated_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> AgeClass {
    let Some(updated_at) = updated_at else {
        return AgeClass::Stale;
    };
    let fresh_cutoff = now
        .checked_sub_months(Months::new(FRESH_MONTHS))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let aging_cutoff = now
        .checked_sub_months(Months::new(AGING_MONTHS))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    if updated_at >= fresh_cutoff {
        AgeClass::Fresh
    } else if updated_at >= aging_cutoff {
        AgeClass::Aging
    } else {
        AgeClass::Stale
    }
}

pub fn contact_properties(contact: &Contact, age: AgeClass) -> PropertySet {
    let mut props = PropertySet::new();
    if let Some(email) = contact.normalized_emails().into_iter().next() {
        props.insert("email", email);
    }
    props.insert_text("firstname", contact.first_name.as_deref());
    props.insert_text("lastname", contact.last_name.as_deref());
    props.insert_text("phone", contact.first_phone());
    props.insert_text("jobtitle", contact.job_title.as_deref());
    props.insert_text("hs_language", contact.language.as_deref());
    props.insert_text("company", contact.company.as_ref().and_then(|c| c.name.as_deref()));

    let marketable = !contact.opt_out && age == AgeClass::Fresh;
    props.insert("hs_marketable_status", marketable);
    if contact.opt_out {
        props.insert("hs_email_optout", true);
    }
    props.strip_protected()
}

const PHASE_STAGES: [(&str, &str); 7] = [
    ("new", "appointmentscheduled"),
    ("nieuw", "appointmentscheduled"),
    ("quote sent", "contractsent"),
    ("offerte verzonden", "contractsent"),
    ("contact after quote", "presentationscheduled"),
    ("contact na offerte", "presentationscheduled"),
    ("on hold", "decisionmakerboughtin"),
];

/// Destination pipeline stage from the phase name, falling back on the deal status.
pub fn stage_for(phase_name: Option<&str>, status: DealStatus) -> &'static str {
    if let Some(phase) = phase_name.map(str::to_lowercase) {
        for (needle, stage) in PHASE_STAGES {
            if phase.contains(needle) {
                return stage;
            }
        }
    }
    match status {
        DealStatus::Won => "closedwon",
        DealStatus::Lost => "closedlost",
        DealStatus::Open | DealStatus::Unknown => "appointmentscheduled",
    }
}

pub fn deal_status_label(age: AgeClass) -> Option<&'static str> {
    match age {
        AgeClass::Fresh => Some("active (<2y)"),
        AgeClass::Aging => Some("inactive (2-5y)"),
        AgeClass::Stale => None,
    }
}

/// Destination properties for a deal; `None` for stale deals, which are never written.
pub fn deal_properties(enriched: &EnrichedDeal, age: AgeClass, owners: &OwnerMap) -> Option<PropertySet> {
    let label = deal_status_label(age)?;
    let deal = &enriched.deal;

    let mut props = PropertySet::new();
    let title = deal
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_DEAL_TITLE);
    props.insert("dealname", title);
    props.insert("amount", deal.estimated_value.as_ref().map(|m| m.amount).unwrap_or(0.0));
    props.insert("dealstage", stage_for(enriched.phase_name.as_deref(), deal.status));
    props.insert("pipeline", DEFAULT_PIPELINE);
    props.insert("deal_status", label);
    if let Some(created_at) = deal.created_at {
        props.insert("closedate", created_at.to_rfc3339_opts(SecondsFormat::Millis, true));
    }
    props.insert("teamleader_id", deal.id.as_str());
    props.insert_text("description", deal.summary.as_deref());
    props.insert(
        "dealtype",
        if enriched.sibling_deals > 0 {
            "existingbusiness"
        } else {
            "newbusiness"
        },
    );
    props.insert_text("teamleader_pipeline", enriched.pipeline_name.as_deref());

    let owner = enriched
        .responsible_user
        .as_ref()
        .and_then(|u| u.email.as_deref())
        .and_then(|email| owners.get(&email.trim().to_ascii_lowercase()));
    props.insert_text("hubspot_owner_id", owner.map(String::as_str));

    Some(props.strip_protected())
}

pub fn company_properties(company: &Company) -> PropertySet {
    let mut props = PropertySet::new();
    props.insert_text("name", Some(company.name.as_str()));
    props.insert_text("vat_number", company.vat_number.as_deref());
    props.insert_text("domain", company.website.as_deref().and_then(normalize_domain).as_deref());
    if let Some(address) = company.primary_address() {
        props.insert_text("city", address.city.as_deref());
        props.insert_text("address", address.line_1.as_deref());
        props.insert_text("country", address.country.as_deref());
    }
    props.strip_protected()
}

/// Reduces a website to its bare host: `https://www.Acme.be/nl?x` becomes `acme.be`.
///
/// Websites without a scheme are read as `https`. IP hosts and single-label
/// hosts yield `None`.
pub fn normalize_domain(website: &str) -> Option<String> {
    let website = website.trim();
    if website.is_empty() {
        return None;
    }
    let parsed = if website.contains("://") {
        Url::parse(website)
    } else {
        Url::parse(&format!("https://{website}"))
    }
    .ok()?;
    let host = parsed.domain()?.trim_end_matches('.').to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    host.contains('.').then(|| host.to_string())
}
