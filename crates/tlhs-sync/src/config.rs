use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tlhs_adapters::{hubspot, teamleader};
use tlhs_storage::HttpClientConfig;

/// Which source listing drives a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    Contacts,
    Deals,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contacts => "contacts",
            Self::Deals => "deals",
        }
    }
}

impl FromStr for SyncMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "contacts" | "contact" => Ok(Self::Contacts),
            "deals" | "deal" => Ok(Self::Deals),
            other => anyhow::bail!("unknown sync mode `{other}` (expected `contacts` or `deals`)"),
        }
    }
}

/// Responsible-user email (lowercased) to destination owner id.
pub type OwnerMap = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub hubspot_token: String,
    /// Pre-issued source bearer token for runs started without the OAuth2 callback.
    pub teamleader_token: Option<String>,
    pub teamleader_api_url: String,
    pub teamleader_auth_url: String,
    pub hubspot_api_url: String,
    pub records_per_page: u32,
    pub page_delay: Duration,
    pub mode: SyncMode,
    pub start_page: Option<u32>,
    pub total_pages: Option<u32>,
    pub http_timeout_secs: u64,
    pub log_path: PathBuf,
    pub deal_title_fallback: bool,
    pub owner_map: OwnerMap,
    pub port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            client_id: text("CLIENT_ID", ""),
            client_secret: text("CLIENT_SECRET", ""),
            redirect_uri: text("REDIRECT_URI", "http://localhost:3000/callback"),
            hubspot_token: text("HUBSPOT_TOKEN", ""),
            teamleader_token: lookup("TEAMLEADER_TOKEN").filter(|v| !v.trim().is_empty()),
            teamleader_api_url: text("TEAMLEADER_API_URL", teamleader::DEFAULT_API_URL),
            teamleader_auth_url: text("TEAMLEADER_AUTH_URL", teamleader::DEFAULT_AUTH_URL),
            hubspot_api_url: text("HUBSPOT_API_URL", hubspot::DEFAULT_API_URL),
            records_per_page: number("RECORDS_PER_PAGE")
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(20),
            page_delay: Duration::from_secs(number("SYNC_PAGE_DELAY_SECS").unwrap_or(30)),
            mode: lookup("SYNC_MODE")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            start_page: number("START_PAGE")
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0),
            total_pages: number("TOTAL_PAGES")
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0),
            http_timeout_secs: number("HTTP_TIMEOUT_SECS").unwrap_or(60),
            log_path: lookup("SYNC_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sync-log.jsonl")),
            deal_title_fallback: lookup("DEAL_TITLE_FALLBACK")
                .map(|v| !matches!(v.trim(), "0" | "false" | "FALSE" | "False" | "no"))
                .unwrap_or(true),
            owner_map: lookup("HUBSPOT_OWNER_MAP")
                .map(|v| parse_owner_map(&v))
                .unwrap_or_default(),
            port: number("PORT")
                .and_then(|v| u16::try_from(v).ok())
                .unwrap_or(3000),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            ..Default::default()
        }
    }
}

/// Parses `email=ownerId,email=ownerId`; malformed pairs are ignored.
pub fn parse_owner_map(raw: &str) -> OwnerMap {
    raw.split(',')
        .filter_map(|pair| {
            let (email, owner) = pair.split_once('=')?;
            let email = email.trim().to_ascii_lowercase();
            let owner = owner.trim();
            (!email.is_empty() && !owner.is_empty()).then(|| (email, owner.to_string()))
        })
        .collect()
}
