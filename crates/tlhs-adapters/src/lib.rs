//! Remote CRM adapter contracts and their Teamleader / HubSpot implementations.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tlhs_core::{
    AssociationKind, Company, Contact, ContactSummary, CustomerKind, Deal, DealPhase, FilterGroup, ObjectType, Pipeline,
    PropertySet, SearchResult, SyncError, User,
};
use tokio::sync::RwLock;

pub mod hubspot;
pub mod teamleader;

pub use hubspot::HubSpotClient;
pub use teamleader::{TeamleaderClient, TeamleaderOAuth, TokenGrant};

pub const CRATE_NAME: &str = "tlhs-adapters";

/// Position in a paginated source listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageCursor {
    /// 1-based page number.
    Number(u32),
    /// Keyset cursor: continue after this entity id.
    After(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub size: u32,
    pub cursor: Option<PageCursor>,
}

impl PageRequest {
    pub fn first(size: u32) -> Self {
        Self { size, cursor: None }
    }

    pub fn page_number(&self) -> u32 {
        match self.cursor {
            Some(PageCursor::Number(n)) => n.max(1),
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<PageCursor>,
}

/// Shared handle to the source bearer credential.
///
/// Cloned into the fetcher and the web layer; the OAuth callback writes it,
/// every source call reads it.
#[derive(Debug, Clone, Default)]
pub struct Credential(Arc<RwLock<Option<String>>>);

impl Credential {
    pub fn new(token: Option<String>) -> Self {
        Self(Arc::new(RwLock::new(token.filter(|t| !t.is_empty()))))
    }

    pub async fn set(&self, token: impl Into<String>) {
        *self.0.write().await = Some(token.into());
    }

    pub async fn clear(&self) {
        *self.0.write().await = None;
    }

    pub async fn get(&self) -> Option<String> {
        self.0.read().await.clone()
    }

    pub async fn is_held(&self) -> bool {
        self.0.read().await.is_some()
    }

    pub async fn require(&self) -> Result<String, SyncError> {
        self.get().await.ok_or(SyncError::AuthMissing)
    }
}

/// Read-only access to the source CRM.
#[async_trait]
pub trait SourceCrm: Send + Sync {
    async fn list_contacts(&self, page: &PageRequest) -> Result<Page<ContactSummary>, SyncError>;

    async fn list_deals(&self, page: &PageRequest) -> Result<Page<Deal>, SyncError>;

    async fn contact(&self, id: &str) -> Result<Contact, SyncError>;

    async fn company(&self, id: &str) -> Result<Company, SyncError>;

    async fn user(&self, id: &str) -> Result<User, SyncError>;

    /// Every deal whose lead customer is the given contact or company.
    async fn deals_for_customer(&self, customer_id: &str, kind: CustomerKind) -> Result<Vec<Deal>, SyncError>;

    async fn deal_phases(&self, ids: &[String]) -> Result<Vec<DealPhase>, SyncError>;

    async fn pipelines(&self, ids: &[String]) -> Result<Vec<Pipeline>, SyncError>;
}

/// Write access to the destination CRM.
#[async_trait]
pub trait DestinationCrm: Send + Sync {
    async fn search(&self, object: ObjectType, groups: Vec<FilterGroup>) -> Result<SearchResult, SyncError>;

    async fn create(&self, object: ObjectType, properties: &PropertySet) -> Result<String, SyncError>;

    async fn update(&self, object: ObjectType, id: &str, properties: &PropertySet) -> Result<(), SyncError>;

    async fn associate(&self, kind: AssociationKind, from_id: &str, to_id: &str) -> Result<(), SyncError>;
}
