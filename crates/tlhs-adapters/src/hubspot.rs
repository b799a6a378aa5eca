//! HubSpot CRM v3 client (destination side).

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tlhs_core::{AssociationKind, FilterGroup, ObjectType, PropertySet, SearchResult, Service, SyncError};
use tlhs_storage::{HttpClientConfig, JsonApi};

use crate::DestinationCrm;

pub const DEFAULT_API_URL: &str = "https://api.hubapi.com";

/// Properties requested back from searches, per object type.
fn search_properties(object: ObjectType) -> &'static [&'static str] {
    match object {
        ObjectType::Contacts => &["email", "firstname", "lastname"],
        ObjectType::Companies => &["name", "vat_number", "domain"],
        ObjectType::Deals => &["dealname", "teamleader_id"],
    }
}

#[derive(Debug, Deserialize)]
struct CreatedObject {
    id: String,
}

#[derive(Debug, Clone)]
pub struct HubSpotClient {
    api: JsonApi,
    token: String,
}

impl HubSpotClient {
    pub fn new(base_url: &str, token: impl Into<String>, http: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            api: JsonApi::new(Service::Hubspot, base_url, http)?,
            token: token.into(),
        })
    }

    fn objects_path(object: ObjectType) -> String {
        format!("crm/v3/objects/{}", object.path_segment())
    }

    pub fn association_path(kind: AssociationKind, from_id: &str, to_id: &str) -> String {
        format!(
            "crm/v3/objects/{}/{}/associations/{}/{}/{}",
            kind.from_object().path_segment(),
            from_id,
            kind.to_object().path_segment(),
            to_id,
            kind.label()
        )
    }
}

#[async_trait]
impl DestinationCrm for HubSpotClient {
    async fn search(&self, object: ObjectType, groups: Vec<FilterGroup>) -> Result<SearchResult, SyncError> {
        let body = json!({
            "filterGroups": groups,
            "properties": search_properties(object),
            "limit": 10
        });
        self.api
            .call_json(
                Method::POST,
                &format!("{}/search", Self::objects_path(object)),
                &self.token,
                Some(body),
            )
            .await
    }

    async fn create(&self, object: ObjectType, properties: &PropertySet) -> Result<String, SyncError> {
        let created: CreatedObject = self
            .api
            .call_json(
                Method::POST,
                &Self::objects_path(object),
                &self.token,
                Some(json!({ "properties": properties })),
            )
            .await?;
        Ok(created.id)
    }

    async fn update(&self, object: ObjectType, id: &str, properties: &PropertySet) -> Result<(), SyncError> {
        self.api
            .call(
                Method::PATCH,
                &format!("{}/{}", Self::objects_path(object), id),
                &self.token,
                Some(json!({ "properties": properties })),
            )
            .await
    }

    async fn associate(&self, kind: AssociationKind, from_id: &str, to_id: &str) -> Result<(), SyncError> {
        self.api
            .call(
                Method::PUT,
                &Self::association_path(kind, from_id, to_id),
                &self.token,
                Some(json!({})),
            )
            .await
    }
}
