//! Teamleader Focus client (source side) and its OAuth2 authorization-code exchange.

use std::future::Future;

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tlhs_core::{Company, Contact, ContactSummary, CustomerKind, Deal, DealPhase, Pipeline, Service, SyncError, User};
use tlhs_storage::{HttpClientConfig, JsonApi};
use tracing::debug;

use crate::{Credential, Page, PageCursor, PageRequest, SourceCrm};

pub const DEFAULT_API_URL: &str = "https://api.focus.teamleader.eu";
pub const DEFAULT_AUTH_URL: &str = "https://focus.teamleader.eu";
pub const OAUTH_SCOPES: &str = "companies contacts deals users";

/// Page size for related-deal listings of a single customer.
const RELATED_DEALS_PAGE_SIZE: u32 = 100;

/// `{data: [...]}` envelope of `*.list` endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: Option<bool>,
}

/// `{data: {...}}` envelope of `*.info` endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct InfoResponse<T> {
    pub data: T,
}

/// Whether a listing that returned `fetched` items has another page.
pub fn has_more(size: u32, fetched: usize, reported: Option<bool>) -> bool {
    reported.unwrap_or(fetched > 0 && fetched >= size as usize)
}

/// Walks numbered pages from 1 until the listing reports no further page.
pub async fn collect_numbered_pages<T, F, Fut>(size: u32, mut fetch: F) -> Result<Vec<T>, SyncError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<ListResponse<T>, SyncError>>,
{
    let mut items = Vec::new();
    let mut number = 1;
    loop {
        let response = fetch(number).await?;
        let fetched = response.data.len();
        items.extend(response.data);
        if fetched == 0 || !has_more(size, fetched, response.has_more) {
            return Ok(items);
        }
        number += 1;
    }
}

#[derive(Debug, Clone)]
pub struct TeamleaderClient {
    api: JsonApi,
    credential: Credential,
}

impl TeamleaderClient {
    pub fn new(base_url: &str, credential: Credential, http: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            api: JsonApi::new(Service::Teamleader, base_url, http)?,
            credential,
        })
    }

    async fn post<T: DeserializeOwned>(&self, endpoint: &str, body: JsonValue) -> Result<T, SyncError> {
        let token = self.credential.require().await?;
        self.api.call_json(Method::POST, endpoint, &token, Some(body)).await
    }

    async fn info<T: DeserializeOwned>(&self, endpoint: &str, id: &str) -> Result<T, SyncError> {
        let response: InfoResponse<T> = self.post(endpoint, json!({ "id": id })).await?;
        Ok(response.data)
    }

    async fn list_by_ids<T: DeserializeOwned>(&self, endpoint: &str, ids: &[String]) -> Result<Vec<T>, SyncError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let response: ListResponse<T> = self
            .post(
                endpoint,
                json!({
                    "filter": { "ids": ids },
                    "page": { "size": ids.len(), "number": 1 }
                }),
            )
            .await?;
        Ok(response.data)
    }
}

#[async_trait]
impl SourceCrm for TeamleaderClient {
    async fn list_contacts(&self, page: &PageRequest) -> Result<Page<ContactSummary>, SyncError> {
        let mut page_body = json!({ "size": page.size });
        if let Some(PageCursor::After(id)) = &page.cursor {
            page_body["starting_after"] = json!(id);
        }
        let response: ListResponse<ContactSummary> = self.post("contacts.list", json!({ "page": page_body })).await?;
        debug!(count = response.data.len(), "listed contacts");

        let next = if has_more(page.size, response.data.len(), response.has_more) {
            response.data.last().map(|c| PageCursor::After(c.id.clone()))
        } else {
            None
        };
        Ok(Page {
            items: response.data,
            next,
        })
    }

    async fn list_deals(&self, page: &PageRequest) -> Result<Page<Deal>, SyncError> {
        let number = page.page_number();
        let response: ListResponse<Deal> = self
            .post(
                "deals.list",
                json!({
                    "filter": {},
                    "page": { "size": page.size, "number": number },
                    "sort": [{ "field": "created_at", "order": "desc" }]
                }),
            )
            .await?;
        debug!(count = response.data.len(), page = number, "listed deals");

        let next = has_more(page.size, response.data.len(), response.has_more)
            .then(|| PageCursor::Number(number + 1));
        Ok(Page {
            items: response.data,
            next,
        })
    }

    async fn contact(&self, id: &str) -> Result<Contact, SyncError> {
        self.info("contacts.info", id).await
    }

    async fn company(&self, id: &str) -> Result<Company, SyncError> {
        self.info("companies.info", id).await
    }

    async fn user(&self, id: &str) -> Result<User, SyncError> {
        self.info("users.info", id).await
    }

    async fn deals_for_customer(&self, customer_id: &str, kind: CustomerKind) -> Result<Vec<Deal>, SyncError> {
        let deals = collect_numbered_pages(RELATED_DEALS_PAGE_SIZE, |number| {
            self.post::<ListResponse<Deal>>(
                "deals.list",
                json!({
                    "filter": { "customer": { "id": customer_id, "type": kind.as_str() } },
                    "page": { "size": RELATED_DEALS_PAGE_SIZE, "number": number }
                }),
            )
        })
        .await?;
        debug!(customer = customer_id, kind = kind.as_str(), count = deals.len(), "listed related deals");
        Ok(deals)
    }

    async fn deal_phases(&self, ids: &[String]) -> Result<Vec<DealPhase>, SyncError> {
        self.list_by_ids("dealPhases.list", ids).await
    }

    async fn pipelines(&self, ids: &[String]) -> Result<Vec<Pipeline>, SyncError> {
        self.list_by_ids("dealPipelines.list", ids).await
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
}

/// OAuth2 authorization-code flow against the Teamleader identity host.
#[derive(Debug, Clone)]
pub struct TeamleaderOAuth {
    auth: JsonApi,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

impl TeamleaderOAuth {
    pub fn new(
        auth_base_url: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
        http: &HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            auth: JsonApi::new(Service::Teamleader, auth_base_url, http)?,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
        })
    }

    pub fn authorize_url(&self) -> anyhow::Result<String> {
        let url = Url::parse_with_params(
            &self.auth.url("oauth2/authorize"),
            &[
                ("response_type", "code"),
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("scope", OAUTH_SCOPES),
            ],
        )?;
        Ok(url.to_string())
    }

    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant, SyncError> {
        self.auth
            .post_form(
                "oauth2/access_token",
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("client_id", self.client_id.as_str()),
                    ("client_secret", self.client_secret.as_str()),
                    ("redirect_uri", self.redirect_uri.as_str()),
                ],
            )
            .await
    }
}
