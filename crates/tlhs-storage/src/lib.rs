//! HTTP plumbing shared by the remote API clients, plus the append-only action log.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::ACCEPT;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tlhs_core::{ActionRecord, Service, SyncDecision, SyncError};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug_span, info, warn, Instrument};

pub const CRATE_NAME: &str = "tlhs-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: Some(format!("tlhs/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

/// Maps a non-success status onto the sync error taxonomy.
pub fn classify_status(service: Service, status: StatusCode, url: &str, body: Option<JsonValue>) -> SyncError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::AuthExpired { service },
        StatusCode::NOT_FOUND => SyncError::NotFound {
            what: url.to_string(),
        },
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            SyncError::ValidationRejected {
                service,
                status: status.as_u16(),
                body,
            }
        }
        _ => SyncError::RemoteUnavailable {
            service,
            message: format!("http status {status} for {url}"),
            body,
        },
    }
}

pub fn classify_reqwest_error(service: Service, err: &reqwest::Error) -> SyncError {
    let message = if err.is_timeout() {
        format!("request timed out: {err}")
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        err.to_string()
    };
    SyncError::RemoteUnavailable {
        service,
        message,
        body: None,
    }
}

/// Bearer-authenticated JSON client bound to one remote API base URL.
#[derive(Debug, Clone)]
pub struct JsonApi {
    client: reqwest::Client,
    base_url: String,
    service: Service,
}

impl JsonApi {
    pub fn new(service: Service, base_url: impl Into<String>, config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn call_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        token: &str,
        body: Option<JsonValue>,
    ) -> Result<T, SyncError> {
        let bytes = self.execute(method, path, Some(token), body).await?;
        self.decode(path, &bytes)
    }

    /// Same as [`call_json`](Self::call_json) but ignores the response body.
    pub async fn call(&self, method: Method, path: &str, token: &str, body: Option<JsonValue>) -> Result<(), SyncError> {
        self.execute(method, path, Some(token), body).await.map(|_| ())
    }

    /// Unauthenticated form POST, used by the OAuth2 token exchange.
    pub async fn post_form<T: DeserializeOwned>(&self, path: &str, form: &[(&str, &str)]) -> Result<T, SyncError> {
        let url = self.url(path);
        let request = self.client.post(&url).header(ACCEPT, "application/json").form(form);
        let bytes = self.dispatch(request, &url).await?;
        self.decode(path, &bytes)
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<JsonValue>,
    ) -> Result<Vec<u8>, SyncError> {
        let url = self.url(path);
        let span = debug_span!(
            "api_call",
            service = %self.service,
            method = method.as_str(),
            url = url.as_str()
        );
        let mut request = self
            .client
            .request(method, &url)
            .header(ACCEPT, "application/json");
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        self.dispatch(request, &url).instrument(span).await
    }

    async fn dispatch(&self, request: reqwest::RequestBuilder, url: &str) -> Result<Vec<u8>, SyncError> {
        let response = request
            .send()
            .await
            .map_err(|e| classify_reqwest_error(self.service, &e))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(self.service, &e))?;

        if status.is_success() {
            return Ok(bytes.to_vec());
        }

        let body = if bytes.is_empty() {
            None
        } else {
            Some(
                serde_json::from_slice::<JsonValue>(&bytes)
                    .unwrap_or_else(|_| JsonValue::String(String::from_utf8_lossy(&bytes).into_owned())),
            )
        };
        Err(classify_status(self.service, status, url, body))
    }

    fn decode<T: DeserializeOwned>(&self, path: &str, bytes: &[u8]) -> Result<T, SyncError> {
        let bytes = if bytes.is_empty() { b"null".as_slice() } else { bytes };
        serde_json::from_slice(bytes).map_err(|e| SyncError::RemoteUnavailable {
            service: self.service,
            message: format!("decoding response from {path}: {e}"),
            body: None,
        })
    }
}

#[derive(Debug)]
enum LogSink {
    Jsonl(PathBuf),
    Memory(Mutex<Vec<ActionRecord>>),
}

/// Append-only record of every reconciliation decision.
///
/// Records are mirrored as `tracing` events. The JSONL sink is written in
/// call order; callers process entities sequentially, so no extra locking
/// is needed around the file.
#[derive(Debug)]
pub struct ActionLog {
    sink: LogSink,
}

impl ActionLog {
    pub fn jsonl(path: impl Into<PathBuf>) -> Self {
        Self {
            sink: LogSink::Jsonl(path.into()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            sink: LogSink::Memory(Mutex::new(Vec::new())),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.sink {
            LogSink::Jsonl(path) => Some(path),
            LogSink::Memory(_) => None,
        }
    }

    pub async fn append(&self, record: &ActionRecord) -> anyhow::Result<()> {
        if record.action == SyncDecision::Error {
            warn!(
                entity = %record.entity,
                id = %record.id,
                action = %record.action,
                error = ?record.error,
                "{}",
                record.message
            );
        } else {
            info!(entity = %record.entity, id = %record.id, action = %record.action, "{}", record.message);
        }

        match &self.sink {
            LogSink::Jsonl(path) => {
                let mut line = serde_json::to_vec(record).context("serializing action record")?;
                line.push(b'\n');
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("creating log directory {}", parent.display()))?;
                }
                let mut file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .with_context(|| format!("opening action log {}", path.display()))?;
                file.write_all(&line)
                    .await
                    .with_context(|| format!("appending to action log {}", path.display()))?;
                file.flush()
                    .await
                    .with_context(|| format!("flushing action log {}", path.display()))?;
            }
            LogSink::Memory(entries) => {
                entries
                    .lock()
                    .map_err(|_| anyhow::anyhow!("action log mutex poisoned"))?
                    .push(record.clone());
            }
        }
        Ok(())
    }

    /// Everything recorded so far, read back from whichever sink is in use.
    pub async fn records(&self) -> anyhow::Result<Vec<ActionRecord>> {
        match &self.sink {
            LogSink::Jsonl(path) => read_action_log(path).await,
            LogSink::Memory(entries) => Ok(entries
                .lock()
                .map_err(|_| anyhow::anyhow!("action log mutex poisoned"))?
                .clone()),
        }
    }
}

/// Reads a JSONL action log; malformed lines are skipped with a warning.
pub async fn read_action_log(path: impl AsRef<Path>) -> anyhow::Result<Vec<ActionRecord>> {
    let path = path.as_ref();
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking action log {}", path.display()))?
    {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading action log {}", path.display()))?;
    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ActionRecord>(line) {
            Ok(record) => out.push(record),
            Err(err) => warn!(line = idx + 1, %err, "skipping malformed action log line"),
        }
    }
    Ok(out)
}
