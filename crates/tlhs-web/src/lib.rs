//! Axum control surface: OAuth2 callback, sync trigger and status, plus a one-page interface.

use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tlhs_core::SyncError;
use tlhs_sync::{spawn_run, RunSummary, SyncConfig, SyncRuntime, TriggerOutcome};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "tlhs-web";

#[derive(Clone)]
pub struct AppState {
    pub runtime: SyncRuntime,
}

impl AppState {
    pub fn new(runtime: SyncRuntime) -> Self {
        Self { runtime }
    }
}

#[derive(Debug, Deserialize, Default)]
struct CallbackQuery {
    code: Option<String>,
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    status: TriggerOutcome,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    syncing: bool,
    last_run: Option<RunSummary>,
}

#[derive(Template)]
#[template(path = "interface.html")]
struct InterfaceTemplate {
    mode: String,
    page_size: u32,
    log_path: String,
    status_text: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(authorize_handler))
        .route("/callback", get(callback_handler))
        .route("/interface", get(interface_handler))
        .route("/sync", post(sync_handler))
        .route("/sync-status", get(status_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let runtime = SyncRuntime::from_config(&config)?;
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "listening");
    axum::serve(listener, app(AppState::new(runtime))).await?;
    Ok(())
}

async fn authorize_handler(State(state): State<AppState>) -> Response {
    state.runtime.session.credential().clear().await;
    match state.runtime.oauth.authorize_url() {
        Ok(url) => Redirect::to(&url).into_response(),
        Err(err) => server_error(err),
    }
}

async fn callback_handler(State(state): State<AppState>, Query(query): Query<CallbackQuery>) -> Response {
    let Some(code) = query.code.filter(|c| !c.is_empty()) else {
        return (StatusCode::BAD_REQUEST, Html("Missing authorization code".to_string())).into_response();
    };
    match state.runtime.oauth.exchange_code(&code).await {
        Ok(grant) => {
            state.runtime.session.credential().set(grant.access_token).await;
            info!("source credential stored");
            Redirect::to("/interface").into_response()
        }
        Err(err) => {
            warn!(error = %err, "authorization code exchange failed");
            (
                StatusCode::BAD_GATEWAY,
                Html(format!("Authorization failed: {err}")),
            )
                .into_response()
        }
    }
}

async fn interface_handler(State(state): State<AppState>) -> Response {
    let driver = &state.runtime.driver;
    let status_text = if state.runtime.session.is_running() {
        "Sync running...".to_string()
    } else {
        match state.runtime.session.last_run().await {
            Some(run) => format!("Last run {}: {:?} after {} page(s)", run.run_id, run.outcome, run.pages),
            None => "No sync has run yet.".to_string(),
        }
    };
    render_html(InterfaceTemplate {
        mode: driver.options().mode.as_str().to_string(),
        page_size: driver.options().page_size,
        log_path: driver
            .log_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "in memory".to_string()),
        status_text,
    })
}

async fn sync_handler(State(state): State<AppState>) -> Response {
    match spawn_run(&state.runtime.session, &state.runtime.driver).await {
        Ok(status) => Json(TriggerResponse { status }).into_response(),
        Err(SyncError::AuthMissing) => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "no source credential; authorize first" })),
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "sync trigger failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        syncing: state.runtime.session.is_running(),
        last_run: state.runtime.session.last_run().await,
    })
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
