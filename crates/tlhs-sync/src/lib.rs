//! Teamleader to HubSpot reconciliation: mapping, matching, linking and the paged run driver.

use std::sync::Arc;

use anyhow::{Context, Result};
use tlhs_adapters::{Credential, HubSpotClient, TeamleaderClient, TeamleaderOAuth};
use tlhs_storage::ActionLog;
use tracing::info;

pub mod config;
pub mod driver;
pub mod enrich;
pub mod journal;
pub mod linker;
pub mod mapper;
pub mod matcher;
pub mod reconciler;
pub mod report;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{parse_owner_map, OwnerMap, SyncConfig, SyncMode};
pub use driver::{DriverOptions, RunOutcome, RunSummary, SyncDriver};
pub use enrich::DealEnricher;
pub use journal::RunJournal;
pub use linker::AssociationLinker;
pub use mapper::{classify_by_age, AgeClass};
pub use matcher::{DestinationMatcher, Lookup};
pub use reconciler::{ReconcileOptions, Reconciler};
pub use report::{report_from_log, report_markdown};
pub use session::{spawn_run, RunGuard, SessionContext, TriggerOutcome};

pub const CRATE_NAME: &str = "tlhs-sync";

/// Everything a process needs to serve or run syncs, wired from one config.
#[derive(Clone)]
pub struct SyncRuntime {
    pub session: Arc<SessionContext>,
    pub driver: Arc<SyncDriver>,
    pub oauth: Arc<TeamleaderOAuth>,
}

impl SyncRuntime {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let http = config.http_config();
        let credential = Credential::new(config.teamleader_token.clone());
        let source = TeamleaderClient::new(&config.teamleader_api_url, credential.clone(), &http)
            .context("building teamleader client")?;
        let destination = HubSpotClient::new(&config.hubspot_api_url, config.hubspot_token.clone(), &http)
            .context("building hubspot client")?;
        let oauth = TeamleaderOAuth::new(
            &config.teamleader_auth_url,
            config.client_id.clone(),
            config.client_secret.clone(),
            config.redirect_uri.clone(),
            &http,
        )
        .context("building oauth client")?;

        let driver = SyncDriver::new(
            Arc::new(source),
            Arc::new(destination),
            Arc::new(ActionLog::jsonl(&config.log_path)),
            DriverOptions::from_config(config),
        );
        Ok(Self {
            session: Arc::new(SessionContext::new(credential)),
            driver: Arc::new(driver),
            oauth: Arc::new(oauth),
        })
    }
}

/// One blocking run using `TEAMLEADER_TOKEN` as the source credential.
pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let config = SyncConfig::from_env();
    if config.teamleader_token.is_none() {
        anyhow::bail!("TEAMLEADER_TOKEN is not set; authorize through the web callback or export a token");
    }
    let runtime = SyncRuntime::from_config(&config)?;
    let Some(_guard) = runtime.session.try_begin_run() else {
        anyhow::bail!("a sync run is already active");
    };
    info!(mode = ?config.mode, log = %config.log_path.display(), "starting sync run");
    let summary = runtime.driver.run().await;
    runtime.session.record_run(summary.clone()).await;
    Ok(summary)
}
