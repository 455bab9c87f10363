use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::watch;

use crate::autoresponder::Autoresponder;
use crate::batch;
use crate::classifier::Classifier;
use crate::configuration::DatabaseSettings;
use crate::configuration::Settings;
use crate::engine::TriageEngine;
use crate::log_store::LogStore;
use crate::mail_gateway::MailGateway;
use crate::router::Router;
use crate::template_store::TemplateStore;

/// The wired triage service: configuration turned into components, ready
/// to run. Construction is infallible; connections are made lazily on
/// first use.
pub struct Application {
    engine: Arc<TriageEngine>,
    gateway: Arc<MailGateway>,
    accounts: Vec<String>,
    interval: Duration,
    group_size: usize,
}

impl Application {
    pub fn build(cfg: Settings) -> Self {
        let pool = get_connection_pool(&cfg.database);
        let gateway = Arc::new(build_gateway(&cfg));
        let templates = Arc::new(TemplateStore::new(
            cfg.blob.base_url,
            cfg.blob.container,
            cfg.blob.public_url,
            cfg.application.environment.folder_mapping(),
            cfg.mail.timeout(),
        ));
        let autoresponder = Arc::new(Autoresponder::new(
            Arc::clone(&gateway),
            templates,
            cfg.mail.accounts.clone(),
            cfg.mail.corporate_domain.clone(),
        ));
        let router = Router::new(cfg.routing, cfg.mail.consolidation_bin().to_string());
        let engine = Arc::new(TriageEngine::new(
            Arc::clone(&gateway),
            Classifier::new(cfg.llm),
            router,
            autoresponder,
            LogStore::new(pool),
            cfg.mail.corporate_domain,
        ));
        Self {
            engine,
            gateway,
            accounts: cfg.mail.accounts,
            interval: Duration::from_secs(cfg.application.fetch_interval_secs),
            group_size: cfg.application.group_size,
        }
    }

    /// Because this consumes `self`, it should be the final call (or be
    /// handed to `tokio::spawn`).
    pub async fn run_until_stopped(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), anyhow::Error> {
        batch::run(
            self.engine,
            self.gateway,
            self.accounts,
            self.interval,
            self.group_size,
            shutdown,
        )
        .await
    }
}

pub fn get_connection_pool(db_cfg: &DatabaseSettings) -> PgPool {
    PgPoolOptions::new().connect_lazy_with(db_cfg.connection())
}

pub fn build_gateway(cfg: &Settings) -> MailGateway {
    MailGateway::new(
        cfg.mail.base_url.clone(),
        cfg.mail.token_url(),
        cfg.mail.client_id.clone(),
        cfg.mail.client_secret.clone(),
        cfg.mail.cc_exclusions(),
        cfg.mail.timeout(),
    )
}
