use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;

use config::Config;
use config::ConfigError;
use config::FileFormat;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use sqlx::postgres::PgConnectOptions;
use sqlx::postgres::PgSslMode;

/// Service configuration, read once at startup. A missing or malformed
/// value is fatal: the process must not come up half-configured.
#[derive(Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub mail: MailSettings,
    pub database: DatabaseSettings,
    pub llm: LlmSettings,
    pub blob: BlobSettings,
    pub routing: RoutingSettings,
}

#[derive(Deserialize, Clone)]
pub struct ApplicationSettings {
    /// Target seconds between batch starts.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub fetch_interval_secs: u64,
    /// Messages processed in parallel per group (capped by the provider's
    /// concurrent-request limit).
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub group_size: usize,
    pub environment: EnvKind,
    /// Where the daily report is mailed; empty disables delivery.
    #[serde(default)]
    pub report_recipients: Vec<String>,
}

/// Deployment environment; selects the mailbox-to-template-folder table.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvKind {
    #[serde(rename = "DEV")]
    Dev,
    #[serde(rename = "SIT")]
    Sit,
    #[serde(rename = "UAT")]
    Uat,
    #[serde(rename = "PREPROD")]
    Preprod,
    #[serde(rename = "PROD")]
    Prod,
}

impl EnvKind {
    /// Mailbox local part -> blob folder. Pre-production environments use
    /// suffixed test mailboxes that share the production template folders.
    pub fn folder_mapping(&self) -> HashMap<String, String> {
        let suffix = match self {
            Self::Dev => "-aitest",
            Self::Sit => "-aisit",
            Self::Uat => "-aiuat",
            Self::Preprod => "-aipreprod",
            Self::Prod => "",
        };
        [
            ("onlinesupport", "onlinesupport"),
            ("policyservice", "policyservice"),
            ("tracking", "tracking"),
            ("digital.comms", "digitalcomms"),
            ("claims", "claims"),
        ]
        .into_iter()
        .map(|(mailbox, folder)| (format!("{mailbox}{suffix}"), folder.to_string()))
        .collect()
    }
}

#[derive(Deserialize, Clone)]
pub struct MailSettings {
    /// Provider REST root, e.g. `https://graph.microsoft.com/v1.0`.
    pub base_url: String,
    /// Override for the OAuth2 token endpoint otherwise derived from the
    /// tenant; the test harness points this at a mock server.
    pub token_url: Option<String>,
    pub client_id: String,
    pub tenant_id: String,
    pub client_secret: Secret<String>,
    /// Consolidation bins to poll; the first is the sender identity for
    /// forwards and autoresponses.
    pub accounts: Vec<String>,
    pub default_account: String,
    /// Comma-separated addresses to drop from forwarded CC lists.
    pub cc_exclusion_list: String,
    /// Domain whose Exchange system senders are never answered.
    pub corporate_domain: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub timeout_millis: u64,
}

impl MailSettings {
    pub fn timeout(&self) -> Duration { Duration::from_millis(self.timeout_millis) }

    /// The client-credentials token endpoint for this tenant.
    pub fn token_url(&self) -> String {
        self.token_url.clone().unwrap_or_else(|| {
            format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                self.tenant_id
            )
        })
    }

    /// The consolidation bin: the mailbox the service polls and sends as.
    pub fn consolidation_bin(&self) -> &str {
        self.accounts.first().map_or(&self.default_account, |a| a)
    }

    /// Lowercased CC exclusion set for case-insensitive filtering.
    pub fn cc_exclusions(&self) -> HashSet<String> {
        self.cc_exclusion_list
            .split(',')
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }
}

/// Database configuration
#[derive(Deserialize, Clone)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: Secret<String>,
    /// Port for the postgres database. This will be different from that of
    /// the provider endpoints.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub host: String,
    pub database_name: String,
    pub require_ssl: bool,
}

impl DatabaseSettings {
    /// Connection options for the server, without selecting a database.
    /// Used by the test harness to create throwaway databases.
    pub fn connection_without_db(&self) -> PgConnectOptions {
        let ssl_mode = if self.require_ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };
        PgConnectOptions::new()
            .host(&self.host)
            .username(&self.username)
            .password(self.password.expose_secret())
            .port(self.port)
            .ssl_mode(ssl_mode)
    }

    pub fn connection(&self) -> PgConnectOptions {
        self.connection_without_db().database(&self.database_name)
    }
}

#[derive(Deserialize, Clone)]
pub struct LlmSettings {
    /// Primary chat-completion endpoint root.
    pub endpoint: String,
    pub api_key: Secret<String>,
    /// Failover region; a transport-level failure against the primary is
    /// retried once here before the stage is declared failed.
    pub backup_endpoint: Option<String>,
    pub backup_api_key: Option<Secret<String>>,
    pub api_version: String,
    /// Deployment used for the categorise stage.
    pub primary_deployment: String,
    /// Cheaper deployment used for the action re-check and prioritise
    /// stages.
    pub light_deployment: String,
    pub costs: ModelCostSettings,
}

/// USD per million tokens, per model tier.
#[derive(Deserialize, Clone, Copy)]
pub struct ModelCostSettings {
    pub primary_prompt_per_million: f64,
    pub primary_completion_per_million: f64,
    pub light_prompt_per_million: f64,
    pub light_completion_per_million: f64,
}

#[derive(Deserialize, Clone)]
pub struct BlobSettings {
    /// Blob account endpoint used for template fetches.
    pub base_url: String,
    pub container: String,
    /// Public root substituted into rewritten image references.
    pub public_url: String,
}

/// One destination mailbox per department.
#[derive(Deserialize, Clone)]
pub struct RoutingSettings {
    pub policy_services: String,
    pub tracking: String,
    pub claims: String,
    pub online_support: String,
    pub insurance_admin: String,
    pub digital_comms: String,
}

/// Loads configuration.yaml and layers `MAILROOM__`-prefixed environment
/// variables on top (e.g. `MAILROOM__DATABASE__PASSWORD`). All fields must
/// resolve, otherwise initialisation fails and the service will not start.
pub fn get_configuration() -> Result<Settings, ConfigError> {
    let settings = Config::builder()
        .add_source(config::File::new("configuration.yaml", FileFormat::Yaml))
        .add_source(
            config::Environment::with_prefix("MAILROOM")
                .prefix_separator("__")
                .separator("__"),
        )
        .build()?;
    settings.try_deserialize()
}
