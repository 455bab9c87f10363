use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use mailroom::autoresponder::Autoresponder;
use mailroom::classifier::Classifier;
use mailroom::configuration::DatabaseSettings;
use mailroom::configuration::LlmSettings;
use mailroom::configuration::ModelCostSettings;
use mailroom::configuration::RoutingSettings;
use mailroom::domain::Message;
use mailroom::engine::TriageEngine;
use mailroom::log_store::LogStore;
use mailroom::mail_gateway::AccessToken;
use mailroom::mail_gateway::MailGateway;
use mailroom::router::Router;
use mailroom::telemetry::get_subscriber;
use mailroom::telemetry::init_subscriber;
use mailroom::template_store::TemplateStore;
use once_cell::sync::Lazy;
use secrecy::Secret;
use serde_json::json;
use sqlx::Connection;
use sqlx::Executor;
use sqlx::PgConnection;
use sqlx::PgPool;
use uuid::Uuid;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;

pub const ACCOUNT: &str = "bin@corp.example";
pub const CORPORATE_DOMAIN: &str = "corp.example";
pub const POLICY_SERVICES: &str = "policyservice@corp.example";

/// Opt in to verbose test logs with `TEST_LOG=true cargo test | bunyan`.
static TRACING: Lazy<()> = Lazy::new(|| match std::env::var("TEST_LOG") {
    Ok(_) => {
        let subscriber = get_subscriber("test", "debug", std::io::stdout);
        init_subscriber(subscriber);
    }
    Err(_) => {
        let subscriber = get_subscriber("test", "debug", std::io::sink);
        init_subscriber(subscriber);
    }
});

pub struct TestService {
    pub mail_server: MockServer,
    pub llm_server: MockServer,
    pub blob_server: MockServer,
    pub pool: PgPool,
    pub store: LogStore,
    pub gateway: Arc<MailGateway>,
    pub engine: Arc<TriageEngine>,
    pub token: AccessToken,
}

/// Wire the whole pipeline against mock provider/LLM/blob servers and a
/// throwaway migrated database.
pub async fn spawn_service() -> TestService {
    Lazy::force(&TRACING);

    let mail_server = MockServer::start().await;
    let llm_server = MockServer::start().await;
    let blob_server = MockServer::start().await;

    let db_cfg = DatabaseSettings {
        username: "postgres".into(),
        password: Secret::new("password".into()),
        port: 5432,
        host: "127.0.0.1".into(),
        database_name: Uuid::new_v4().to_string(),
        require_ssl: false,
    };
    let pool = configure_database(&db_cfg).await;
    let store = LogStore::new(pool.clone());

    let gateway = Arc::new(test_gateway(&mail_server));
    let templates = Arc::new(TemplateStore::new(
        blob_server.uri(),
        "templates".into(),
        blob_server.uri(),
        std::collections::HashMap::new(),
        Duration::from_secs(5),
    ));
    let autoresponder = Arc::new(Autoresponder::new(
        Arc::clone(&gateway),
        templates,
        vec![ACCOUNT.to_string()],
        CORPORATE_DOMAIN.to_string(),
    ));
    let router = Router::new(test_routing(), ACCOUNT.to_string());
    let classifier = Classifier::new(test_llm_settings(&llm_server));
    let engine = Arc::new(TriageEngine::new(
        Arc::clone(&gateway),
        classifier,
        router,
        autoresponder,
        store.clone(),
        CORPORATE_DOMAIN.to_string(),
    ));

    TestService {
        mail_server,
        llm_server,
        blob_server,
        pool,
        store,
        gateway,
        engine,
        token: AccessToken::for_tests("test-token".into()),
    }
}

pub fn test_gateway(mail_server: &MockServer) -> MailGateway {
    let exclusions: HashSet<String> = ["audit@corp.example".to_string()].into();
    MailGateway::new(
        mail_server.uri(),
        format!("{}/token", mail_server.uri()),
        "client-id".into(),
        Secret::new("client-secret".into()),
        exclusions,
        Duration::from_secs(5),
    )
}

pub fn test_routing() -> RoutingSettings {
    RoutingSettings {
        policy_services: POLICY_SERVICES.into(),
        tracking: "tracking@corp.example".into(),
        claims: "claims@corp.example".into(),
        online_support: "onlinesupport@corp.example".into(),
        insurance_admin: "insuranceadmin@corp.example".into(),
        digital_comms: "digital.comms@corp.example".into(),
    }
}

pub fn test_llm_settings(llm_server: &MockServer) -> LlmSettings {
    LlmSettings {
        endpoint: llm_server.uri(),
        api_key: Secret::new("llm-key".into()),
        backup_endpoint: None,
        backup_api_key: None,
        api_version: "2024-02-01".into(),
        primary_deployment: "gpt-4o".into(),
        light_deployment: "gpt-4o-mini".into(),
        costs: ModelCostSettings {
            primary_prompt_per_million: 5.0,
            primary_completion_per_million: 15.0,
            light_prompt_per_million: 0.15,
            light_completion_per_million: 0.60,
        },
    }
}

/// Create a randomised database with the project migrations applied.
/// Requires a local Postgres.
async fn configure_database(cfg: &DatabaseSettings) -> PgPool {
    let mut conn = PgConnection::connect_with(&cfg.connection_without_db())
        .await
        .expect("postgres must be running");
    conn.execute(format!(r#"CREATE DATABASE "{}";"#, cfg.database_name).as_str())
        .await
        .expect("failed to create the test database");

    let pool = PgPool::connect_with(cfg.connection()).await.unwrap();
    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("failed to migrate");
    pool
}

/// An ordinary customer message addressed to a department mailbox.
pub fn customer_message(internet_message_id: &str) -> Message {
    Message::assemble(
        "prov-1".into(),
        internet_message_id.into(),
        "Please update my address".into(),
        "jane@example.com".into(),
        "claims@corp.example".into(),
        "audit@corp.example, colleague@example.com".into(),
        None,
        "text",
        "Hi, I moved house last month. Please amend my policy address.".into(),
    )
}

/// A chat-completion body in the provider's shape.
pub fn chat_response(content: serde_json::Value) -> serde_json::Value {
    json!({
        "choices": [
            { "message": { "content": content.to_string() } }
        ],
        "usage": {
            "prompt_tokens": 120,
            "completion_tokens": 30,
            "prompt_tokens_details": { "cached_tokens": 0 }
        }
    })
}

/// Mount the three classification stages: categorise on the primary
/// deployment, action re-check + prioritise on the light one (served from
/// a single mock; each stage decodes only the keys it knows).
pub async fn mock_classifier(
    llm_server: &MockServer,
    final_category: &str,
) {
    Mock::given(method("POST"))
        .and(path("/openai/deployments/gpt-4o/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_response(json!({
            "classification": ["amendments", "claims", "other"],
            "rsn_classification": "the customer asks for an address change",
            "action_required": "yes",
            "sentiment": "neutral"
        }))))
        .mount(llm_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/openai/deployments/gpt-4o-mini/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_response(json!({
            "action_required": "yes",
            "final_category": final_category,
            "rsn_classification": "the latest message asks for an address change"
        }))))
        .mount(llm_server)
        .await;
}

/// Mount the provider endpoints for a successful forward of `prov-1`.
pub async fn mock_forward_chain(mail_server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(format!("/users/{ACCOUNT}/messages/prov-1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "prov-1",
            "hasAttachments": false
        })))
        .mount(mail_server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/users/{ACCOUNT}/messages/prov-1/createForward")))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "draft-1" })))
        .mount(mail_server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(format!("/users/{ACCOUNT}/messages/draft-1")))
        .respond_with(ResponseTemplate::new(200))
        .mount(mail_server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/users/{ACCOUNT}/messages/draft-1/send")))
        .respond_with(ResponseTemplate::new(202))
        .mount(mail_server)
        .await;
}

pub async fn mock_mark_read(mail_server: &MockServer) {
    Mock::given(method("PATCH"))
        .and(path(format!("/users/{ACCOUNT}/messages/prov-1")))
        .respond_with(ResponseTemplate::new(200))
        .mount(mail_server)
        .await;
}

pub async fn mock_send_mail(mail_server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(format!("/users/{ACCOUNT}/sendMail")))
        .respond_with(ResponseTemplate::new(202))
        .mount(mail_server)
        .await;
}

/// The audit row columns the scenario tests assert on.
pub type AuditRow = (
    String, // routed_to
    bool,   // intervention
    String, // classification_status
    String, // routing_status
    String, // read_status
    String, // autoresponse_status
    String, // category
);

pub async fn fetch_audit_row(
    pool: &PgPool,
    internet_message_id: &str,
) -> AuditRow {
    sqlx::query_as(
        "SELECT routed_to, intervention, classification_status, routing_status,
                read_status, autoresponse_status, category
         FROM logs WHERE internet_message_id = $1",
    )
    .bind(internet_message_id)
    .fetch_one(pool)
    .await
    .expect("expected exactly one audit row")
}
