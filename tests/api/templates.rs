//! Template resolution against a mock blob store. No database involved.

use std::collections::HashMap;
use std::time::Duration;

use mailroom::template_store::TemplateStore;
use mailroom::template_store::DEFAULT_SUBJECT;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;

async fn store_with(
    server: &MockServer,
    mapping: HashMap<String, String>,
) -> TemplateStore {
    TemplateStore::new(
        server.uri(),
        "templates".into(),
        "https://cdn.example".into(),
        mapping,
        Duration::from_secs(5),
    )
}

#[tokio::test]
async fn resolution_walks_htm_html_then_folder_file() {
    let server = MockServer::start().await;
    // .htm and .html miss; the folder-named file exists
    Mock::given(method("GET"))
        .and(path("/templates/claims/claims.html"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"<html><body>Claims ack {{REFERENCE_ID}}</body></html>".to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let store = store_with(&server, HashMap::new()).await;
    let template = store.load("claims@corp.example", "<abc-123456789@x>").await;

    assert_eq!(template.folder.as_deref(), Some("claims"));
    assert_eq!(template.subject, "Auto Response");
    // {{REFERENCE_ID}} replaced with the message id tail
    assert!(template.html.contains("Claims ack 456789@x>"));

    let requests = server.received_requests().await.unwrap();
    let paths: Vec<_> = requests.iter().map(|r| r.url.path().to_string()).collect();
    assert_eq!(
        paths,
        vec![
            "/templates/claims/claims@corp.example.htm",
            "/templates/claims/claims@corp.example.html",
            "/templates/claims/claims.html",
        ]
    );
}

#[tokio::test]
async fn folder_mapping_applies_to_the_mailbox_local_part() {
    let server = MockServer::start().await;
    let mapping: HashMap<String, String> = [
        ("policyservice-aitest".to_string(), "policyservice".to_string()),
    ]
    .into();
    Mock::given(method("GET"))
        .and(path("/templates/policyservice/policyservice-aitest@corp.example.htm"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"<html><body>mapped</body></html>".to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let store = store_with(&server, mapping).await;
    let template = store
        .load("policyservice-aitest@corp.example", "<id@x>")
        .await;
    assert_eq!(template.folder.as_deref(), Some("policyservice"));
    assert_eq!(template.subject, DEFAULT_SUBJECT);
}

#[tokio::test]
async fn missing_template_falls_back_to_the_builtin_body() {
    let server = MockServer::start().await;
    // no blobs mounted at all

    let store = store_with(&server, HashMap::new()).await;
    let template = store.load("unknown@corp.example", "<id@x>").await;

    assert_eq!(template.folder, None);
    assert_eq!(template.subject, DEFAULT_SUBJECT);
    assert!(template.html.contains("Thank you for contacting us"));
}

#[tokio::test]
async fn loaded_templates_get_image_references_rewritten() {
    let server = MockServer::start().await;
    let body = br#"<html><body>
        <img src="tracking@corp.example_files/logo.png">
        <img src="https://elsewhere.example/kept.png">
    </body></html>"#;
    Mock::given(method("GET"))
        .and(path("/templates/tracking/tracking@corp.example.htm"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(&server)
        .await;

    let store = store_with(&server, HashMap::new()).await;
    let template = store.load("tracking@corp.example", "<id@x>").await;

    assert!(template
        .html
        .contains(r#"src="https://cdn.example/templates/tracking/logo.png""#));
    assert!(template.html.contains(r#"src="https://elsewhere.example/kept.png""#));
    assert_eq!(template.subject, "Auto Reply");
}
