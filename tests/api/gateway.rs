//! Provider-surface behaviour of the mail gateway, against wiremock.
//! No database involved.

use claims::assert_err;
use claims::assert_ok;
use serde_json::json;
use wiremock::matchers::body_string_contains;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::matchers::query_param;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;

use crate::helpers::test_gateway;
use crate::helpers::ACCOUNT;
use mailroom::mail_gateway::AccessToken;
use mailroom::mail_gateway::ForwardOutcome;
use mailroom::mail_gateway::GatewayError;

fn token() -> AccessToken { AccessToken::for_tests("test-token".into()) }

fn provider_message(id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "internetMessageId": format!("<{id}@example.com>"),
        "subject": "Please update my address",
        "from": { "emailAddress": { "address": "jane@example.com" } },
        "toRecipients": [ { "emailAddress": { "address": "claims@corp.example" } } ],
        "ccRecipients": [],
        "receivedDateTime": "2024-06-01T08:30:00Z",
        "body": { "contentType": "text", "content": "I moved house." },
        "hasAttachments": false
    })
}

#[tokio::test]
async fn token_acquisition_posts_client_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=client_credentials"))
        .and(body_string_contains("client_id=client-id"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "access_token": "abc" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let gateway = test_gateway(&server);
    assert_ok!(gateway.acquire_token().await);
}

#[tokio::test]
async fn unread_fetch_follows_pagination() {
    let server = MockServer::start().await;
    let next = format!("{}/users/{ACCOUNT}/messages-page-2", server.uri());
    Mock::given(method("GET"))
        .and(path(format!("/users/{ACCOUNT}/messages")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [provider_message("m-1")],
            "@odata.nextLink": next
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/users/{ACCOUNT}/messages-page-2")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [provider_message("m-2")]
        })))
        .mount(&server)
        .await;

    let gateway = test_gateway(&server);
    let messages = gateway.fetch_unread(&token(), ACCOUNT).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].provider_id, "m-1");
    assert_eq!(messages[1].provider_id, "m-2");
    assert_eq!(messages[0].internet_message_id, "<m-1@example.com>");
    assert!(messages[0].received_at.is_some());
}

#[tokio::test]
async fn unread_fetch_does_not_retry_authentication_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/users/{ACCOUNT}/messages")))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = test_gateway(&server);
    let error = gateway.fetch_unread(&token(), ACCOUNT).await;
    assert!(matches!(assert_err!(error), GatewayError::Auth(_)));
}

#[tokio::test]
async fn mark_read_gives_up_immediately_on_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path(format!("/users/{ACCOUNT}/messages/gone")))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = test_gateway(&server);
    assert!(!gateway.mark_read(&token(), ACCOUNT, "gone").await);
}

#[tokio::test]
async fn forward_rewrites_recipients_and_filters_excluded_ccs() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/users/{ACCOUNT}/messages/m-1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(provider_message("m-1")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/users/{ACCOUNT}/messages/m-1/createForward")))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "draft-9" })))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(format!("/users/{ACCOUNT}/messages/draft-9")))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/users/{ACCOUNT}/messages/draft-9/send")))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = test_gateway(&server);
    let outcome = gateway
        .forward(
            &token(),
            ACCOUNT,
            "m-1",
            "jane@example.com",
            "policyservice@corp.example",
            "Audit@corp.example, colleague@example.com",
            "AI Forwarded message",
        )
        .await;
    assert_eq!(outcome, ForwardOutcome::Sent);

    let requests = server.received_requests().await.unwrap();
    let patch = requests
        .iter()
        .find(|r| r.method.as_str() == "PATCH")
        .expect("the draft must be updated");
    let body: serde_json::Value = serde_json::from_slice(&patch.body).unwrap();
    assert_eq!(
        body["toRecipients"][0]["emailAddress"]["address"],
        "policyservice@corp.example"
    );
    assert_eq!(body["replyTo"][0]["emailAddress"]["address"], "jane@example.com");
    // the excluded audit address is dropped, case-insensitively
    let ccs = body["ccRecipients"].as_array().unwrap();
    assert_eq!(ccs.len(), 1);
    assert_eq!(ccs[0]["emailAddress"]["address"], "colleague@example.com");
}

#[tokio::test]
async fn forward_defers_while_the_attachment_scan_runs() {
    let server = MockServer::start().await;
    let mut scanning = provider_message("m-1");
    scanning["hasAttachments"] = json!(true);
    Mock::given(method("GET"))
        .and(path(format!("/users/{ACCOUNT}/messages/m-1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(scanning))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/users/{ACCOUNT}/messages/m-1/attachments")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [ { "name": "Safe Attachments Scan In Progress" } ]
        })))
        .mount(&server)
        .await;

    let gateway = test_gateway(&server);
    let outcome = gateway
        .forward(
            &token(),
            ACCOUNT,
            "m-1",
            "jane@example.com",
            "policyservice@corp.example",
            "",
            "AI Forwarded message",
        )
        .await;
    assert_eq!(outcome, ForwardOutcome::ScanPending);
}

#[tokio::test]
async fn send_walks_the_encoding_strategy_ladder() {
    let server = MockServer::start().await;
    // the first two strategies are rejected, the plain one lands
    Mock::given(method("POST"))
        .and(path(format!("/users/{ACCOUNT}/sendMail")))
        .respond_with(ResponseTemplate::new(400))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/users/{ACCOUNT}/sendMail")))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = test_gateway(&server);
    let sent = gateway
        .send(
            &token(),
            ACCOUNT,
            "jane@example.com",
            "Thank you for contacting us",
            "<p>Hello</p>",
            "Hello",
        )
        .await;
    assert!(sent);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
    // strategy (a) injects charset meta tags
    let first: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert!(first["message"]["body"]["content"]
        .as_str()
        .unwrap()
        .contains("charset=\"UTF-8\""));
    // strategy (b) carries the provider's base64 hint
    let second: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(second["message"]["body"]["isBase64"], true);
}

#[tokio::test]
async fn mailbox_counters_read_the_odata_count() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/users/{ACCOUNT}/mailFolders/inbox/messages")))
        .and(query_param("$count", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "@odata.count": 7,
            "value": []
        })))
        .mount(&server)
        .await;

    let gateway = test_gateway(&server);
    let unread = gateway.count_unread(&token(), ACCOUNT).await.unwrap();
    assert_eq!(unread, 7);
}
