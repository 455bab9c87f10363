//! The polling loop end to end: token, fetch, engine hand-off, shutdown.

use std::time::Duration;

use mailroom::batch;
use serde_json::json;
use tokio::sync::watch;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::Mock;
use wiremock::ResponseTemplate;

use crate::helpers::*;

#[tokio::test]
async fn batch_loop_drains_the_unread_set_and_stops_on_shutdown() {
    let service = spawn_service().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "access_token": "batch-token" })),
        )
        .mount(&service.mail_server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/users/{ACCOUNT}/messages")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{
                "id": "prov-1",
                "internetMessageId": "<batch-1@example.com>",
                "subject": "Please update my address",
                "from": { "emailAddress": { "address": "jane@example.com" } },
                "toRecipients": [ { "emailAddress": { "address": "claims@corp.example" } } ],
                "ccRecipients": [],
                "receivedDateTime": "2024-06-01T08:30:00Z",
                "body": { "contentType": "text", "content": "I moved house." },
                "hasAttachments": false
            }]
        })))
        .mount(&service.mail_server)
        .await;
    mock_classifier(&service.llm_server, "amendments").await;
    mock_forward_chain(&service.mail_server).await;
    mock_mark_read(&service.mail_server).await;
    mock_send_mail(&service.mail_server).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(batch::run(
        service.engine.clone(),
        service.gateway.clone(),
        vec![ACCOUNT.to_string()],
        Duration::from_secs(30),
        3,
        shutdown_rx,
    ));

    // give the first batch time to finish, then signal shutdown mid-sleep
    tokio::time::sleep(Duration::from_secs(4)).await;
    shutdown_tx.send(true).unwrap();
    worker
        .await
        .expect("the loop must not panic")
        .expect("the loop exits cleanly");

    let (log_rows,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM logs WHERE internet_message_id = $1")
            .bind("<batch-1@example.com>")
            .fetch_one(&service.pool)
            .await
            .unwrap();
    assert_eq!(log_rows, 1);
}
