//! End-to-end scenarios for the per-message state machine, against mock
//! provider/LLM/blob servers and a throwaway database.

use serde_json::json;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::Mock;
use wiremock::ResponseTemplate;

use crate::helpers::*;

#[tokio::test]
async fn happy_path_classifies_forwards_marks_read_and_acknowledges() {
    let service = spawn_service().await;
    mock_classifier(&service.llm_server, "amendments").await;
    mock_forward_chain(&service.mail_server).await;
    mock_mark_read(&service.mail_server).await;
    mock_send_mail(&service.mail_server).await;

    let message = customer_message("<happy-1@example.com>");
    let outcome = service
        .engine
        .process(&service.token, ACCOUNT, message)
        .await;

    assert!(outcome.read_retry.is_none());
    let (routed_to, intervention, class_sts, routing_sts, read_sts, ar_sts, category) =
        fetch_audit_row(&service.pool, "<happy-1@example.com>").await;
    assert_eq!(routed_to, POLICY_SERVICES);
    assert!(intervention); // claims@ -> policyservice@ was the model's doing
    assert_eq!(class_sts, "success");
    assert_eq!(routing_sts, "success");
    assert_eq!(read_sts, "success");
    assert_eq!(ar_sts, "success");
    assert_eq!(category, "amendments");

    // the structured log exists alongside the audit row
    let (system_logs,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM system_logs WHERE email_id = 'prov-1'")
            .fetch_one(&service.pool)
            .await
            .unwrap();
    assert_eq!(system_logs, 1);
}

#[tokio::test]
async fn second_delivery_of_the_same_message_is_skipped_as_duplicate() {
    let service = spawn_service().await;
    mock_classifier(&service.llm_server, "amendments").await;
    mock_forward_chain(&service.mail_server).await;
    mock_mark_read(&service.mail_server).await;
    mock_send_mail(&service.mail_server).await;

    let first = customer_message("<dup-1@example.com>");
    service.engine.process(&service.token, ACCOUNT, first).await;
    let second = customer_message("<dup-1@example.com>");
    service.engine.process(&service.token, ACCOUNT, second).await;

    let (log_rows,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM logs WHERE internet_message_id = $1")
            .bind("<dup-1@example.com>")
            .fetch_one(&service.pool)
            .await
            .unwrap();
    assert_eq!(log_rows, 1);

    let (skip_type, skip_reason): (String, String) = sqlx::query_as(
        "SELECT skip_type, skip_reason FROM skipped_mails WHERE internet_message_id = $1",
    )
    .bind("<dup-1@example.com>")
    .fetch_one(&service.pool)
    .await
    .unwrap();
    assert_eq!(skip_type, "DUPLICATE");
    assert!(skip_reason.contains("<dup-1@example.com>"));
}

#[tokio::test]
async fn exchange_system_sender_is_skipped_without_classification() {
    let service = spawn_service().await;
    mock_mark_read(&service.mail_server).await;
    // no LLM mocks mounted: a classifier call would 404 and fail the test
    // through the status assertions below

    let message = mailroom::domain::Message::assemble(
        "prov-1".into(),
        "<bounce-1@corp.example>".into(),
        "Undeliverable: your message".into(),
        "MicrosoftExchange329e71ec88ae4615bbc36ab6ce41109e@corp.example".into(),
        "bin@corp.example".into(),
        String::new(),
        None,
        "text",
        "Your message couldn't be delivered.".into(),
    );
    service.engine.process(&service.token, ACCOUNT, message).await;

    let (skip_type,): (String,) =
        sqlx::query_as("SELECT skip_type FROM skipped_mails WHERE internet_message_id = $1")
            .bind("<bounce-1@corp.example>")
            .fetch_one(&service.pool)
            .await
            .unwrap();
    assert_eq!(skip_type, "EXCHANGE_SYSTEM");

    let (log_rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM logs")
        .fetch_one(&service.pool)
        .await
        .unwrap();
    assert_eq!(log_rows, 0);
    assert_eq!(service.llm_server.received_requests().await.unwrap().len(), 0);
}

#[tokio::test]
async fn classifier_outage_still_delivers_to_the_original_recipient() {
    let service = spawn_service().await;
    Mock::given(method("POST"))
        .and(path("/openai/deployments/gpt-4o/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&service.llm_server)
        .await;
    mock_forward_chain(&service.mail_server).await;
    mock_mark_read(&service.mail_server).await;
    mock_send_mail(&service.mail_server).await;

    let message = customer_message("<outage-1@example.com>");
    service.engine.process(&service.token, ACCOUNT, message).await;

    let (routed_to, intervention, class_sts, routing_sts, read_sts, _ar, category) =
        fetch_audit_row(&service.pool, "<outage-1@example.com>").await;
    // fallback goes to the address the customer wrote to, not a
    // router-chosen mailbox
    assert_eq!(routed_to, "claims@corp.example");
    assert!(!intervention);
    assert_eq!(class_sts, "error");
    assert_eq!(routing_sts, "success");
    assert_eq!(read_sts, "success");
    assert_eq!(category, "error");
}

#[tokio::test]
async fn failed_forward_falls_back_to_the_original_recipient() {
    let service = spawn_service().await;
    mock_classifier(&service.llm_server, "amendments").await;
    mock_mark_read(&service.mail_server).await;
    mock_send_mail(&service.mail_server).await;

    Mock::given(method("GET"))
        .and(path(format!("/users/{ACCOUNT}/messages/prov-1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "prov-1",
            "hasAttachments": false
        })))
        .mount(&service.mail_server)
        .await;
    // the primary forward dies permanently; the fallback one succeeds
    Mock::given(method("POST"))
        .and(path(format!("/users/{ACCOUNT}/messages/prov-1/createForward")))
        .respond_with(ResponseTemplate::new(403))
        .up_to_n_times(1)
        .mount(&service.mail_server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/users/{ACCOUNT}/messages/prov-1/createForward")))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "draft-1" })))
        .mount(&service.mail_server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(format!("/users/{ACCOUNT}/messages/draft-1")))
        .respond_with(ResponseTemplate::new(200))
        .mount(&service.mail_server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/users/{ACCOUNT}/messages/draft-1/send")))
        .respond_with(ResponseTemplate::new(202))
        .mount(&service.mail_server)
        .await;

    let message = customer_message("<fallback-1@example.com>");
    service.engine.process(&service.token, ACCOUNT, message).await;

    let (routed_to, intervention, class_sts, routing_sts, read_sts, _ar, _cat) =
        fetch_audit_row(&service.pool, "<fallback-1@example.com>").await;
    assert_eq!(routed_to, "claims@corp.example (fallback routing)");
    assert!(!intervention);
    assert_eq!(class_sts, "success");
    assert_eq!(routing_sts, "error");
    assert_eq!(read_sts, "success");
}

#[tokio::test]
async fn noreply_sender_gets_no_acknowledgment_but_full_triage() {
    let service = spawn_service().await;
    mock_classifier(&service.llm_server, "amendments").await;
    mock_forward_chain(&service.mail_server).await;
    mock_mark_read(&service.mail_server).await;
    // sendMail intentionally unmocked: the loop guard must prevent the call

    let message = mailroom::domain::Message::assemble(
        "prov-1".into(),
        "<noreply-1@vendor.com>".into(),
        "Your statement".into(),
        "noreply@vendor.com".into(),
        "claims@corp.example".into(),
        String::new(),
        None,
        "text",
        "Please see your statement attached.".into(),
    );
    service.engine.process(&service.token, ACCOUNT, message).await;

    let (routed_to, _iv, class_sts, routing_sts, _read, ar_sts, _cat) =
        fetch_audit_row(&service.pool, "<noreply-1@vendor.com>").await;
    assert_eq!(routed_to, POLICY_SERVICES);
    assert_eq!(class_sts, "success");
    assert_eq!(routing_sts, "success");
    assert_eq!(ar_sts, "not_attempted");

    let skip_reason: (serde_json::Value,) = sqlx::query_as(
        "SELECT log_json -> 'autoresponse_summary' FROM system_logs WHERE email_id = 'prov-1'",
    )
    .fetch_one(&service.pool)
    .await
    .unwrap();
    assert!(skip_reason.0["skip_reason"]
        .as_str()
        .unwrap()
        .contains("noreply"));

    let send_calls = service
        .mail_server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path().ends_with("/sendMail"))
        .count();
    assert_eq!(send_calls, 0);
}

#[tokio::test]
async fn attachment_scan_in_progress_defers_the_message() {
    let service = spawn_service().await;
    mock_classifier(&service.llm_server, "amendments").await;
    mock_send_mail(&service.mail_server).await;

    Mock::given(method("GET"))
        .and(path(format!("/users/{ACCOUNT}/messages/prov-1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "prov-1",
            "hasAttachments": true
        })))
        .mount(&service.mail_server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/users/{ACCOUNT}/messages/prov-1/attachments")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [ { "name": "Safe Attachments Scan In Progress" } ]
        })))
        .mount(&service.mail_server)
        .await;
    // a mark-read here would lose the deferral
    Mock::given(method("PATCH"))
        .and(path(format!("/users/{ACCOUNT}/messages/prov-1")))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&service.mail_server)
        .await;

    let message = customer_message("<scan-1@example.com>");
    service.engine.process(&service.token, ACCOUNT, message).await;

    // no audit row: the next batch must pick the message up again
    let (log_rows,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM logs WHERE internet_message_id = $1")
            .bind("<scan-1@example.com>")
            .fetch_one(&service.pool)
            .await
            .unwrap();
    assert_eq!(log_rows, 0);
}

#[tokio::test]
async fn read_mark_failure_is_reported_for_retry() {
    let service = spawn_service().await;
    mock_classifier(&service.llm_server, "amendments").await;
    mock_forward_chain(&service.mail_server).await;
    mock_send_mail(&service.mail_server).await;
    // 403 is terminal for mark-read, so the engine reports it without
    // burning through backoff sleeps
    Mock::given(method("PATCH"))
        .and(path(format!("/users/{ACCOUNT}/messages/prov-1")))
        .respond_with(ResponseTemplate::new(403))
        .mount(&service.mail_server)
        .await;

    let message = customer_message("<unread-1@example.com>");
    let outcome = service
        .engine
        .process(&service.token, ACCOUNT, message)
        .await;

    assert_eq!(
        outcome.read_retry,
        Some((ACCOUNT.to_string(), "prov-1".to_string()))
    );
    let (_routed, _iv, _class, _routing, read_sts, _ar, _cat) =
        fetch_audit_row(&service.pool, "<unread-1@example.com>").await;
    assert_eq!(read_sts, "error");
}
