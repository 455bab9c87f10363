//! Thin, retrying wrapper over the mail provider's REST surface.
//!
//! Every operation resolves to a value (`bool`, an outcome enum, or a
//! `GatewayError`); nothing here panics across the boundary. Transient
//! provider failures are retried with exponential backoff; permanent ones
//! (401/403/404) are surfaced immediately so the engine can pick a branch.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::DateTime;
use chrono::Utc;
use reqwest::Client;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use serde_json::json;

use crate::domain::Message;

/// Maximum attempts per provider call; sleeps of 2, 4 s between them.
const MAX_ATTEMPTS: u32 = 3;

/// Attachment name the provider uses while its safety scan is running.
const SCAN_IN_PROGRESS: &str = "Safe Attachments Scan In Progress";

const TOKEN_SCOPE: &str = "https://graph.microsoft.com/.default";

fn backoff(attempt: u32) -> Duration { Duration::from_secs(2u64 << attempt) }

/// Bearer token for one batch. Read-only after acquisition, safe to share.
#[derive(Clone)]
pub struct AccessToken(Secret<String>);

impl AccessToken {
    fn bearer(&self) -> &str { self.0.expose_secret() }

    #[doc(hidden)]
    pub fn for_tests(raw: String) -> Self { Self(Secret::new(raw)) }
}

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("authentication with the mail provider failed")]
    Auth(#[source] anyhow::Error),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

/// Result of a forward attempt. `ScanPending` is not a failure: the
/// message must be left untouched and picked up by a later batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Sent,
    ScanPending,
    Failed,
}

pub struct MailGateway {
    http_client: Client,
    base_url: String,
    token_url: String,
    client_id: String,
    client_secret: Secret<String>,
    cc_exclusions: HashSet<String>,
}

impl MailGateway {
    pub fn new(
        base_url: String,
        token_url: String,
        client_id: String,
        client_secret: Secret<String>,
        cc_exclusions: HashSet<String>,
        timeout: Duration,
    ) -> Self {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build the provider HTTP client");
        Self {
            http_client,
            base_url,
            token_url,
            client_id,
            client_secret,
            cc_exclusions,
        }
    }

    /// Client-credentials token. Acquired once per batch and shared.
    #[tracing::instrument(skip_all, err)]
    pub async fn acquire_token(&self) -> Result<AccessToken, GatewayError> {
        let response = self
            .http_client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("scope", TOKEN_SCOPE),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .context("token request failed")?;

        if response.status() == StatusCode::UNAUTHORIZED
            || response.status() == StatusCode::FORBIDDEN
        {
            return Err(GatewayError::Auth(anyhow::anyhow!(
                "token endpoint returned {}",
                response.status()
            )));
        }
        let token: TokenResponse = response
            .error_for_status()
            .context("token endpoint returned an error status")?
            .json()
            .await
            .context("token response was not valid JSON")?;
        Ok(AccessToken(Secret::new(token.access_token)))
    }

    /// Unread messages in `account`, following pagination. Authentication
    /// failures are not retried; everything else backs off and retries.
    #[tracing::instrument(skip_all, fields(account = %account))]
    pub async fn fetch_unread(
        &self,
        token: &AccessToken,
        account: &str,
    ) -> Result<Vec<Message>, GatewayError> {
        let first_page = format!(
            "{}/users/{}/messages?$filter=isRead eq false",
            self.base_url, account
        );
        for attempt in 0..MAX_ATTEMPTS {
            match self.fetch_unread_pages(token, &first_page).await {
                Ok(messages) => return Ok(messages),
                Err(GatewayError::Auth(e)) => return Err(GatewayError::Auth(e)),
                Err(e) if attempt + 1 < MAX_ATTEMPTS => {
                    tracing::warn!(
                        error.cause_chain = ?e,
                        attempt,
                        "unread fetch failed, backing off"
                    );
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("retry loop always returns")
    }

    async fn fetch_unread_pages(
        &self,
        token: &AccessToken,
        first_page: &str,
    ) -> Result<Vec<Message>, GatewayError> {
        let mut messages = Vec::new();
        let mut next = Some(first_page.to_string());
        while let Some(url) = next {
            let response = self
                .http_client
                .get(&url)
                .bearer_auth(token.bearer())
                .send()
                .await
                .context("unread list request failed")?;
            if response.status() == StatusCode::UNAUTHORIZED
                || response.status() == StatusCode::FORBIDDEN
            {
                return Err(GatewayError::Auth(anyhow::anyhow!(
                    "unread list returned {}",
                    response.status()
                )));
            }
            let page: MessageListPage = response
                .error_for_status()
                .context("unread list returned an error status")?
                .json()
                .await
                .context("unread list response was not valid JSON")?;
            for payload in page.value {
                match assemble_message(payload) {
                    Some(message) => messages.push(message),
                    // one unparseable message must not sink the batch
                    None => tracing::warn!("skipping message with no provider id"),
                }
            }
            next = page.next_link;
        }
        Ok(messages)
    }

    /// PATCH `isRead = true`. 404/403 are terminal; other failures retry.
    #[tracing::instrument(skip_all, fields(account = %account, provider_id = %provider_id))]
    pub async fn mark_read(
        &self,
        token: &AccessToken,
        account: &str,
        provider_id: &str,
    ) -> bool {
        let url = format!("{}/users/{}/messages/{}", self.base_url, account, provider_id);
        for attempt in 0..MAX_ATTEMPTS {
            let sent = self
                .http_client
                .patch(&url)
                .bearer_auth(token.bearer())
                .json(&json!({ "isRead": true }))
                .send()
                .await;
            match sent {
                Ok(response) if response.status() == StatusCode::OK => return true,
                Ok(response)
                    if response.status() == StatusCode::NOT_FOUND
                        || response.status() == StatusCode::FORBIDDEN =>
                {
                    tracing::warn!(status = %response.status(), "message gone or access denied, not retrying");
                    return false;
                }
                Ok(response) => {
                    tracing::warn!(status = %response.status(), attempt, "mark-read rejected");
                }
                Err(e) => {
                    tracing::warn!(error.cause_chain = ?e, attempt, "mark-read transport error");
                }
            }
            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(backoff(attempt)).await;
            }
        }
        false
    }

    /// Forward a stored message. Five steps: fetch the original, check the
    /// attachment scan, create a draft, rewrite its recipients, send.
    /// Steps after the scan check are each retried independently.
    #[tracing::instrument(skip_all, fields(account = %account, forward_to = %forward_to))]
    pub async fn forward(
        &self,
        token: &AccessToken,
        account: &str,
        provider_id: &str,
        original_sender: &str,
        forward_to: &str,
        cc: &str,
        note: &str,
    ) -> ForwardOutcome {
        // (i) the original, to learn whether attachments exist
        let original = match self.get_message(token, account, provider_id).await {
            Ok(original) => original,
            Err(e) => {
                tracing::warn!(error.cause_chain = ?e, "could not fetch original message");
                return ForwardOutcome::Failed;
            }
        };

        // (ii) refuse to forward while the safety scan is still running
        if original.has_attachments.unwrap_or(false) {
            match self.scan_in_progress(token, account, provider_id).await {
                Ok(false) => {}
                Ok(true) => {
                    tracing::info!("attachment scan in progress, deferring forward");
                    return ForwardOutcome::ScanPending;
                }
                Err(e) => {
                    tracing::warn!(error.cause_chain = ?e, "could not inspect attachments");
                    return ForwardOutcome::Failed;
                }
            }
        }

        // (iii) draft
        let draft_id = match self.create_forward_draft(token, account, provider_id, note).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error.cause_chain = ?e, "createForward failed");
                return ForwardOutcome::Failed;
            }
        };

        // (iv) recipients + reply-to
        if let Err(e) = self
            .patch_draft(token, account, &draft_id, original_sender, forward_to, cc)
            .await
        {
            tracing::warn!(error.cause_chain = ?e, "draft update failed");
            return ForwardOutcome::Failed;
        }

        // (v) send
        match self.send_draft(token, account, &draft_id).await {
            Ok(()) => ForwardOutcome::Sent,
            Err(e) => {
                tracing::warn!(error.cause_chain = ?e, "draft send failed");
                ForwardOutcome::Failed
            }
        }
    }

    async fn get_message(
        &self,
        token: &AccessToken,
        account: &str,
        provider_id: &str,
    ) -> Result<ProviderMessage, anyhow::Error> {
        let url = format!("{}/users/{}/messages/{}", self.base_url, account, provider_id);
        self.retrying(|| async {
            let response = self
                .http_client
                .get(&url)
                .bearer_auth(token.bearer())
                .send()
                .await
                .context("message fetch failed")?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(RetryStep::Abort(anyhow::anyhow!("message not found")));
            }
            let payload = response
                .error_for_status()
                .context("message fetch returned an error status")?
                .json::<ProviderMessage>()
                .await
                .context("message payload was not valid JSON")?;
            Ok(RetryStep::Done(payload))
        })
        .await
    }

    async fn scan_in_progress(
        &self,
        token: &AccessToken,
        account: &str,
        provider_id: &str,
    ) -> Result<bool, anyhow::Error> {
        let url = format!(
            "{}/users/{}/messages/{}/attachments",
            self.base_url, account, provider_id
        );
        self.retrying(|| async {
            let page = self
                .http_client
                .get(&url)
                .bearer_auth(token.bearer())
                .send()
                .await
                .context("attachment list request failed")?
                .error_for_status()
                .context("attachment list returned an error status")?
                .json::<AttachmentPage>()
                .await
                .context("attachment list was not valid JSON")?;
            let scanning = page
                .value
                .iter()
                .any(|a| a.name.as_deref() == Some(SCAN_IN_PROGRESS));
            Ok(RetryStep::Done(scanning))
        })
        .await
    }

    async fn create_forward_draft(
        &self,
        token: &AccessToken,
        account: &str,
        provider_id: &str,
        note: &str,
    ) -> Result<String, anyhow::Error> {
        let url = format!(
            "{}/users/{}/messages/{}/createForward",
            self.base_url, account, provider_id
        );
        self.retrying(|| async {
            let response = self
                .http_client
                .post(&url)
                .bearer_auth(token.bearer())
                .json(&json!({ "comment": note }))
                .send()
                .await
                .context("createForward request failed")?;
            if response.status() == StatusCode::UNAUTHORIZED
                || response.status() == StatusCode::FORBIDDEN
            {
                return Ok(RetryStep::Abort(anyhow::anyhow!(
                    "createForward returned {}",
                    response.status()
                )));
            }
            if response.status() != StatusCode::CREATED {
                anyhow::bail!("createForward returned {}", response.status());
            }
            let draft = response
                .json::<ForwardDraft>()
                .await
                .context("createForward response was not valid JSON")?;
            Ok(RetryStep::Done(draft.id))
        })
        .await
    }

    async fn patch_draft(
        &self,
        token: &AccessToken,
        account: &str,
        draft_id: &str,
        original_sender: &str,
        forward_to: &str,
        cc: &str,
    ) -> Result<(), anyhow::Error> {
        let url = format!("{}/users/{}/messages/{}", self.base_url, account, draft_id);
        let cc_recipients: Vec<_> = filter_cc(cc, &self.cc_exclusions)
            .into_iter()
            .map(|address| json!({ "emailAddress": { "address": address } }))
            .collect();
        let body = json!({
            "toRecipients": [{ "emailAddress": { "address": forward_to } }],
            "ccRecipients": cc_recipients,
            "replyTo": [{ "emailAddress": { "address": original_sender } }],
        });
        self.retrying(|| async {
            let response = self
                .http_client
                .patch(&url)
                .bearer_auth(token.bearer())
                .json(&body)
                .send()
                .await
                .context("draft update request failed")?;
            if response.status() != StatusCode::OK {
                anyhow::bail!("draft update returned {}", response.status());
            }
            Ok(RetryStep::Done(()))
        })
        .await
    }

    async fn send_draft(
        &self,
        token: &AccessToken,
        account: &str,
        draft_id: &str,
    ) -> Result<(), anyhow::Error> {
        let url = format!(
            "{}/users/{}/messages/{}/send",
            self.base_url, account, draft_id
        );
        self.retrying(|| async {
            let response = self
                .http_client
                .post(&url)
                .bearer_auth(token.bearer())
                .send()
                .await
                .context("draft send request failed")?;
            if response.status() != StatusCode::ACCEPTED {
                anyhow::bail!("draft send returned {}", response.status());
            }
            Ok(RetryStep::Done(()))
        })
        .await
    }

    /// Send a new mail from `account`. Three encoding strategies, tried in
    /// order; the first 202 wins. The provider is inconsistent about
    /// non-ASCII payloads, hence the ladder.
    #[tracing::instrument(skip_all, fields(account = %account, to = %to))]
    pub async fn send(
        &self,
        token: &AccessToken,
        account: &str,
        to: &str,
        subject: &str,
        html: &str,
        _text: &str,
    ) -> bool {
        let url = format!("{}/users/{}/sendMail", self.base_url, account);

        // (a) UTF-8 JSON with charset meta tags injected into the HTML
        let charset_html = ensure_charset(html);
        let payload = send_mail_payload(to, subject, &charset_html, None);
        if self.post_send_mail(token, &url, &payload, true).await {
            return true;
        }
        tracing::warn!("charset send strategy rejected, trying base64");

        // (b) base64 body with the provider's isBase64 hint
        let encoded = BASE64.encode(html.as_bytes());
        let payload = send_mail_payload(to, subject, &encoded, Some(true));
        if self.post_send_mail(token, &url, &payload, false).await {
            return true;
        }
        tracing::warn!("base64 send strategy rejected, trying plain JSON");

        // (c) plain JSON
        let payload = send_mail_payload(to, subject, html, None);
        self.post_send_mail(token, &url, &payload, false).await
    }

    async fn post_send_mail(
        &self,
        token: &AccessToken,
        url: &str,
        payload: &serde_json::Value,
        explicit_charset: bool,
    ) -> bool {
        let mut request = self.http_client.post(url).bearer_auth(token.bearer());
        request = if explicit_charset {
            request
                .header("Content-Type", "application/json; charset=utf-8")
                .body(payload.to_string())
        } else {
            request.json(payload)
        };
        match request.send().await {
            Ok(response) if response.status() == StatusCode::ACCEPTED => true,
            Ok(response) => {
                tracing::warn!(status = %response.status(), "sendMail rejected");
                false
            }
            Err(e) => {
                tracing::warn!(error.cause_chain = ?e, "sendMail transport error");
                false
            }
        }
    }

    /// Unread count in the account's inbox; used by the daily report.
    pub async fn count_unread(
        &self,
        token: &AccessToken,
        account: &str,
    ) -> Result<i64, GatewayError> {
        let url = format!(
            "{}/users/{}/mailFolders/inbox/messages?$filter=isRead eq false&$count=true",
            self.base_url, account
        );
        self.fetch_count(token, &url).await
    }

    /// Messages received in the account since `since`; used by the daily
    /// report's processing-variance alert.
    pub async fn count_received_since(
        &self,
        token: &AccessToken,
        account: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, GatewayError> {
        let url = format!(
            "{}/users/{}/messages?$filter=receivedDateTime ge {}&$count=true",
            self.base_url,
            account,
            since.format("%Y-%m-%dT%H:%M:%SZ")
        );
        self.fetch_count(token, &url).await
    }

    async fn fetch_count(
        &self,
        token: &AccessToken,
        url: &str,
    ) -> Result<i64, GatewayError> {
        let page = self
            .http_client
            .get(url)
            .bearer_auth(token.bearer())
            .header("ConsistencyLevel", "eventual")
            .send()
            .await
            .context("count request failed")?
            .error_for_status()
            .context("count request returned an error status")?
            .json::<CountedPage>()
            .await
            .context("count response was not valid JSON")?;
        Ok(page.count.unwrap_or(page.value.len() as i64))
    }

    /// Run `step` up to `MAX_ATTEMPTS` times with exponential backoff.
    /// `Abort` short-circuits for permanent failures.
    async fn retrying<T, F, Fut>(
        &self,
        step: F,
    ) -> Result<T, anyhow::Error>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<RetryStep<T>, anyhow::Error>>,
    {
        let mut last_error = None;
        for attempt in 0..MAX_ATTEMPTS {
            match step().await {
                Ok(RetryStep::Done(value)) => return Ok(value),
                Ok(RetryStep::Abort(e)) => return Err(e),
                Err(e) => {
                    tracing::warn!(error.cause_chain = ?e, attempt, "provider call failed");
                    last_error = Some(e);
                }
            }
            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(backoff(attempt)).await;
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("provider call failed")))
    }
}

enum RetryStep<T> {
    Done(T),
    /// Permanent failure; do not retry.
    Abort(anyhow::Error),
}

fn send_mail_payload(
    to: &str,
    subject: &str,
    content: &str,
    is_base64: Option<bool>,
) -> serde_json::Value {
    let mut body = json!({
        "contentType": "html",
        "content": content,
    });
    if let Some(flag) = is_base64 {
        body["isBase64"] = json!(flag);
    }
    json!({
        "message": {
            "subject": subject,
            "body": body,
            "toRecipients": [{ "emailAddress": { "address": to } }],
        },
        "saveToSentItems": "true",
    })
}

/// Make sure the HTML declares UTF-8, wrapping fragments in a full
/// document when necessary. Mail clients guess encodings otherwise.
fn ensure_charset(html: &str) -> String {
    let lower = html.to_lowercase();
    if !lower.contains("<!doctype html>") {
        return format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"UTF-8\">\n\
             <meta http-equiv=\"Content-Type\" content=\"text/html; charset=UTF-8\">\n\
             </head>\n<body>\n{html}\n</body>\n</html>"
        );
    }
    if lower.contains("<meta charset=") || lower.contains("content-type") {
        return html.to_string();
    }
    match lower.find("<head>") {
        Some(position) => {
            let insert_at = position + "<head>".len();
            let mut out = String::with_capacity(html.len() + 128);
            out.push_str(&html[..insert_at]);
            out.push_str(
                "\n<meta charset=\"UTF-8\">\n\
                 <meta http-equiv=\"Content-Type\" content=\"text/html; charset=UTF-8\">\n",
            );
            out.push_str(&html[insert_at..]);
            out
        }
        None => html.to_string(),
    }
}

/// Drop excluded addresses (case-insensitive) from a comma-joined CC list.
fn filter_cc(
    cc: &str,
    exclusions: &HashSet<String>,
) -> Vec<String> {
    cc.split(',')
        .map(|address| address.trim())
        .filter(|address| !address.is_empty())
        .filter(|address| !exclusions.contains(&address.to_lowercase()))
        .map(str::to_string)
        .collect()
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct MessageListPage {
    #[serde(default)]
    value: Vec<ProviderMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Deserialize)]
struct CountedPage {
    #[serde(rename = "@odata.count")]
    count: Option<i64>,
    #[serde(default)]
    value: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderMessage {
    id: Option<String>,
    internet_message_id: Option<String>,
    subject: Option<String>,
    from: Option<Recipient>,
    #[serde(default)]
    to_recipients: Vec<Recipient>,
    #[serde(default)]
    cc_recipients: Vec<Recipient>,
    received_date_time: Option<String>,
    body: Option<ItemBody>,
    has_attachments: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Recipient {
    email_address: Option<AddressField>,
}

#[derive(Deserialize)]
struct AddressField {
    address: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemBody {
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Deserialize)]
struct AttachmentPage {
    #[serde(default)]
    value: Vec<Attachment>,
}

#[derive(Deserialize)]
struct Attachment {
    name: Option<String>,
}

#[derive(Deserialize)]
struct ForwardDraft {
    id: String,
}

fn recipient_address(recipient: &Recipient) -> String {
    recipient
        .email_address
        .as_ref()
        .and_then(|e| e.address.clone())
        .unwrap_or_default()
}

fn join_addresses(recipients: &[Recipient]) -> String {
    recipients
        .iter()
        .map(recipient_address)
        .filter(|a| !a.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

fn assemble_message(payload: ProviderMessage) -> Option<Message> {
    let provider_id = payload.id?;
    let received_at = payload
        .received_date_time
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc));
    let (content_type, content) = payload
        .body
        .map(|b| {
            (
                b.content_type.unwrap_or_else(|| "text".into()),
                b.content.unwrap_or_default(),
            )
        })
        .unwrap_or_else(|| ("text".into(), String::new()));
    Some(Message::assemble(
        provider_id,
        payload.internet_message_id.unwrap_or_default(),
        payload.subject.unwrap_or_default(),
        payload.from.as_ref().map(recipient_address).unwrap_or_default(),
        join_addresses(&payload.to_recipients),
        join_addresses(&payload.cc_recipients),
        received_at,
        &content_type,
        content,
    ))
}
