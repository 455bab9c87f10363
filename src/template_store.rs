//! Blob-backed autoresponse templates.
//!
//! Templates are exported from Word/Outlook and live in per-mailbox
//! folders; their image references are relative and must be rewritten to
//! the blob account's public URL before the HTML leaves the building.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Captures;
use regex::Regex;
use reqwest::Client;
use reqwest::StatusCode;
use uuid::Uuid;

pub const DEFAULT_SUBJECT: &str = "Thank you for contacting us";

/// Acknowledgment body used when no template resolves for the recipient.
/// No image rewriting applies to it.
const DEFAULT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta http-equiv="Content-Type" content="text/html; charset=UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
</head>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333333;">
    <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
        <h2 style="color: #0056b3;">Thank you for contacting us</h2>
        <p>Good day,</p>
        <p>Thank you for reaching out to us. One of our dedicated consultants
        will be in contact with you during operating hours within the next
        business day.</p>
        <p>Please do not reply to this e-mail as it is an automated response.</p>
        <p>Regards,</p>
        <p>The Services Team</p>
        <div style="margin-top: 30px; padding-top: 20px; border-top: 1px solid #dddddd; font-size: 12px; color: #666666;">
            <p>This is an automated response. Please do not reply to this email.</p>
        </div>
    </div>
</body>
</html>
"#;

static IMG_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(<img[^>]*?\bsrc\s*=\s*)(["'])([^"']+)(["'])"#).unwrap());
static VML_SRC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(<v:imagedata[^>]*?\bsrc\s*=\s*)(["'])([^"']+)(["'])"#).unwrap()
});
static STYLE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)url\(\s*['"]?([^'")]+?)['"]?\s*\)"#).unwrap());

/// A template resolved and rewritten for one recipient.
pub struct RenderedTemplate {
    pub html: String,
    /// Blob folder the template came from; `None` for the built-in body.
    pub folder: Option<String>,
    pub subject: String,
}

pub struct TemplateStore {
    http_client: Client,
    base_url: String,
    container: String,
    public_url: String,
    folder_mapping: HashMap<String, String>,
}

impl TemplateStore {
    pub fn new(
        base_url: String,
        container: String,
        public_url: String,
        folder_mapping: HashMap<String, String>,
        timeout: std::time::Duration,
    ) -> Self {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build the blob HTTP client");
        Self {
            http_client,
            base_url,
            container,
            public_url,
            folder_mapping,
        }
    }

    /// Resolve, decode and rewrite the template for `recipient`. Falls
    /// back to the built-in body when no blob exists; the returned HTML is
    /// ready to send.
    #[tracing::instrument(skip_all, fields(recipient = %recipient))]
    pub async fn load(
        &self,
        recipient: &str,
        internet_message_id: &str,
    ) -> RenderedTemplate {
        let recipient = recipient.trim().to_lowercase();
        let (mailbox, domain) = match recipient.split_once('@') {
            Some((mailbox, domain)) => (mailbox.to_string(), domain.to_string()),
            None => (recipient.clone(), String::new()),
        };

        let folder = self
            .folder_mapping
            .get(&recipient)
            .or_else(|| self.folder_mapping.get(&mailbox))
            .cloned()
            .unwrap_or(mailbox.clone());

        let candidates = [
            format!("{folder}/{mailbox}@{domain}.htm"),
            format!("{folder}/{mailbox}@{domain}.html"),
            format!("{folder}/{folder}.html"),
        ];

        for path in &candidates {
            match self.fetch_blob(path).await {
                Some(bytes) => {
                    tracing::info!(path = %path, "template resolved");
                    let html = decode_template(&bytes);
                    let html = self.rewrite_image_references(&html, &folder);
                    let html = substitute_reference_id(&html, internet_message_id);
                    return RenderedTemplate {
                        html,
                        subject: self.subject_for(Some(&folder)),
                        folder: Some(folder),
                    };
                }
                None => continue,
            }
        }

        tracing::info!("no template for recipient, using the built-in body");
        RenderedTemplate {
            html: substitute_reference_id(DEFAULT_TEMPLATE, internet_message_id),
            folder: None,
            subject: self.subject_for(None),
        }
    }

    /// Subject line for a template folder; unmapped folders share the
    /// default.
    pub fn subject_for(
        &self,
        folder: Option<&str>,
    ) -> String {
        match folder {
            Some("tracking") | Some("digitalcomms") => "Auto Reply".to_string(),
            Some("claims") => "Auto Response".to_string(),
            _ => DEFAULT_SUBJECT.to_string(),
        }
    }

    async fn fetch_blob(
        &self,
        path: &str,
    ) -> Option<Vec<u8>> {
        let url = format!("{}/{}/{}", self.base_url, self.container, path);
        match self.http_client.get(&url).send().await {
            Ok(response) if response.status() == StatusCode::OK => {
                response.bytes().await.ok().map(|b| b.to_vec())
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error.cause_chain = ?e, path = %path, "blob fetch failed");
                None
            }
        }
    }

    /// Rewrite relative image references (plain `<img>`, Office VML
    /// `<v:imagedata>` and inline-style `url(...)`) to absolute blob URLs.
    /// Absolute http(s) references are left untouched.
    fn rewrite_image_references(
        &self,
        html: &str,
        folder: &str,
    ) -> String {
        let base = format!(
            "{}/{}/{}",
            self.public_url.trim_end_matches('/'),
            self.container,
            folder
        );

        let rewrite_attr = |captures: &Captures| -> String {
            let src = &captures[3];
            if src.starts_with("http") {
                return captures[0].to_string();
            }
            match image_filename(src) {
                Some(filename) => format!(
                    "{}{}{}/{}{}",
                    &captures[1], &captures[2], base, filename, &captures[4]
                ),
                None => captures[0].to_string(),
            }
        };

        let html = IMG_SRC.replace_all(html, &rewrite_attr);
        let html = VML_SRC.replace_all(&html, &rewrite_attr);
        let html = STYLE_URL.replace_all(&html, |captures: &Captures| {
            let url = &captures[1];
            if url.starts_with("http") {
                return captures[0].to_string();
            }
            match image_filename(url) {
                Some(filename) => format!("url('{base}/{filename}')"),
                None => captures[0].to_string(),
            }
        });
        html.into_owned()
    }
}

/// Word exports are usually UTF-8 but sometimes Windows-1252; decode
/// accordingly, with lossy UTF-8 as the last resort.
fn decode_template(bytes: &[u8]) -> String {
    if let Ok(utf8) = std::str::from_utf8(bytes) {
        return utf8.to_string();
    }
    let (decoded, _, had_errors) = encoding_rs::WINDOWS_1252.decode(bytes);
    if !had_errors {
        return decoded.into_owned();
    }
    String::from_utf8_lossy(bytes).into_owned()
}

/// Extract the bare filename from a template image reference: the part
/// after `_files/` (Word export layout) or after the final slash.
fn image_filename(src: &str) -> Option<String> {
    let src = src.replace('\\', "/");
    let src = src.trim();
    if src.is_empty() {
        return None;
    }
    let filename = if let Some((_, rest)) = src.split_once("_files/") {
        rest
    } else if let Some(position) = src.rfind('/') {
        &src[position + 1..]
    } else {
        src
    };
    (!filename.is_empty()).then(|| filename.to_string())
}

/// Replace `{{REFERENCE_ID}}` with the last 10 characters of the message
/// id (or a random UUID when the provider supplied none).
fn substitute_reference_id(
    html: &str,
    internet_message_id: &str,
) -> String {
    let source = if internet_message_id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        internet_message_id.to_string()
    };
    let tail: Vec<char> = source.chars().collect();
    let start = tail.len().saturating_sub(10);
    let reference: String = tail[start..].iter().collect();
    html.replace("{{REFERENCE_ID}}", &reference)
}
