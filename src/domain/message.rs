use chrono::DateTime;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;

static SYSTEM_SENDER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)microsoftexchange[a-f0-9]+@",
        r"(?i)mailer-daemon@",
        r"(?i)postmaster@",
        r"(?i)noreply@",
        r"(?i)no-reply@",
        r"(?i)donotreply@",
    ]
    .into_iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

const BOUNCE_SUBJECT_INDICATORS: &[&str] = &[
    "undeliverable",
    "delivery status notification",
    "delivery failure",
    "mail delivery failed",
    "returned mail",
    "bounce notification",
    "message not delivered",
    "delivery report",
    "non-delivery report",
];

const BOUNCE_BODY_INDICATORS: &[&str] = &[
    "rejected your message",
    "message could not be delivered",
    "delivery failed",
    "mailbox is full",
    "user is over quota",
    "address not found",
    "user unknown",
];

/// Bounce bodies quote the failed delivery; these pull out the mailbox the
/// original message was addressed to.
static BOUNCE_RECIPIENT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?im)Recipient Address:\s*([^\s\n\r]+)",
        r"(?im)To:\s*([^\s\n\r]+)",
        r"(?im)Original recipient:\s*([^\s\n\r]+)",
        r"(?im)The recipient was:\s*([^\s\n\r]+)",
        r"(?im)rejected your message to the following email addresses:\s*([^\s\n\r(]+)",
        r"(?im)couldn't be delivered to:\s*([^\s\n\r]+)",
        r"(?i)Your message to\s+([^\s]+)\s+couldn't be delivered",
    ]
    .into_iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static NAME_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\([^)]*\)$").unwrap());

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());

/// One in-flight message, immutable once assembled from the provider
/// payload.
#[derive(Debug, Clone)]
pub struct Message {
    /// Opaque provider id used for mark-read and forward calls.
    pub provider_id: String,
    /// RFC-822 Message-ID; the idempotency key.
    pub internet_message_id: String,
    pub subject: String,
    pub from: String,
    /// Comma-joined recipient list. For bounces this is the extracted
    /// original recipient when the bounce body yields one.
    pub to: String,
    pub cc: String,
    pub received_at: Option<DateTime<Utc>>,
    pub body_html: String,
    pub body_text: String,
    pub is_bounce: bool,
}

impl Message {
    /// Assemble from provider fields. Detects bounce/system notifications
    /// and, when the bounce body names the original recipient, overwrites
    /// `to` so downstream loop prevention sees the real mailbox.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        provider_id: String,
        internet_message_id: String,
        subject: String,
        from: String,
        to: String,
        cc: String,
        received_at: Option<DateTime<Utc>>,
        body_content_type: &str,
        body_content: String,
    ) -> Self {
        let (body_html, body_text) = if body_content_type.eq_ignore_ascii_case("html") {
            let text = strip_html(&body_content);
            (body_content, text)
        } else {
            (String::new(), body_content)
        };

        let is_bounce = is_bounce_or_system(&from, &subject, &body_text);
        let to = if is_bounce {
            extract_bounce_recipient(&body_text).unwrap_or(to)
        } else {
            to
        };

        Self {
            provider_id,
            internet_message_id,
            subject,
            from,
            to,
            cc,
            received_at,
            body_html,
            body_text,
            is_bounce,
        }
    }

    /// First recipient, as the autoresponder addresses a single mailbox.
    pub fn first_recipient(&self) -> &str {
        self.to.split(',').next().unwrap_or_default().trim()
    }

    /// The full message rendered as one block of text for classification.
    pub fn classification_text(&self) -> String {
        format!(
            "Subject: {}\nFrom: {}\nTo: {}\nCC: {}\n\n{}",
            self.subject, self.from, self.to, self.cc, self.body_text,
        )
    }
}

fn is_bounce_or_system(
    sender: &str,
    subject: &str,
    body: &str,
) -> bool {
    if sender.is_empty() {
        return false;
    }
    if SYSTEM_SENDER_PATTERNS.iter().any(|p| p.is_match(sender)) {
        return true;
    }
    let subject = subject.to_lowercase();
    if BOUNCE_SUBJECT_INDICATORS.iter().any(|i| subject.contains(i)) {
        return true;
    }
    let body = body.to_lowercase();
    BOUNCE_BODY_INDICATORS.iter().any(|i| body.contains(i))
}

fn extract_bounce_recipient(body: &str) -> Option<String> {
    for pattern in BOUNCE_RECIPIENT_PATTERNS.iter() {
        if let Some(capture) = pattern.captures(body).and_then(|c| c.get(1)) {
            let address = NAME_SUFFIX.replace(capture.as_str().trim(), "").into_owned();
            if address.contains('@') && address.contains('.') {
                return Some(address);
            }
        }
    }
    None
}

/// Minimal tag-stripping for the plain-text rendition the classifier and
/// loop guard consume. Not a full HTML parser; enough to expose the prose.
fn strip_html(html: &str) -> String {
    let text = HTML_TAG.replace_all(html, " ");
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
