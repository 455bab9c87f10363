//! Decides whether an automatic acknowledgment must be suppressed.
//!
//! Every rule errs on the side of silence: a missed acknowledgment costs a
//! customer nothing, while answering a mailer-daemon can bounce forever.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;

/// Addresses Exchange invents for its own notifications.
static EXCHANGE_SENDER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)microsoftexchange[a-f0-9]+@",
        r"(?i)exchange[a-f0-9]+@",
        r"(?i)[a-f0-9]{32}@",
    ]
    .into_iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

const SYSTEM_INDICATORS: &[&str] = &[
    "noreply",
    "no-reply",
    "donotreply",
    "do-not-reply",
    "mailer-daemon",
    "postmaster",
    "daemon",
    "mail-daemon",
    "microsoftexchange",
    "exchange",
    "outlook-com",
    "auto-reply",
    "autoreply",
    "bounce",
    "delivery",
    "system",
    "noresponse",
    "no-response",
];

const BOUNCE_SUBJECT_INDICATORS: &[&str] = &[
    "undeliverable",
    "undelivered",
    "delivery status notification",
    "delivery failure",
    "mail delivery failed",
    "returned mail",
    "bounce notification",
    "message not delivered",
    "delivery report",
    "non-delivery report",
    "ndr",
    "mail delivery subsystem",
    "postmaster notification",
    "auto-reply",
    "automatic reply",
    "out of office",
    "mailbox full",
    "user unknown",
    "address not found",
    "relay access denied",
    "message blocked",
    "delivery incomplete",
    "message rejected",
    "smtp error",
];

const BOUNCE_SUBJECT_PREFIXES: &[&str] =
    &["undeliverable:", "delivery failure:", "returned mail:", "ndr:"];

const BOUNCE_BODY_INDICATORS: &[&str] = &[
    "rejected your message",
    "message could not be delivered",
    "recipient mailbox is full",
    "user is over quota",
    "address not found",
    "user unknown",
    "mailbox unavailable",
    "delivery failed",
    "permanent failure",
    "temporary failure",
    "bounce message",
    "non-delivery report",
    "postmaster",
    "mail delivery subsystem",
    "delivery status notification",
    "smtp error",
    "relay access denied",
    "message blocked",
    "mailbox does not exist",
    "invalid recipient",
];

const AUTORESPONSE_SUBJECT_INDICATORS: &[&str] = &[
    "thank you for contacting us",
    "auto response",
    "automatic response",
    "we have received your email",
    "automated reply",
    "auto-reply",
];

const SAME_DOMAIN_SYSTEM_INDICATORS: &[&str] = &["exchange", "system", "daemon", "admin"];

/// Does the sender look like an Exchange system address? Returns the
/// matching pattern so skip audits can name it.
pub fn exchange_system_match(
    sender: &str,
    corporate_domain: &str,
) -> Option<String> {
    let sender = sender.to_lowercase();
    if let Some(pattern) = EXCHANGE_SENDER_PATTERNS.iter().find(|p| p.is_match(&sender)) {
        return Some(format!("matches pattern '{}'", pattern.as_str()));
    }
    if sender.contains("microsoftexchange") && sender.contains(&corporate_domain.to_lowercase()) {
        return Some(format!("Exchange system sender at {corporate_domain}"));
    }
    None
}

/// Decide whether the autoresponse to `sender` must be suppressed.
/// `Some(reason)` means suppress; `None` means the acknowledgment may go
/// out. Rules are evaluated in order and the first match wins.
pub fn should_suppress(
    sender: &str,
    recipient: &str,
    subject: &str,
    body: &str,
    autoresponse_accounts: &[String],
    corporate_domain: &str,
) -> Option<String> {
    // 1-2. degenerate addresses
    if sender.trim().graphemes(true).count() < 5 {
        return Some("no usable sender address".into());
    }
    if recipient.trim().graphemes(true).count() < 5 {
        return Some("no usable recipient address".into());
    }

    let sender_clean = sender.to_lowercase().trim().to_string();
    let recipient_clean = recipient.to_lowercase().trim().to_string();

    // 2-3. never answer ourselves, never answer our own sends
    for account in autoresponse_accounts {
        let account_clean = account.to_lowercase().trim().to_string();
        if account_clean.is_empty() {
            continue;
        }
        if recipient_clean == account_clean {
            return Some(format!("sent directly to autoresponse account {recipient}"));
        }
        if sender_clean == account_clean {
            return Some(format!("sender is an autoresponse account: {sender}"));
        }
    }

    // 4-5. Exchange system senders
    if let Some(detail) = exchange_system_match(&sender_clean, corporate_domain) {
        return Some(format!("Exchange system sender {sender} ({detail})"));
    }

    // 6. system-style local parts
    let sender_local = sender_clean.split('@').next().unwrap_or(&sender_clean);
    if let Some(indicator) = SYSTEM_INDICATORS.iter().find(|i| sender_local.contains(**i)) {
        return Some(format!(
            "system/automated sender {sender} (contains '{indicator}')"
        ));
    }

    // 7. bounce subjects
    let subject_clean = subject.to_lowercase().trim().to_string();
    if let Some(indicator) = BOUNCE_SUBJECT_INDICATORS
        .iter()
        .find(|i| subject_clean.contains(**i))
    {
        return Some(format!(
            "bounce indicator in subject '{subject}' (contains '{indicator}')"
        ));
    }
    if let Some(prefix) = BOUNCE_SUBJECT_PREFIXES
        .iter()
        .find(|p| subject_clean.starts_with(**p))
    {
        return Some(format!(
            "bounce prefix in subject '{subject}' (starts with '{prefix}')"
        ));
    }

    // 8. bounce bodies
    let body_clean = body.to_lowercase();
    if let Some(indicator) = BOUNCE_BODY_INDICATORS.iter().find(|i| body_clean.contains(**i)) {
        return Some(format!("bounce indicator in body (contains '{indicator}')"));
    }

    // 9. replies to a previous acknowledgment
    if let Some(indicator) = AUTORESPONSE_SUBJECT_INDICATORS
        .iter()
        .find(|i| subject_clean.contains(**i))
    {
        return Some(format!(
            "prior autoresponse detected in subject '{subject}' (contains '{indicator}')"
        ));
    }

    // 10. same-domain system traffic
    if let (Some(sender_domain), Some(recipient_domain)) = (
        sender_clean.split('@').nth(1),
        recipient_clean.split('@').nth(1),
    ) {
        if sender_domain == recipient_domain
            && SAME_DOMAIN_SYSTEM_INDICATORS
                .iter()
                .any(|i| sender_local.contains(*i))
        {
            return Some(format!(
                "internal system communication: {sender} to {recipient}"
            ));
        }
    }

    None
}
