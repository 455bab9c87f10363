//! Sends the templated acknowledgment back to the original sender,
//! subject to loop prevention.

use std::sync::Arc;

use crate::domain::EmailAddress;
use crate::domain::Message;
use crate::loop_guard;
use crate::mail_gateway::AccessToken;
use crate::mail_gateway::MailGateway;
use crate::message_log::AutoresponseDetail;
use crate::template_store::TemplateStore;

const PLAIN_TEXT_FALLBACK: &str = "Thank you for your email. We have received your message and \
     will respond as soon as possible. This is an automated response. Please do not reply to \
     this email.";

/// What became of one acknowledgment attempt. `Suppressed` is a decision,
/// not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoresponseOutcome {
    Sent,
    Suppressed(String),
    Failed(String),
}

pub struct Autoresponder {
    gateway: Arc<MailGateway>,
    templates: Arc<TemplateStore>,
    accounts: Vec<String>,
    corporate_domain: String,
}

impl Autoresponder {
    pub fn new(
        gateway: Arc<MailGateway>,
        templates: Arc<TemplateStore>,
        accounts: Vec<String>,
        corporate_domain: String,
    ) -> Self {
        Self {
            gateway,
            templates,
            accounts,
            corporate_domain,
        }
    }

    /// Evaluate the loop guard, resolve the template and send. Returns the
    /// outcome plus the detail object for the message's system log.
    #[tracing::instrument(skip_all, fields(sender = %message.from))]
    pub async fn send(
        &self,
        token: &AccessToken,
        account: &str,
        message: &Message,
    ) -> (AutoresponseOutcome, AutoresponseDetail) {
        let recipient = message.first_recipient().to_string();
        let body = if message.body_text.is_empty() {
            &message.body_html
        } else {
            &message.body_text
        };

        if let Some(reason) = loop_guard::should_suppress(
            &message.from,
            &recipient,
            &message.subject,
            body,
            &self.accounts,
            &self.corporate_domain,
        ) {
            tracing::info!(reason = %reason, "autoresponse suppressed");
            let detail = AutoresponseDetail {
                attempted: false,
                successful: false,
                skip_reason: reason.clone(),
                recipient: message.from.clone(),
                ..Default::default()
            };
            return (AutoresponseOutcome::Suppressed(reason), detail);
        }

        // the guard only screens degenerate addresses; the reply target
        // must also be syntactically deliverable
        let reply_to = match EmailAddress::parse(message.from.clone()) {
            Ok(address) => address,
            Err(e) => {
                tracing::warn!(error.message = %e, "sender address failed validation");
                let detail = AutoresponseDetail {
                    attempted: false,
                    successful: false,
                    skip_reason: e.clone(),
                    recipient: message.from.clone(),
                    ..Default::default()
                };
                return (AutoresponseOutcome::Suppressed(e), detail);
            }
        };

        let template = self
            .templates
            .load(&recipient, &message.internet_message_id)
            .await;

        let mut detail = AutoresponseDetail {
            attempted: true,
            successful: false,
            template_folder: template.folder.clone().unwrap_or_default(),
            subject_line: template.subject.clone(),
            recipient: message.from.clone(),
            ..Default::default()
        };

        let sent = self
            .gateway
            .send(
                token,
                account,
                reply_to.as_ref(),
                &template.subject,
                &template.html,
                PLAIN_TEXT_FALLBACK,
            )
            .await;

        if sent {
            detail.successful = true;
            (AutoresponseOutcome::Sent, detail)
        } else {
            let reason = format!("provider rejected the acknowledgment to {}", message.from);
            detail.error_message = reason.clone();
            (AutoresponseOutcome::Failed(reason), detail)
        }
    }
}
