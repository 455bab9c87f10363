//! The per-message state machine.
//!
//! A message fetched from the provider always terminates in exactly one
//! audit row (a LogRow or a SkippedRow), except for the attachment-scan
//! deferral, which leaves the message unread for the next batch. Side
//! effects follow a fixed order: duplicate and system-sender guards run
//! before anything else, the acknowledgment fork starts next, and a
//! forward must be confirmed before the source message is marked read —
//! the reverse would lose the message if forwarding then failed.

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::autoresponder::Autoresponder;
use crate::autoresponder::AutoresponseOutcome;
use crate::classifier::Classifier;
use crate::domain::Classification;
use crate::domain::Message;
use crate::domain::TokenUsage;
use crate::log_store::AutoresponseStatus;
use crate::log_store::LogRow;
use crate::log_store::LogStore;
use crate::log_store::SkipType;
use crate::log_store::SkippedRow;
use crate::log_store::Status;
use crate::loop_guard;
use crate::mail_gateway::AccessToken;
use crate::mail_gateway::ForwardOutcome;
use crate::mail_gateway::MailGateway;
use crate::message_log::AutoresponseDetail;
use crate::message_log::LogArea;
use crate::message_log::MessageLog;
use crate::router::Router;

/// How long a terminal state waits for the acknowledgment fork before
/// recording `pending` and moving on. The fork keeps running detached.
const AUTORESPONSE_JOIN: Duration = Duration::from_secs(10);

type AutoresponseTask = JoinHandle<(AutoresponseOutcome, AutoresponseDetail)>;

/// What the batch loop needs to know after one message.
pub struct ProcessOutcome {
    /// `(account, provider_id)` whose mark-read must be retried later.
    pub read_retry: Option<(String, String)>,
}

impl ProcessOutcome {
    fn done() -> Self { Self { read_retry: None } }
}

/// Destination and statuses of one terminal path.
struct Delivery {
    routed_to: String,
    intervention: bool,
    classification_status: Status,
    routing_status: Status,
    read_status: Status,
}

pub struct TriageEngine {
    gateway: Arc<MailGateway>,
    classifier: Classifier,
    router: Router,
    autoresponder: Arc<Autoresponder>,
    store: LogStore,
    corporate_domain: String,
}

impl TriageEngine {
    pub fn new(
        gateway: Arc<MailGateway>,
        classifier: Classifier,
        router: Router,
        autoresponder: Arc<Autoresponder>,
        store: LogStore,
        corporate_domain: String,
    ) -> Self {
        Self {
            gateway,
            classifier,
            router,
            autoresponder,
            store,
            corporate_domain,
        }
    }

    /// Run one message through the pipeline. Never returns an error: every
    /// failure below configuration level becomes a logged outcome.
    #[tracing::instrument(
        skip_all,
        fields(
            account = %account,
            subject = %message.subject,
            internet_message_id = %message.internet_message_id,
        )
    )]
    pub async fn process(
        &self,
        token: &AccessToken,
        account: &str,
        message: Message,
    ) -> ProcessOutcome {
        let started_at = Utc::now();
        let mut mlog = MessageLog::begin(
            &message.provider_id,
            &message.internet_message_id,
            &message.subject,
        );
        mlog.info(
            LogArea::System,
            format!("processing message from {}", message.from),
        );

        let outcome = self
            .run(token, account, &message, started_at, &mut mlog)
            .await;

        // the structured log must exist even when the main write failed
        let email_id = mlog.email_id().to_string();
        if let Err(e) = self
            .store
            .insert_system_log(&email_id, mlog.into_document())
            .await
        {
            tracing::error!(
                error.cause_chain = ?e,
                error.message = %e,
                "system log write failed"
            );
        }
        outcome
    }

    async fn run(
        &self,
        token: &AccessToken,
        account: &str,
        message: &Message,
        started_at: DateTime<Utc>,
        mlog: &mut MessageLog,
    ) -> ProcessOutcome {
        // duplicate gate, before any side effect
        match self.store.is_processed(&message.internet_message_id).await {
            Ok(true) => {
                let reason = format!(
                    "already processed: internet_message_id {} found in the audit log",
                    message.internet_message_id
                );
                return self
                    .skip(token, account, message, SkipType::Duplicate, reason, started_at, mlog)
                    .await;
            }
            Ok(false) => {}
            Err(e) => {
                // the unique index on the audit table remains the backstop
                mlog.warn(
                    LogArea::Database,
                    format!("duplicate lookup failed, continuing: {e:#}"),
                );
            }
        }

        // Exchange system senders are never classified or answered
        if let Some(detail) =
            loop_guard::exchange_system_match(&message.from, &self.corporate_domain)
        {
            let reason = format!("Exchange system sender {} ({detail})", message.from);
            return self
                .skip(
                    token,
                    account,
                    message,
                    SkipType::ExchangeSystem,
                    reason,
                    started_at,
                    mlog,
                )
                .await;
        }

        // acknowledgment fork; runs while we classify and forward
        let autoresponse = self.spawn_autoresponse(token, account, message);

        mlog.info(LogArea::Classification, "starting classification");
        match self.classifier.classify(&message.classification_text()).await {
            Ok(classification) => {
                mlog.info(
                    LogArea::Classification,
                    format!(
                        "classified as '{}' (action: {}, sentiment: {})",
                        classification.category,
                        classification.action_required.as_str(),
                        classification.sentiment.as_str(),
                    ),
                );
                self.deliver_classified(
                    token,
                    account,
                    message,
                    started_at,
                    classification,
                    autoresponse,
                    mlog,
                )
                .await
            }
            Err(e) => {
                mlog.error(
                    LogArea::Classification,
                    format!("classification failed: {e:#}"),
                );
                self.deliver_unclassified(
                    token,
                    account,
                    message,
                    started_at,
                    &format!("{e:#}"),
                    autoresponse,
                    mlog,
                )
                .await
            }
        }
    }

    /// Intentional abort before classification: mark read, write the skip
    /// audit, record that no acknowledgment was attempted.
    async fn skip(
        &self,
        token: &AccessToken,
        account: &str,
        message: &Message,
        skip_type: SkipType,
        reason: String,
        started_at: DateTime<Utc>,
        mlog: &mut MessageLog,
    ) -> ProcessOutcome {
        mlog.info(LogArea::System, format!("skipping message: {reason}"));

        if self
            .gateway
            .mark_read(token, account, &message.provider_id)
            .await
        {
            mlog.info(LogArea::System, "skipped message marked read");
        } else {
            mlog.warn(LogArea::System, "failed to mark skipped message read");
        }

        let row = SkippedRow {
            id: Uuid::new_v4(),
            internet_message_id: message.internet_message_id.clone(),
            account: account.to_string(),
            eml_subject: message.subject.clone(),
            eml_from: message.from.clone(),
            eml_to: message.to.clone(),
            skip_type,
            skip_reason: reason,
            processing_seconds: elapsed_seconds(started_at),
        };
        if let Err(e) = self.store.insert_skipped(&row).await {
            mlog.error(LogArea::Database, format!("skip audit write failed: {e:#}"));
        }

        mlog.record_autoresponse(AutoresponseDetail {
            attempted: false,
            successful: false,
            skip_reason: format!("message skipped ({})", skip_type.as_str()),
            recipient: message.from.clone(),
            ..Default::default()
        });
        ProcessOutcome::done()
    }

    fn spawn_autoresponse(
        &self,
        token: &AccessToken,
        account: &str,
        message: &Message,
    ) -> AutoresponseTask {
        let autoresponder = Arc::clone(&self.autoresponder);
        let token = token.clone();
        let account = account.to_string();
        let message = message.clone();
        tokio::spawn(async move { autoresponder.send(&token, &account, &message).await })
    }

    #[allow(clippy::too_many_arguments)]
    async fn deliver_classified(
        &self,
        token: &AccessToken,
        account: &str,
        message: &Message,
        started_at: DateTime<Utc>,
        classification: Classification,
        autoresponse: AutoresponseTask,
        mlog: &mut MessageLog,
    ) -> ProcessOutcome {
        let destination = match self.router.route(&classification.category) {
            Some(destination) => destination.to_string(),
            None => {
                mlog.warn(
                    LogArea::Forwarding,
                    format!(
                        "category '{}' has no route, using the original recipient",
                        classification.category
                    ),
                );
                self.router.fallback_destination(&message.to)
            }
        };
        let intervention = !destination.eq_ignore_ascii_case(&message.to);
        mlog.info(LogArea::Forwarding, format!("forwarding to {destination}"));

        match self
            .gateway
            .forward(
                token,
                account,
                &message.provider_id,
                &message.from,
                &destination,
                &message.cc,
                "AI Forwarded message",
            )
            .await
        {
            ForwardOutcome::Sent => {
                let read = self
                    .gateway
                    .mark_read(token, account, &message.provider_id)
                    .await;
                if !read {
                    mlog.warn(LogArea::System, "mark-read failed, queueing for retry");
                }
                let autoresponse_status = self.join_autoresponse(autoresponse, mlog).await;
                let row = build_row(
                    account,
                    message,
                    started_at,
                    Some(&classification),
                    None,
                    Delivery {
                        routed_to: destination,
                        intervention,
                        classification_status: Status::Success,
                        routing_status: Status::Success,
                        read_status: Status::from_flag(read),
                    },
                    autoresponse_status,
                );
                self.write_row(&row, mlog).await;
                ProcessOutcome {
                    read_retry: (!read)
                        .then(|| (account.to_string(), message.provider_id.clone())),
                }
            }
            ForwardOutcome::ScanPending => self.defer_for_scan(autoresponse, mlog).await,
            ForwardOutcome::Failed => {
                mlog.warn(
                    LogArea::Forwarding,
                    format!("forward to {destination} failed, falling back to the original recipient"),
                );
                self.fallback_forward(
                    token,
                    account,
                    message,
                    started_at,
                    Some(classification),
                    None,
                    autoresponse,
                    mlog,
                )
                .await
            }
        }
    }

    async fn deliver_unclassified(
        &self,
        token: &AccessToken,
        account: &str,
        message: &Message,
        started_at: DateTime<Utc>,
        classifier_error: &str,
        autoresponse: AutoresponseTask,
        mlog: &mut MessageLog,
    ) -> ProcessOutcome {
        let destination = self.router.fallback_destination(&message.to);
        mlog.info(
            LogArea::Forwarding,
            format!("forwarding unclassified message to {destination}"),
        );

        match self
            .gateway
            .forward(
                token,
                account,
                &message.provider_id,
                &message.from,
                &destination,
                &message.cc,
                "AI Forwarded message by default due to classification error",
            )
            .await
        {
            ForwardOutcome::Sent => {
                let read = self
                    .gateway
                    .mark_read(token, account, &message.provider_id)
                    .await;
                if !read {
                    mlog.warn(LogArea::System, "mark-read failed, queueing for retry");
                }
                let autoresponse_status = self.join_autoresponse(autoresponse, mlog).await;
                let row = build_row(
                    account,
                    message,
                    started_at,
                    None,
                    Some(classifier_error),
                    Delivery {
                        routed_to: destination,
                        intervention: false,
                        classification_status: Status::Error,
                        routing_status: Status::Success,
                        read_status: Status::from_flag(read),
                    },
                    autoresponse_status,
                );
                self.write_row(&row, mlog).await;
                ProcessOutcome {
                    read_retry: (!read)
                        .then(|| (account.to_string(), message.provider_id.clone())),
                }
            }
            ForwardOutcome::ScanPending => self.defer_for_scan(autoresponse, mlog).await,
            ForwardOutcome::Failed => {
                mlog.error(
                    LogArea::Forwarding,
                    "unclassified fallback forward failed; message stays unread",
                );
                let autoresponse_status = self.join_autoresponse(autoresponse, mlog).await;
                let row = build_row(
                    account,
                    message,
                    started_at,
                    None,
                    Some(classifier_error),
                    Delivery {
                        routed_to: destination,
                        intervention: false,
                        classification_status: Status::Error,
                        routing_status: Status::Error,
                        read_status: Status::Error,
                    },
                    autoresponse_status,
                );
                self.write_row(&row, mlog).await;
                ProcessOutcome::done()
            }
        }
    }

    /// Second forwarding attempt, to the original recipient (with the
    /// consolidation-bin override). A fallback is by definition not an AI
    /// decision, so `intervention` is reset.
    #[allow(clippy::too_many_arguments)]
    async fn fallback_forward(
        &self,
        token: &AccessToken,
        account: &str,
        message: &Message,
        started_at: DateTime<Utc>,
        classification: Option<Classification>,
        classifier_error: Option<&str>,
        autoresponse: AutoresponseTask,
        mlog: &mut MessageLog,
    ) -> ProcessOutcome {
        let fallback = self.router.fallback_destination(&message.to);
        mlog.info(
            LogArea::Forwarding,
            format!("fallback forwarding to {fallback}"),
        );

        match self
            .gateway
            .forward(
                token,
                account,
                &message.provider_id,
                &message.from,
                &fallback,
                &message.cc,
                "AI Forwarded message (fallback routing)",
            )
            .await
        {
            ForwardOutcome::Sent => {
                let read = self
                    .gateway
                    .mark_read(token, account, &message.provider_id)
                    .await;
                if !read {
                    mlog.warn(LogArea::System, "mark-read failed, queueing for retry");
                }
                let autoresponse_status = self.join_autoresponse(autoresponse, mlog).await;
                let row = build_row(
                    account,
                    message,
                    started_at,
                    classification.as_ref(),
                    classifier_error,
                    Delivery {
                        routed_to: format!("{fallback} (fallback routing)"),
                        intervention: false,
                        classification_status: if classification.is_some() {
                            Status::Success
                        } else {
                            Status::Error
                        },
                        routing_status: Status::Error,
                        read_status: Status::from_flag(read),
                    },
                    autoresponse_status,
                );
                self.write_row(&row, mlog).await;
                ProcessOutcome {
                    read_retry: (!read)
                        .then(|| (account.to_string(), message.provider_id.clone())),
                }
            }
            ForwardOutcome::ScanPending => self.defer_for_scan(autoresponse, mlog).await,
            ForwardOutcome::Failed => {
                mlog.critical(
                    LogArea::Forwarding,
                    "all delivery attempts failed; message stays unread",
                );
                let autoresponse_status = self.join_autoresponse(autoresponse, mlog).await;
                let row = build_row(
                    account,
                    message,
                    started_at,
                    classification.as_ref(),
                    classifier_error,
                    Delivery {
                        routed_to: "DELIVERY FAILED".to_string(),
                        intervention: false,
                        classification_status: if classification.is_some() {
                            Status::Success
                        } else {
                            Status::Error
                        },
                        routing_status: Status::Error,
                        read_status: Status::Error,
                    },
                    autoresponse_status,
                );
                self.write_row(&row, mlog).await;
                ProcessOutcome::done()
            }
        }
    }

    /// Attachment scan still running: no forward, no mark-read, no audit
    /// row. The next batch picks the message up again.
    async fn defer_for_scan(
        &self,
        autoresponse: AutoresponseTask,
        mlog: &mut MessageLog,
    ) -> ProcessOutcome {
        mlog.warn(
            LogArea::Forwarding,
            "attachment safety scan in progress; leaving unread for the next batch",
        );
        let _ = self.join_autoresponse(autoresponse, mlog).await;
        ProcessOutcome::done()
    }

    /// Bounded join on the acknowledgment fork. On timeout the task is
    /// left running and its effect, if any, lands after `pending` has been
    /// recorded.
    async fn join_autoresponse(
        &self,
        autoresponse: AutoresponseTask,
        mlog: &mut MessageLog,
    ) -> AutoresponseStatus {
        match tokio::time::timeout(AUTORESPONSE_JOIN, autoresponse).await {
            Ok(Ok((outcome, detail))) => {
                mlog.record_autoresponse(detail);
                match outcome {
                    AutoresponseOutcome::Sent => {
                        mlog.info(LogArea::Autoresponse, "acknowledgment sent");
                        AutoresponseStatus::Success
                    }
                    AutoresponseOutcome::Suppressed(reason) => {
                        mlog.info(
                            LogArea::Autoresponse,
                            format!("acknowledgment suppressed: {reason}"),
                        );
                        AutoresponseStatus::NotAttempted
                    }
                    AutoresponseOutcome::Failed(reason) => {
                        mlog.error(
                            LogArea::Autoresponse,
                            format!("acknowledgment failed: {reason}"),
                        );
                        AutoresponseStatus::Failed
                    }
                }
            }
            Ok(Err(e)) => {
                mlog.error(
                    LogArea::Autoresponse,
                    format!("acknowledgment task aborted: {e}"),
                );
                AutoresponseStatus::Failed
            }
            Err(_) => {
                mlog.warn(
                    LogArea::Autoresponse,
                    "acknowledgment still running at the join window",
                );
                AutoresponseStatus::Pending
            }
        }
    }

    async fn write_row(
        &self,
        row: &LogRow,
        mlog: &mut MessageLog,
    ) {
        match self.store.insert_log(row).await {
            Ok(()) => mlog.info(LogArea::Database, "audit row written"),
            Err(e) => mlog.error(LogArea::Database, format!("audit row write failed: {e:#}")),
        }
    }
}

fn elapsed_seconds(since: DateTime<Utc>) -> f64 {
    (Utc::now() - since).num_milliseconds() as f64 / 1000.0
}

fn build_row(
    account: &str,
    message: &Message,
    started_at: DateTime<Utc>,
    classification: Option<&Classification>,
    classifier_error: Option<&str>,
    delivery: Delivery,
    autoresponse_status: AutoresponseStatus,
) -> LogRow {
    let end_at = Utc::now();
    let received_at = message.received_at.unwrap_or(started_at);
    let turnaround_seconds = ((end_at - received_at).num_milliseconds() as f64 / 1000.0).max(0.0);

    let (category, reason, top_categories, action_required, sentiment, cost_usd, primary, light) =
        match classification {
            Some(c) => (
                c.category.clone(),
                c.reason.clone(),
                c.top_categories_joined(),
                c.action_required.as_str().to_string(),
                c.sentiment.as_str().to_string(),
                c.cost_usd,
                c.primary_usage,
                c.light_usage,
            ),
            None => (
                "error".to_string(),
                format!("error : {}", classifier_error.unwrap_or("unknown")),
                String::new(),
                "error".to_string(),
                "error".to_string(),
                0.0,
                TokenUsage::default(),
                TokenUsage::default(),
            ),
        };

    LogRow {
        id: Uuid::new_v4(),
        internet_message_id: message.internet_message_id.clone(),
        account: account.to_string(),
        received_at,
        processed_at: started_at,
        end_at,
        turnaround_seconds,
        eml_from: message.from.clone(),
        eml_to: message.to.clone(),
        eml_cc: message.cc.clone(),
        eml_subject: message.subject.clone(),
        eml_body: message.body_text.clone(),
        category,
        category_reason: reason,
        top_categories,
        action_required,
        sentiment,
        cost_usd,
        primary_prompt_tokens: primary.prompt,
        primary_completion_tokens: primary.completion,
        primary_cached_tokens: primary.cached,
        light_prompt_tokens: light.prompt,
        light_completion_tokens: light.completion,
        light_cached_tokens: light.cached,
        routed_to: delivery.routed_to,
        intervention: delivery.intervention,
        classification_status: delivery.classification_status,
        routing_status: delivery.routing_status,
        read_status: delivery.read_status,
        autoresponse_status,
    }
}
