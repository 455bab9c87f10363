//! Durable, idempotent audit persistence.
//!
//! One row per processed message in `logs` (unique on the internet
//! message id), one row per intentional skip in `skipped_mails`, and the
//! per-message structured log document in `system_logs`. Writes are
//! retried on transient database errors; a unique-index violation is
//! final, that row already exists.

use std::time::Duration;

use anyhow::Context;
use chrono::DateTime;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

const MAX_ATTEMPTS: u32 = 3;

fn backoff(attempt: u32) -> Duration { Duration::from_secs(1 << attempt) }

/// Outcome per pipeline leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub fn from_flag(success: bool) -> Self {
        if success {
            Self::Success
        } else {
            Self::Error
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoresponseStatus {
    Success,
    Failed,
    /// The fork had not finished within the join window.
    Pending,
    NotAttempted,
}

impl AutoresponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Pending => "pending",
            Self::NotAttempted => "not_attempted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipType {
    Duplicate,
    ExchangeSystem,
}

impl SkipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Duplicate => "DUPLICATE",
            Self::ExchangeSystem => "EXCHANGE_SYSTEM",
        }
    }
}

/// One audit row, written exactly once per processed message.
#[derive(Debug, Clone)]
pub struct LogRow {
    pub id: Uuid,
    pub internet_message_id: String,
    pub account: String,
    pub received_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub turnaround_seconds: f64,
    pub eml_from: String,
    pub eml_to: String,
    pub eml_cc: String,
    pub eml_subject: String,
    pub eml_body: String,
    pub category: String,
    pub category_reason: String,
    pub top_categories: String,
    pub action_required: String,
    pub sentiment: String,
    pub cost_usd: f64,
    pub primary_prompt_tokens: i64,
    pub primary_completion_tokens: i64,
    pub primary_cached_tokens: i64,
    pub light_prompt_tokens: i64,
    pub light_completion_tokens: i64,
    pub light_cached_tokens: i64,
    pub routed_to: String,
    pub intervention: bool,
    pub classification_status: Status,
    pub routing_status: Status,
    pub read_status: Status,
    pub autoresponse_status: AutoresponseStatus,
}

/// Audit of a message intentionally skipped before classification.
#[derive(Debug, Clone)]
pub struct SkippedRow {
    pub id: Uuid,
    pub internet_message_id: String,
    pub account: String,
    pub eml_subject: String,
    pub eml_from: String,
    pub eml_to: String,
    pub skip_type: SkipType,
    pub skip_reason: String,
    pub processing_seconds: f64,
}

#[derive(Clone)]
pub struct LogStore {
    pool: PgPool,
}

impl LogStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }

    /// Has a message with this id already produced an audit row?
    #[tracing::instrument(skip_all, fields(internet_message_id = %internet_message_id))]
    pub async fn is_processed(
        &self,
        internet_message_id: &str,
    ) -> Result<bool, anyhow::Error> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM logs WHERE internet_message_id = $1)",
        )
        .bind(internet_message_id)
        .fetch_one(&self.pool)
        .await
        .context("duplicate lookup failed")?;
        Ok(row.0)
    }

    #[tracing::instrument(skip_all, fields(internet_message_id = %row.internet_message_id))]
    pub async fn insert_log(
        &self,
        row: &LogRow,
    ) -> Result<(), anyhow::Error> {
        self.with_retries(|| async {
            sqlx::query(
                r#"
                INSERT INTO logs
                    (
                    id, internet_message_id, account,
                    received_at, processed_at, end_at, turnaround_seconds,
                    eml_from, eml_to, eml_cc, eml_subject, eml_body,
                    category, category_reason, top_categories,
                    action_required, sentiment, cost_usd,
                    primary_prompt_tokens, primary_completion_tokens, primary_cached_tokens,
                    light_prompt_tokens, light_completion_tokens, light_cached_tokens,
                    routed_to, intervention,
                    classification_status, routing_status, read_status, autoresponse_status
                    )
                VALUES
                    (
                    $1, $2, $3,
                    $4, $5, $6, $7,
                    $8, $9, $10, $11, $12,
                    $13, $14, $15,
                    $16, $17, $18,
                    $19, $20, $21,
                    $22, $23, $24,
                    $25, $26,
                    $27, $28, $29, $30
                    )
            "#,
            )
            .bind(row.id)
            .bind(&row.internet_message_id)
            .bind(&row.account)
            .bind(row.received_at)
            .bind(row.processed_at)
            .bind(row.end_at)
            .bind(row.turnaround_seconds)
            .bind(truncate_for_storage(&row.eml_from))
            .bind(truncate_for_storage(&row.eml_to))
            .bind(truncate_for_storage(&row.eml_cc))
            .bind(truncate_for_storage(&row.eml_subject))
            .bind(truncate_for_storage(&row.eml_body))
            .bind(&row.category)
            .bind(truncate_for_storage(&row.category_reason))
            .bind(&row.top_categories)
            .bind(&row.action_required)
            .bind(&row.sentiment)
            .bind(row.cost_usd)
            .bind(row.primary_prompt_tokens)
            .bind(row.primary_completion_tokens)
            .bind(row.primary_cached_tokens)
            .bind(row.light_prompt_tokens)
            .bind(row.light_completion_tokens)
            .bind(row.light_cached_tokens)
            .bind(&row.routed_to)
            .bind(row.intervention)
            .bind(row.classification_status.as_str())
            .bind(row.routing_status.as_str())
            .bind(row.read_status.as_str())
            .bind(row.autoresponse_status.as_str())
            .execute(&self.pool)
            .await
        })
        .await
        .context("audit row insert failed")
    }

    #[tracing::instrument(skip_all, fields(skip_type = row.skip_type.as_str()))]
    pub async fn insert_skipped(
        &self,
        row: &SkippedRow,
    ) -> Result<(), anyhow::Error> {
        self.with_retries(|| async {
            sqlx::query(
                r#"
                INSERT INTO skipped_mails
                    (id, internet_message_id, account, eml_subject, eml_from, eml_to,
                     skip_type, skip_reason, processing_seconds)
                VALUES
                    ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
            )
            .bind(row.id)
            .bind(&row.internet_message_id)
            .bind(&row.account)
            .bind(truncate_for_storage(&row.eml_subject))
            .bind(truncate_for_storage(&row.eml_from))
            .bind(truncate_for_storage(&row.eml_to))
            .bind(row.skip_type.as_str())
            .bind(truncate_for_storage(&row.skip_reason))
            .bind(row.processing_seconds)
            .execute(&self.pool)
            .await
        })
        .await
        .context("skip row insert failed")
    }

    #[tracing::instrument(skip_all, fields(email_id = %email_id))]
    pub async fn insert_system_log(
        &self,
        email_id: &str,
        document: serde_json::Value,
    ) -> Result<(), anyhow::Error> {
        self.with_retries(|| async {
            sqlx::query(
                "INSERT INTO system_logs (id, email_id, log_json, created_at)
                 VALUES ($1, $2, $3, now())",
            )
            .bind(Uuid::new_v4())
            .bind(email_id)
            .bind(&document)
            .execute(&self.pool)
            .await
        })
        .await
        .context("system log insert failed")
    }

    /// Retry transient database errors; a unique violation means the row
    /// already exists and is surfaced without retrying.
    async fn with_retries<F, Fut>(
        &self,
        write: F,
    ) -> Result<(), sqlx::Error>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<sqlx::postgres::PgQueryResult, sqlx::Error>>,
    {
        let mut last_error = None;
        for attempt in 0..MAX_ATTEMPTS {
            match write().await {
                Ok(_) => return Ok(()),
                Err(e) if is_unique_violation(&e) => return Err(e),
                Err(e) => {
                    tracing::warn!(error.cause_chain = ?e, attempt, "database write failed");
                    last_error = Some(e);
                }
            }
            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(backoff(attempt)).await;
            }
        }
        Err(last_error.unwrap_or(sqlx::Error::PoolClosed))
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

/// The audit table caps long text fields; keep the head and mark the cut.
fn truncate_for_storage(text: &str) -> String {
    const LIMIT: usize = 8000;
    if text.chars().count() <= LIMIT {
        return text.to_string();
    }
    let head: String = text.chars().take(LIMIT).collect();
    format!("{head}... [truncated]")
}
