//! The daily performance report.
//!
//! Aggregates the audit log for one day, correlates it with live mailbox
//! counters from the provider, derives KPIs and alerts, and renders
//! HTML + CSV. Runs as its own binary on an external schedule.

use anyhow::Context as _;
use chrono::NaiveDate;
use chrono::TimeZone;
use chrono::Utc;
use serde::Serialize;
use sqlx::PgPool;
use tera::Context;
use tera::Tera;

use crate::mail_gateway::AccessToken;
use crate::mail_gateway::MailGateway;

/// Also the literal used to keep report mails themselves out of the KPIs
/// when they land back in the consolidation bin.
pub const REPORT_SUBJECT: &str = "Daily Performance Report";

/// More than this many received-but-unprocessed messages is a critical
/// processing gap.
const VARIANCE_CRITICAL: i64 = 5;
const UNREAD_WARNING: i64 = 5;
const UNREAD_CRITICAL: i64 = 10;

const REPORT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="UTF-8"></head>
<body style="font-family: Arial, sans-serif; color: #333;">
<div style="max-width: 720px; margin: 0 auto;">
<h2>Daily Performance Report — {{ date }}</h2>

{% if alerts | length > 0 %}
<h3>Alerts</h3>
<ul>
{% for alert in alerts %}
  <li><strong>{{ alert.severity }}</strong>: {{ alert.message }}</li>
{% endfor %}
</ul>
{% endif %}

<h3>Throughput</h3>
<table border="1" cellpadding="6" cellspacing="0">
  <tr><td>Messages processed</td><td>{{ processed }}</td></tr>
  <tr><td>Fully successful</td><td>{{ fully_successful }} ({{ success_rate | round(precision=1) }}%)</td></tr>
  <tr><td>Acknowledgments sent</td><td>{{ autoresponse_sent }} ({{ autoresponse_rate | round(precision=1) }}%)</td></tr>
  <tr><td>Destination changed by classification</td><td>{{ interventions }}</td></tr>
  <tr><td>Average turnaround (s)</td><td>{{ avg_turnaround_seconds | round(precision=1) }}</td></tr>
</table>

<h3>Mailbox correlation</h3>
<table border="1" cellpadding="6" cellspacing="0">
  <tr><td>Unread in the consolidation bin</td><td>{{ unread_display }}</td></tr>
  <tr><td>Received today</td><td>{{ received_display }}</td></tr>
  <tr><td>Processing variance</td><td>{{ variance_display }}</td></tr>
</table>

<h3>Categories</h3>
<table border="1" cellpadding="6" cellspacing="0">
{% for row in category_counts %}
  <tr><td>{{ row.0 }}</td><td>{{ row.1 }}</td></tr>
{% endfor %}
</table>

<h3>Model usage</h3>
<table border="1" cellpadding="6" cellspacing="0">
  <tr><td>Total cost (USD)</td><td>{{ total_cost_usd | round(precision=5) }}</td></tr>
  <tr><td>Primary model tokens</td><td>{{ primary_tokens }}</td></tr>
  <tr><td>Light model tokens</td><td>{{ light_tokens }}</td></tr>
</table>

<h3>Configured model rates (USD per 1M tokens)</h3>
<table border="1" cellpadding="6" cellspacing="0">
  <tr><th>Model</th><th>Prompt</th><th>Completion</th><th>Cache</th></tr>
{% for row in model_costs %}
  <tr><td>{{ row.0 }}</td><td>{{ row.1 }}</td><td>{{ row.2 }}</td><td>{{ row.3 }}</td></tr>
{% endfor %}
</table>
</div>
</body>
</html>
"#;

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct DailyReport {
    pub date: NaiveDate,
    pub processed: i64,
    pub fully_successful: i64,
    pub success_rate: f64,
    pub autoresponse_sent: i64,
    pub autoresponse_rate: f64,
    pub interventions: i64,
    pub avg_turnaround_seconds: f64,
    pub total_cost_usd: f64,
    pub primary_tokens: i64,
    pub light_tokens: i64,
    pub category_counts: Vec<(String, i64)>,
    pub unread_in_bin: Option<i64>,
    pub received_today: Option<i64>,
    /// received today minus processed; positive means messages were missed.
    pub variance: Option<i64>,
    pub alerts: Vec<Alert>,
    pub model_costs: Vec<(String, f64, f64, f64)>,
}

/// Aggregate the audit log for `date` and correlate with the live mailbox
/// counters of `mail_bin`.
#[tracing::instrument(skip_all, fields(date = %date))]
pub async fn build(
    pool: &PgPool,
    gateway: &MailGateway,
    token: &AccessToken,
    mail_bin: &str,
    date: NaiveDate,
) -> Result<DailyReport, anyhow::Error> {
    let window_start = Utc
        .from_utc_datetime(&date.and_hms_opt(0, 0, 0).context("invalid date")?);
    let window_end = Utc
        .from_utc_datetime(&date.and_hms_opt(23, 59, 59).context("invalid date")?);

    let (
        processed,
        fully_successful,
        autoresponse_sent,
        interventions,
        avg_turnaround_seconds,
        total_cost_usd,
        primary_tokens,
        light_tokens,
    ): (i64, i64, i64, i64, f64, f64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*),
            COUNT(*) FILTER (WHERE classification_status = 'success'
                               AND routing_status = 'success'
                               AND read_status = 'success'),
            COUNT(*) FILTER (WHERE autoresponse_status = 'success'),
            COUNT(*) FILTER (WHERE intervention),
            COALESCE(AVG(turnaround_seconds), 0),
            COALESCE(SUM(cost_usd), 0),
            COALESCE(SUM(primary_prompt_tokens + primary_completion_tokens), 0)::bigint,
            COALESCE(SUM(light_prompt_tokens + light_completion_tokens), 0)::bigint
        FROM logs
        WHERE processed_at BETWEEN $1 AND $2
          AND eml_subject NOT LIKE '%' || $3 || '%'
    "#,
    )
    .bind(window_start)
    .bind(window_end)
    .bind(REPORT_SUBJECT)
    .fetch_one(pool)
    .await
    .context("KPI aggregation failed")?;

    let category_counts: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT category, COUNT(*)
        FROM logs
        WHERE processed_at BETWEEN $1 AND $2
          AND eml_subject NOT LIKE '%' || $3 || '%'
        GROUP BY category
        ORDER BY COUNT(*) DESC
    "#,
    )
    .bind(window_start)
    .bind(window_end)
    .bind(REPORT_SUBJECT)
    .fetch_all(pool)
    .await
    .context("category aggregation failed")?;

    let model_costs: Vec<(String, f64, f64, f64)> = sqlx::query_as(
        "SELECT model, prompt_cost, completion_cost, cache_cost FROM model_costs ORDER BY model",
    )
    .fetch_all(pool)
    .await
    .context("model cost lookup failed")?;

    // live counters are best-effort; the report still goes out without them
    let unread_in_bin = match gateway.count_unread(token, mail_bin).await {
        Ok(count) => Some(count),
        Err(e) => {
            tracing::warn!(error.cause_chain = ?e, "unread counter unavailable");
            None
        }
    };
    let received_today = match gateway
        .count_received_since(token, mail_bin, window_start)
        .await
    {
        Ok(count) => Some(count),
        Err(e) => {
            tracing::warn!(error.cause_chain = ?e, "received counter unavailable");
            None
        }
    };
    let variance = received_today.map(|received| received - processed);

    let mut report = DailyReport {
        date,
        processed,
        fully_successful,
        success_rate: rate(fully_successful, processed),
        autoresponse_sent,
        autoresponse_rate: rate(autoresponse_sent, processed),
        interventions,
        avg_turnaround_seconds,
        total_cost_usd,
        primary_tokens,
        light_tokens,
        category_counts,
        unread_in_bin,
        received_today,
        variance,
        alerts: Vec::new(),
        model_costs,
    };
    report.alerts = derive_alerts(&report);
    Ok(report)
}

fn rate(
    part: i64,
    whole: i64,
) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

fn derive_alerts(report: &DailyReport) -> Vec<Alert> {
    let mut alerts = Vec::new();
    if let Some(variance) = report.variance {
        if variance > VARIANCE_CRITICAL {
            alerts.push(Alert {
                severity: "CRITICAL",
                message: format!(
                    "{variance} messages were received today but not processed"
                ),
            });
        } else if variance > 0 {
            alerts.push(Alert {
                severity: "WARNING",
                message: format!(
                    "{variance} messages were received today but not processed"
                ),
            });
        } else if variance < -VARIANCE_CRITICAL {
            alerts.push(Alert {
                severity: "WARNING",
                message: format!(
                    "{} more messages were processed than received today",
                    -variance
                ),
            });
        }
    }
    if let Some(unread) = report.unread_in_bin {
        if unread > UNREAD_CRITICAL {
            alerts.push(Alert {
                severity: "CRITICAL",
                message: format!("{unread} unread messages are waiting in the consolidation bin"),
            });
        } else if unread > UNREAD_WARNING {
            alerts.push(Alert {
                severity: "WARNING",
                message: format!("{unread} unread messages are waiting in the consolidation bin"),
            });
        }
    }
    alerts
}

pub fn render_html(report: &DailyReport) -> Result<String, anyhow::Error> {
    let mut context = Context::from_serialize(report).context("report serialisation failed")?;
    context.insert("unread_display", &display_count(report.unread_in_bin));
    context.insert("received_display", &display_count(report.received_today));
    context.insert("variance_display", &display_count(report.variance));
    Tera::one_off(REPORT_TEMPLATE, &context, true).context("report template rendering failed")
}

fn display_count(count: Option<i64>) -> String {
    count.map_or_else(|| "unavailable".to_string(), |c| c.to_string())
}

pub fn render_csv(report: &DailyReport) -> String {
    let mut lines = vec![
        format!("Date,{}", report.date),
        format!("Messages processed,{}", report.processed),
        format!("Fully successful,{}", report.fully_successful),
        format!("Success rate,{:.1}%", report.success_rate),
        format!("Acknowledgments sent,{}", report.autoresponse_sent),
        format!("Acknowledgment rate,{:.1}%", report.autoresponse_rate),
        format!("Interventions,{}", report.interventions),
        format!("Average turnaround seconds,{:.1}", report.avg_turnaround_seconds),
        format!("Total cost USD,{:.5}", report.total_cost_usd),
        format!("Primary model tokens,{}", report.primary_tokens),
        format!("Light model tokens,{}", report.light_tokens),
    ];
    if let Some(unread) = report.unread_in_bin {
        lines.push(format!("Unread in bin,{unread}"));
    }
    if let Some(received) = report.received_today {
        lines.push(format!("Received today,{received}"));
    }
    if let Some(variance) = report.variance {
        lines.push(format!("Processing variance,{variance}"));
    }
    for (category, count) in &report.category_counts {
        lines.push(format!("Category: {category},{count}"));
    }
    lines.join("\n")
}

/// Mail the rendered report to each recipient through the gateway.
pub async fn send(
    gateway: &MailGateway,
    token: &AccessToken,
    from_account: &str,
    recipients: &[String],
    report: &DailyReport,
) -> Result<(), anyhow::Error> {
    let html = render_html(report)?;
    let text = render_csv(report);
    let subject = format!("{REPORT_SUBJECT} - {}", report.date);
    for recipient in recipients {
        if !gateway
            .send(token, from_account, recipient, &subject, &html, &text)
            .await
        {
            anyhow::bail!("report delivery to {recipient} failed");
        }
    }
    Ok(())
}
