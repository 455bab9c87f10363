//! The daily report task. Intended to be run once per day by an external
//! scheduler: `mailroom-report [YYYY-MM-DD]` (defaults to today).

use anyhow::Context;
use chrono::NaiveDate;
use chrono::Utc;
use mailroom::configuration::get_configuration;
use mailroom::report;
use mailroom::startup::build_gateway;
use mailroom::startup::get_connection_pool;
use mailroom::telemetry::get_subscriber;
use mailroom::telemetry::init_subscriber;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let subscriber = get_subscriber("mailroom-report", "info", std::io::stdout);
    init_subscriber(subscriber);

    let date = match std::env::args().nth(1) {
        Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .context("expected a date argument in YYYY-MM-DD form")?,
        None => Utc::now().date_naive(),
    };

    let cfg = get_configuration().context("failed to read configuration")?;
    let pool = get_connection_pool(&cfg.database);
    let gateway = build_gateway(&cfg);
    let token = gateway.acquire_token().await?;

    let mail_bin = cfg.mail.consolidation_bin().to_string();
    let report = report::build(&pool, &gateway, &token, &mail_bin, date).await?;

    let html = report::render_html(&report)?;
    let csv = report::render_csv(&report);
    std::fs::write(format!("daily-report-{date}.html"), &html)
        .context("could not write the HTML report")?;
    std::fs::write(format!("daily-report-{date}.csv"), &csv)
        .context("could not write the CSV report")?;

    if cfg.application.report_recipients.is_empty() {
        tracing::info!("no report recipients configured, skipping delivery");
    } else {
        report::send(
            &gateway,
            &token,
            &mail_bin,
            &cfg.application.report_recipients,
            &report,
        )
        .await?;
        tracing::info!(
            recipients = cfg.application.report_recipients.len(),
            "daily report delivered"
        );
    }

    tracing::info!(
        processed = report.processed,
        success_rate = report.success_rate,
        alerts = report.alerts.len(),
        "daily report complete"
    );
    Ok(())
}
