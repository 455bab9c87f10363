//! The polling loop: fetch unread messages, hand them to the engine in
//! bounded groups, sweep the read-retry set, sleep to the tick.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::domain::Message;
use crate::engine::TriageEngine;
use crate::mail_gateway::MailGateway;

/// Sweep the read-retry set every N loops.
const READ_RETRY_EVERY: u32 = 5;

/// Pause between groups; keeps us under the provider's rate limits.
const GROUP_PAUSE: Duration = Duration::from_secs(1);

/// Run until the shutdown flag flips. A new token is acquired per batch;
/// the interval is measured from batch start, and an overrunning batch is
/// followed immediately by the next one.
#[tracing::instrument(skip_all)]
pub async fn run(
    engine: Arc<TriageEngine>,
    gateway: Arc<MailGateway>,
    accounts: Vec<String>,
    interval: Duration,
    group_size: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), anyhow::Error> {
    // mutated from this loop only; message tasks report back via their
    // outcome values
    let mut read_retries: HashSet<(String, String)> = HashSet::new();
    let mut loop_count = 0u32;

    tracing::info!("triage batch loop starting");
    while !*shutdown.borrow() {
        let batch_started = tokio::time::Instant::now();

        run_batch(
            &engine,
            &gateway,
            &accounts,
            group_size,
            &mut read_retries,
            &shutdown,
        )
        .await;

        loop_count += 1;
        if loop_count >= READ_RETRY_EVERY {
            sweep_read_retries(&gateway, &mut read_retries).await;
            loop_count = 0;
        }

        if *shutdown.borrow() {
            break;
        }
        let elapsed = batch_started.elapsed();
        if elapsed < interval {
            let remaining = interval - elapsed;
            tracing::info!(
                batch_secs = elapsed.as_secs_f64(),
                sleep_secs = remaining.as_secs_f64(),
                "batch complete, sleeping to the next tick"
            );
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = shutdown.changed() => {}
            }
        } else {
            tracing::info!(
                batch_secs = elapsed.as_secs_f64(),
                "batch overran the interval, starting the next immediately"
            );
        }
    }
    tracing::info!("triage batch loop stopped");
    Ok(())
}

async fn run_batch(
    engine: &Arc<TriageEngine>,
    gateway: &Arc<MailGateway>,
    accounts: &[String],
    group_size: usize,
    read_retries: &mut HashSet<(String, String)>,
    shutdown: &watch::Receiver<bool>,
) {
    let token = match gateway.acquire_token().await {
        Ok(token) => token,
        Err(e) => {
            tracing::error!(
                error.cause_chain = ?e,
                error.message = %e,
                "token acquisition failed, skipping this batch"
            );
            return;
        }
    };

    for account in accounts {
        let messages = match gateway.fetch_unread(&token, account).await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::error!(
                    error.cause_chain = ?e,
                    error.message = %e,
                    account = %account,
                    "unread fetch failed, skipping account"
                );
                continue;
            }
        };
        if messages.is_empty() {
            tracing::info!(account = %account, "no unread messages");
            continue;
        }
        tracing::info!(account = %account, count = messages.len(), "processing unread messages");

        let mut queue = messages.into_iter();
        loop {
            // no new messages after the shutdown signal; the in-flight
            // group runs to completion below
            if *shutdown.borrow() {
                return;
            }
            let group: Vec<Message> = queue.by_ref().take(group_size).collect();
            if group.is_empty() {
                break;
            }

            let mut tasks = JoinSet::new();
            for message in group {
                let engine = Arc::clone(engine);
                let token = token.clone();
                let account = account.clone();
                tasks.spawn(async move { engine.process(&token, &account, message).await });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(outcome) => {
                        if let Some(pair) = outcome.read_retry {
                            read_retries.insert(pair);
                        }
                    }
                    Err(e) => {
                        tracing::error!(
                            error.cause_chain = ?e,
                            error.message = %e,
                            "message task aborted"
                        );
                    }
                }
            }
            tokio::time::sleep(GROUP_PAUSE).await;
        }
    }
}

/// Messages whose forward succeeded but whose mark-read did not. Entries
/// stay in the set until a retry confirms the PATCH.
async fn sweep_read_retries(
    gateway: &Arc<MailGateway>,
    read_retries: &mut HashSet<(String, String)>,
) {
    if read_retries.is_empty() {
        return;
    }
    let token = match gateway.acquire_token().await {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!(
                error.cause_chain = ?e,
                "token acquisition failed, keeping the read-retry set for the next sweep"
            );
            return;
        }
    };
    tracing::info!(count = read_retries.len(), "sweeping the read-retry set");
    let entries: Vec<(String, String)> = read_retries.iter().cloned().collect();
    let mut cleared = 0;
    for (account, provider_id) in entries {
        if gateway.mark_read(&token, &account, &provider_id).await {
            read_retries.remove(&(account, provider_id));
            cleared += 1;
        }
    }
    if cleared > 0 {
        tracing::info!(cleared, remaining = read_retries.len(), "read-retry sweep done");
    }
}
