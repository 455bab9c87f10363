use std::fmt::Debug;
use std::fmt::Display;

use mailroom::configuration::get_configuration;
use mailroom::startup::Application;
use mailroom::telemetry::get_subscriber;
use mailroom::telemetry::init_subscriber;
use tokio::sync::watch;
use tokio::task::JoinError;

fn report_exit(
    name: &str,
    outcome: Result<Result<(), impl Debug + Display>, JoinError>,
) {
    match outcome {
        Ok(Ok(())) => {
            tracing::info!("{name} exited gracefully")
        }
        Ok(Err(e)) => {
            tracing::error!(
                error.cause_chain = ?e,
                error.message = %e,
                "{name} failed"
            )
        }
        Err(e) => {
            tracing::error!(
                error.cause_chain = ?e,
                error.message = %e,
                "{name} task aborted"
            )
        }
    }
}

/// Initialise telemetry, load configuration, run the batch loop until a
/// shutdown signal arrives. In-flight messages drain before exit.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let subscriber = get_subscriber("mailroom", "info", std::io::stdout);
    init_subscriber(subscriber);

    if std::env::args().nth(1).as_deref() != Some("start") {
        println!("To start the triage service, run with the 'start' argument");
        println!("Run command: mailroom start");
        return Ok(());
    }

    let cfg = get_configuration().expect("failed to read configuration");
    let app = Application::build(cfg);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker = tokio::spawn(app.run_until_stopped(shutdown_rx));

    tokio::select! {
        o = &mut worker => report_exit("Triage batch loop", o),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received, draining in-flight messages");
            let _ = shutdown_tx.send(true);
            report_exit("Triage batch loop", worker.await);
        }
    }

    Ok(())
}
