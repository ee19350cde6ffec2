mod broker;
mod config;
mod pipeline;
mod queue;
mod reading;
mod sink;
mod store;
#[cfg(test)]
mod test_support;

use crate::broker::BrokerAdapter;
use crate::config::Config;
use crate::pipeline::Pipeline;
use crate::store::PgReadingStore;
use anyhow::{Context, Result};
use std::process::ExitCode;

fn init_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sensor_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

/// The only signal handler in the process. Resolves on the first SIGINT.
async fn interrupt() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for interrupt; running until a task fails");
        futures::future::pending::<()>().await;
    }
}

async fn start() -> Result<Pipeline<BrokerAdapter, PgReadingStore>> {
    let config = Config::from_env()?;
    let store = PgReadingStore::connect(&config.connect_options()?)
        .await
        .context("failed to open store connection")?;
    let source = BrokerAdapter::new(&config);
    let broker = format!("{}:{}", config.mqtt_host, config.mqtt_port);
    tracing::info!(
        broker = %broker,
        topic = %config.topic_filter(),
        malformed = ?config.malformed_policy,
        "sensor ingest starting"
    );
    Ok(Pipeline::new(source, store, config.malformed_policy))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    if let Err(err) = init_tracing() {
        eprintln!("failed to initialise logging: {err:#}");
        return ExitCode::FAILURE;
    }

    let pipeline = match start().await {
        Ok(pipeline) => pipeline,
        Err(err) => {
            tracing::error!("startup failed: {err:#}");
            eprintln!("startup failed: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match pipeline.run(interrupt()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(tasks = ?err.tasks(), "{err}");
            for (task, cause) in &err.failures {
                eprintln!("{task} failed: {cause:#}");
            }
            ExitCode::FAILURE
        }
    }
}
