use std::path::PathBuf;

use anyhow::{Context, bail};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use mailflow::config::PipelineConfig;
use mailflow::pipeline::types::Email;
use mailflow::worker::BatchScheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let Some(input) = std::env::args().nth(1).map(PathBuf::from) else {
        bail!("usage: mailflow <emails.json>");
    };

    let config = PipelineConfig::from_env().context("Invalid configuration")?;

    let raw = std::fs::read_to_string(&input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let emails: Vec<Email> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of emails", input.display()))?;

    let db_path = std::env::var("MAILFLOW_DB_PATH")
        .ok()
        .filter(|path| !path.trim().is_empty())
        .map(PathBuf::from);

    let scheduler = BatchScheduler::open(&config, db_path.as_deref())
        .await
        .context("Failed to start the analysis pipeline")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received, shutting down");
                cancel.cancel();
            }
        });
    }

    let summary = scheduler.run_batch(emails, cancel).await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    scheduler.metrics().log_summary();

    let stats = scheduler.cache().stats();
    info!(
        hits = stats.hits,
        misses = stats.misses,
        coalesced = stats.coalesced,
        evictions = stats.evictions,
        size = stats.size,
        "Cache totals"
    );
    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Console logs go to stderr so stdout carries only the JSON summary. When
/// `MAILFLOW_LOG_DIR` is set, a daily-rolling file log is added.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let mut guard = None;
    let file_layer = std::env::var("MAILFLOW_LOG_DIR")
        .ok()
        .filter(|dir| !dir.trim().is_empty())
        .map(|dir| {
            let appender = tracing_appender::rolling::daily(dir, "mailflow.log");
            let (writer, worker_guard) = tracing_appender::non_blocking(appender);
            guard = Some(worker_guard);
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter())
        });

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(env_filter());

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();
    guard
}
