//! egress-mapper daemon entry point.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use egress_mapper::clock::SystemClock;
use egress_mapper::config::Config;
use egress_mapper::dispatcher::run_periodic_upload;
use egress_mapper::holder::IntentsHolder;
use egress_mapper::source::{ingest, JsonLinesSource, TrafficSource};
use egress_mapper::upload::LogUploader;

/// How long shutdown waits for blocking work, such as a pending stdin read.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    run_until_shutdown(run())
}

/// Drives `daemon` to completion, then stops the runtime without waiting
/// past [`SHUTDOWN_GRACE`] for blocking threads that cannot be cancelled.
fn run_until_shutdown<F>(daemon: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(daemon);
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

async fn run() -> anyhow::Result<()> {
    // Load configuration
    let cfg = Config::load()?;
    info!("Starting egress-mapper with config: {:?}", cfg);

    // Shared state
    let holder = Arc::new(IntentsHolder::new(Arc::new(cfg.excluded())));

    // Callbacks are registered before the upload loop starts
    if cfg.log_batches {
        holder.register_notify_intents(LogUploader::new());
    }

    let cancel = CancellationToken::new();

    // Intent channel
    let (intent_tx, intent_rx) = mpsc::channel(1024);

    // Observation source (stdin)
    let source = JsonLinesSource::new(tokio::io::stdin(), Arc::new(SystemClock));
    let source_handle = tokio::spawn(async move {
        if let Err(e) = source.capture(intent_tx).await {
            error!("Observation source failed: {}", e);
        }
    });

    let ingest_handle = tokio::spawn(ingest(Arc::clone(&holder), intent_rx));

    // Periodic upload
    let upload_handle = tokio::spawn(run_periodic_upload(
        Arc::clone(&holder),
        cancel.clone(),
        cfg.upload_interval(),
    ));

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    cancel.cancel();
    source_handle.abort();
    ingest_handle.abort();
    if let Err(e) = upload_handle.await {
        error!("Upload loop failed: {}", e);
    }

    info!("Shutdown complete.");
    Ok(())
}
