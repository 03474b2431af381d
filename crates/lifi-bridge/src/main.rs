//! Li-Fi bridge
//!
//! Opens the transmitter's serial link, starts the background reader and
//! serves the local console until EOF or Ctrl-C.
//!
//! Usage: `lifi-bridge [config.json]`. Logging follows `RUST_LOG`.

mod console;

use anyhow::{Context, Result};
use lifi_core::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn load_config() -> Result<BridgeConfig> {
    match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => BridgeConfig::load(&path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(BridgeConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = lifi_core::VERSION,
        build = option_env!("LIFI_BRIDGE_BUILD_ID").unwrap_or("unknown"),
        "starting lifi-bridge"
    );

    let config = load_config()?;
    let sink = Arc::new(BroadcastSink::new(lifi_core::events::DEFAULT_EVENT_CAPACITY));
    let events: Arc<dyn EventSink> = sink.clone();

    let link = Arc::new(LinkManager::new(
        Box::new(SerialOpener),
        config.link.settle(),
    ));
    match link.open(&config.link.candidates, config.link.baud_rate) {
        Ok(path) => tracing::info!(%path, baud = config.link.baud_rate, "serial link open"),
        Err(e) => tracing::warn!(error = %e, "starting without a serial link"),
    }

    let shutdown = CancellationToken::new();
    let reader = spawn_reader(
        link.clone(),
        events.clone(),
        config.reader.clone(),
        shutdown.child_token(),
    )
    .context("spawning serial reader")?;

    let engine = Arc::new(TransferEngine::new(
        link.clone(),
        events.clone(),
        config.transfer.clone(),
    ));
    let dispatcher = Dispatcher::new(BridgeContext {
        link: link.clone(),
        engine: engine.clone(),
        sink: events,
        settings: config.link.clone(),
    });

    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted");
            interrupt.cancel();
        }
    });

    let served = console::run(dispatcher, &sink, shutdown.clone()).await;

    shutdown.cancel();
    engine.cancel();
    reader.shutdown();
    link.close();
    tracing::info!("lifi-bridge stopped");
    served
}
