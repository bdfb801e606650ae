//! Manual-sync smoke-test binary: wires a [`Config`] up to the three
//! storage trees, the durable queue and (unless `no_processor` is set)
//! the background [`SyncProcessor`] against a real local directory and
//! HTTP remote, printing share events as they arrive.
//!
//! Playing the same role as the teacher's `examples/shadow_fs/main.rs`
//! and `examples/in_memory` demo binaries: a thin driver over the real
//! library, not a feature of the library itself.

use std::path::PathBuf;

use clap::Parser;
use rq_share::{Config, RqShare, ShareEvent, SyncProcessor, Tree};
use tracing::info;

#[derive(Parser)]
#[command(about = "Mirror a remote content endpoint through the RQ write-back cache")]
struct Args {
    /// Path to a TOML config file.
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let raw = tokio::fs::read_to_string(&args.config).await?;
    let config = Config::from_toml(&raw)?;
    let no_processor = config.no_processor;

    let share = RqShare::new(config)?;
    let mut events = share.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            log_event(&event);
        }
    });

    let processor = if no_processor {
        info!("no_processor set; background sync disabled, drive the tree manually");
        None
    } else {
        Some(SyncProcessor::spawn(&share))
    };

    let tree = share.tree();
    info!(exists = tree.exists("/").await, "mirror ready at /");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    if let Some(processor) = processor {
        processor.stop().await;
    }
    share.disconnect().await?;
    Ok(())
}

fn log_event(event: &ShareEvent) {
    match event {
        ShareEvent::SyncFileStart { path, method } => info!(%path, %method, "sync start"),
        ShareEvent::SyncFileEnd { path, method } => info!(%path, %method, "sync end"),
        ShareEvent::SyncFileErr { path, reason } => info!(%path, %reason, "sync error"),
        ShareEvent::SyncAbort { path } => info!(%path, "sync aborted"),
        ShareEvent::SyncConflict { file } => info!(file = %file, "sync conflict"),
        ShareEvent::SyncErr { err } => info!(%err, "processor error"),
        ShareEvent::SyncPurged { files } => info!(?files, "entries purged"),
        ShareEvent::ItemUpdated { path } => info!(%path, "queue item updated"),
        ShareEvent::PathUpdated { prefix } => info!(%prefix, "queue subtree updated"),
    }
}
