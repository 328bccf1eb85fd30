use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;

use doc_pipeline::{
    BufferedDocManager, ConsolidationWorker, DurableDocManager, MemoryBuffer, PipelineConfig,
    RocksStore, StoreConfig,
};

/// The daemon owns a private in-process buffer that nothing else can push to,
/// so it only folds updates already logged in the store (the slow path of
/// embedding hosts sharing the data directory). Buffered pushes need a host
/// that links the library and shares one `UpdateBuffer` with its worker.
#[derive(Parser)]
#[command(name = "doc-pipeline")]
#[command(about = "Consolidates CRDT updates logged in the document store into snapshots")]
#[command(long_about = "Consolidates CRDT updates logged in the document store into snapshots.\n\n\
The daemon's update buffer is private to this process, so only updates that \
reached the store's log (buffer fallback pushes) are merged here. Buffered \
pushes are consolidated by hosts that embed the library and share their buffer \
with a ConsolidationWorker.")]
struct Cli {
    /// RocksDB data directory
    #[arg(short, long, default_value = "./data/docs")]
    data_dir: PathBuf,

    /// Milliseconds between consolidation passes
    #[arg(short, long, default_value_t = 1000)]
    interval_ms: u64,

    /// Consolidation lock expiry in seconds
    #[arg(long, default_value_t = 600)]
    lock_ttl_secs: u64,

    /// Disable the consolidation worker
    #[arg(long)]
    no_automation: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let config = PipelineConfig {
        apply_interval_ms: cli.interval_ms,
        lock_ttl_secs: cli.lock_ttl_secs,
        automation: !cli.no_automation,
        ..PipelineConfig::default()
    };

    let store = RocksStore::open(StoreConfig {
        path: cli.data_dir.clone(),
        ..StoreConfig::default()
    })?;
    info!("Opened document store at {}", cli.data_dir.display());

    let durable = Arc::new(DurableDocManager::new(Arc::new(store)));
    // private buffer: only the store-log safety net does work here
    let manager = Arc::new(BufferedDocManager::new(
        durable,
        Arc::new(MemoryBuffer::new()),
        config.clone(),
    ));

    if !config.automation {
        info!("Automation disabled, running a single consolidation pass");
        let report = manager.apply().await;
        report.safety_net?;
        return Ok(());
    }

    let handle = ConsolidationWorker::new(manager.clone()).spawn();
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    let passes = handle.shutdown().await;
    let stats = manager.stats().snapshot();
    info!(
        "Ran {passes} passes: {} consolidations, {} merged updates, {} failures",
        stats.consolidations, stats.merged_updates, stats.consolidation_failures
    );
    Ok(())
}
