// src/main.rs
//! `repledger-sync`: keeps a local mirror of the ledger contract up to date.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use repledger::chain::rpc::HttpChainProvider;
use repledger::config::Config;
use repledger::epoch::EpochManager;
use repledger::logging::init_tracing;
use repledger::storage::SledSnapshotStore;
use repledger::sync::ChainStateSynchronizer;

const DEFAULT_CONFIG_PATH: &str = "./config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let mut config = Config::load(&path).with_context(|| format!("failed to load config from {path}"))?;
    config.apply_env_overrides();
    config.validate().context("invalid configuration")?;
    init_tracing(&config.log_level);

    let provider = Arc::new(HttpChainProvider::new(&config.chain).context("failed to build chain provider")?);
    let store = Arc::new(
        SledSnapshotStore::open(&config.storage.path)
            .with_context(|| format!("failed to open store at {}", config.storage.path))?,
    );
    let synchronizer =
        ChainStateSynchronizer::new(provider.clone(), store, config.sync.clone(), config.chain.genesis_block);
    synchronizer.load().await.context("failed to load ledger mirror")?;
    synchronizer.start_daemon();

    let epochs = EpochManager::new(provider);
    if let Err(e) = epochs.load_current_epoch().await {
        warn!(error = %e, "could not read current epoch");
    }
    if let Err(e) = epochs.update_watch().await {
        warn!(error = %e, "could not read epoch timing");
    }
    epochs.start(&synchronizer, config.sync.epoch_tick());
    info!(rpc = %config.chain.rpc_url, ledger = %config.chain.ledger_address, "syncing");

    let mut report = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                let progress = synchronizer.progress();
                let schedule = epochs.schedule();
                info!(
                    block = progress.last_processed_block,
                    tip = progress.latest_block,
                    percent = %format!("{:.1}", progress.percent() * 100.0),
                    epoch = schedule.current_epoch,
                    next_epoch_in = %epochs.countdown_text(chrono::Utc::now()),
                    "sync progress"
                );
            }
        }
    }

    info!("shutting down");
    epochs.stop();
    synchronizer.stop_daemon();
    synchronizer.save().await.context("failed to save ledger mirror")?;
    Ok(())
}
