//! Minimal local node: opens the chain, runs the recovery scheduler and
//! mines blocks to the configured payout address until interrupted.
//! API and P2P surfaces attach to the same core from their own crates.

use std::sync::Arc;

use anyhow::{Context, Result};

use onyx_core::blockchain::CancelToken;
use onyx_core::recovery::RecoveryManager;
use onyx_core::{Blockchain, Config, Event};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env();
    let miner_address = std::env::var("ONYX_MINER_ADDRESS")
        .context("ONYX_MINER_ADDRESS must be set to a payout address")?;

    log::info!("opening chain at {}", config.data_dir.display());
    let chain = Arc::new(Blockchain::open(config).map_err(|e| anyhow::anyhow!(e.to_string()))?);
    log::info!(
        "chain ready: height {}, tip {}",
        chain.height(),
        chain.tip_hash()
    );

    let recovery = Arc::new(
        RecoveryManager::new(Arc::clone(&chain)).map_err(|e| anyhow::anyhow!(e.to_string()))?,
    );
    tokio::spawn(Arc::clone(&recovery).run());

    // Event log mirror for operators.
    let mut events = chain.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                Event::BlockAdded { index, hash, .. } => {
                    log::info!("block {} added: {}", index, &hash[..16]);
                }
                Event::ChainReorg { fork_point, .. } => {
                    log::warn!("chain reorg at fork point {fork_point}");
                }
                Event::Alert { name, message, .. } => {
                    log::warn!("alert {name}: {message}");
                }
                _ => {}
            }
        }
    });

    let cancel = CancelToken::new();
    let miner_cancel = cancel.clone();
    let miner_chain = Arc::clone(&chain);
    let miner = tokio::task::spawn_blocking(move || {
        while !miner_cancel.is_cancelled() {
            match miner_chain.mine_next(&miner_address, &miner_cancel) {
                Ok(block) => {
                    log::info!(
                        "mined block {} with {} transactions",
                        block.index(),
                        block.transactions.len()
                    );
                }
                Err(onyx_core::CoreError::Cancelled) => break,
                Err(e) => {
                    log::error!("mining failed: {e}");
                    std::thread::sleep(std::time::Duration::from_secs(5));
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    cancel.cancel();
    let _ = miner.await;

    Ok(())
}
