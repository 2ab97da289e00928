use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::blockchain::block::{Block, BlockHeader};
use crate::blockchain::consensus;
use crate::config::Config;
use crate::errors::{CoreError, CoreResult};
use crate::mempool::Mempool;
use crate::tx::Transaction;
use crate::utxo::UtxoManager;

/// Nonces tried between cancellation checks. Bounds how long a cancelled
/// search keeps running.
pub const CANCEL_CHECK_INTERVAL: u64 = 4_096;

/// Cooperative cancellation flag shared with the proof-of-work loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Assemble and mine the next block on top of `tip`.
///
/// Transactions come from the mempool in fee-rate order and are dry-run
/// against a scratch UTXO copy so the produced block always validates.
/// The coinbase collects `block_reward` plus every included fee. The
/// search yields between batches and honors `cancel` within
/// [`CANCEL_CHECK_INTERVAL`] iterations.
#[allow(clippy::too_many_arguments)]
pub fn produce_block(
    miner_address: &str,
    mempool: &Mempool,
    utxo: &UtxoManager,
    recent: &[Block],
    difficulty: u32,
    config: &Config,
    cancel: &CancelToken,
    now: u64,
) -> CoreResult<Block> {
    let tip = recent
        .last()
        .ok_or_else(|| CoreError::InvalidBlock("cannot produce on an empty chain".into()))?;

    // Leave room for the coinbase line.
    let budget = config.max_block_bytes.saturating_sub(512);
    let candidates = mempool.select_for_block(budget);

    // Dry-run the selection in order; anything that no longer applies
    // cleanly, or whose timestamp falls outside the window relative to
    // the block being built, is left out rather than invalidating the
    // whole block.
    let timestamp = now.max(consensus::median_time_past(recent) + 1);
    let mut trial = UtxoManager::from_map(utxo.as_map().clone());
    let mut selected: Vec<Transaction> = Vec::new();
    for tx in candidates {
        if crate::blockchain::validation::validate_transaction_stateless(&tx, timestamp).is_ok()
            && trial.apply_transaction(&tx, timestamp).is_ok()
        {
            selected.push(tx);
        }
    }

    if selected.is_empty() && !config.allow_empty_blocks {
        return Err(CoreError::EmptyMempoolNotAllowed);
    }

    let fees: u64 = selected.iter().map(|tx| tx.fee).sum();
    let reward = config.block_reward.saturating_add(fees);
    let height = tip.index() + 1;
    let coinbase = Transaction::coinbase(miner_address, reward, height, timestamp);

    let mut transactions = Vec::with_capacity(selected.len() + 1);
    transactions.push(coinbase);
    transactions.extend(selected);

    let mut header = BlockHeader {
        version: 1,
        index: height,
        previous_hash: tip.hash(),
        merkle_root: Block::merkle_root(&transactions),
        timestamp,
        difficulty,
        nonce: 0,
        miner_pubkey: String::new(),
        signature: None,
    };

    mine_header(&mut header, cancel)?;

    Ok(Block::new(header, transactions, miner_address.to_string()))
}

/// Increment the nonce until the header hash satisfies the difficulty.
/// Checks the cancel token and yields every [`CANCEL_CHECK_INTERVAL`]
/// attempts so a co-scheduled task is never starved.
pub fn mine_header(header: &mut BlockHeader, cancel: &CancelToken) -> CoreResult<()> {
    let mut nonce: u64 = 0;
    loop {
        if nonce % CANCEL_CHECK_INTERVAL == 0 {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            if nonce > 0 {
                std::thread::yield_now();
            }
        }
        header.nonce = nonce;
        if header.meets_difficulty() {
            return Ok(());
        }
        nonce = nonce.checked_add(1).ok_or_else(|| {
            CoreError::ProofOfWorkFailed("nonce space exhausted".into())
        })?;
    }
}
