use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use num_bigint::BigUint;
use parking_lot::RwLock;
use serde::Serialize;

use crate::blockchain::block::Block;
use crate::blockchain::consensus;
use crate::blockchain::contracts::{ContractRegistry, ContractState};
use crate::blockchain::producer::{self, CancelToken};
use crate::blockchain::validation::{self, BlockContext};
use crate::config::Config;
use crate::errors::{CoreError, CoreResult};
use crate::events::{Event, EventBus};
use crate::mempool::Mempool;
use crate::metrics::{AlertEngine, CoreMetrics};
use crate::storage::{BlockStore, PersistedState};
use crate::tx::{Transaction, TxType};
use crate::utxo::{UtxoManager, UtxoSnapshot};

/// Orphans are dropped if their parent has not shown up within this window.
pub const ORPHAN_EXPIRY_SECS: u64 = 600;

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Outcome of `receive_block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDisposition {
    Appended,
    Orphaned,
    Reorged,
}

/// Lookup key for `get_block`.
#[derive(Debug, Clone)]
pub enum BlockRef {
    Height(u64),
    Hash(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainStats {
    pub height: u64,
    pub tip_hash: String,
    pub difficulty: u32,
    pub total_work: String,
    pub block_count: usize,
    pub pending_transactions: usize,
    pub mempool_bytes: usize,
    pub orphan_count: usize,
    pub circulating_supply: u128,
}

/// Everything guarded by the chain writer lock. Readers clone what they
/// need under a read lock; writers are serialized.
struct ChainState {
    chain: Vec<Block>,
    utxo: UtxoManager,
    contracts: ContractRegistry,
    /// Difficulty required of the next block.
    difficulty: u32,
    /// Confirmed txids across the whole chain (invariant: unique).
    txids: HashSet<String>,
    /// Side-chain blocks by hash, candidates for a future reorg.
    side_blocks: HashMap<String, Block>,
    /// Blocks whose parent is unknown, keyed by the missing parent hash.
    orphans: HashMap<String, Vec<Block>>,
    /// Arrival time per orphan hash, for expiry.
    orphan_seen: HashMap<String, u64>,
    /// Candidate blocks that failed reorg application; never retried.
    invalid_blocks: HashSet<String>,
}

/// The ledger core: owns the chain and mempool, coordinates storage, UTXO
/// accounting, validation and events. One instance per node.
pub struct Blockchain {
    config: Config,
    store: BlockStore,
    mempool: Mempool,
    metrics: Arc<CoreMetrics>,
    events: EventBus,
    alerts: AlertEngine,
    state: RwLock<ChainState>,
    /// Set when corruption recovery failed. A halted core refuses every
    /// mutating operation until an operator intervenes.
    halted: std::sync::atomic::AtomicBool,
}

impl Blockchain {
    /// Open or create the chain at `config.data_dir`. Recovers incomplete
    /// storage transactions, rebuilds the index if needed, replays the
    /// chain into memory and restores the persisted mempool.
    pub fn open(config: Config) -> CoreResult<Self> {
        let store = BlockStore::open(&config)?;

        if !store.verify_integrity()? {
            log::warn!("stored checksums do not match disk state; chain replay will re-derive");
        }

        let mut chain = store.load_chain()?;
        if chain.is_empty() {
            let genesis = Block::genesis(config.genesis_timestamp, config.initial_difficulty);
            log::info!("created genesis block {}", genesis.hash());
            store.append(&genesis)?;
            chain.push(genesis);
        }

        // The chain itself is authoritative: UTXO set, contract registry
        // and txid index are replayed rather than trusted from state files.
        let mut utxo = UtxoManager::new();
        let mut contracts = ContractRegistry::new();
        let mut txids = HashSet::new();
        for block in &chain {
            for tx in &block.transactions {
                utxo.apply_transaction(tx, block.header.timestamp)?;
                if tx.tx_type == TxType::ContractDeploy {
                    contracts.apply_deploy(tx, block.header.timestamp)?;
                }
                txids.insert(tx.txid.clone());
            }
        }

        let difficulty = Self::replay_difficulty(&chain, &config);

        let metrics = Arc::new(CoreMetrics::new());
        metrics
            .chain_height
            .store(chain.last().map(|b| b.index()).unwrap_or(0), std::sync::atomic::Ordering::Relaxed);
        metrics
            .difficulty
            .store(difficulty as u64, std::sync::atomic::Ordering::Relaxed);

        let mempool = Mempool::new(&config);
        let persisted = store.load_state()?;

        let blockchain = Self {
            alerts: AlertEngine::new(&config),
            config,
            store,
            mempool,
            metrics,
            events: EventBus::default(),
            state: RwLock::new(ChainState {
                chain,
                utxo,
                contracts,
                difficulty,
                txids,
                side_blocks: HashMap::new(),
                orphans: HashMap::new(),
                orphan_seen: HashMap::new(),
                invalid_blocks: HashSet::new(),
            }),
            halted: std::sync::atomic::AtomicBool::new(false),
        };

        // Re-admit persisted pending transactions under current rules;
        // stale entries are dropped silently on restart.
        for tx in persisted.pending {
            let _ = blockchain.submit_transaction(tx);
        }

        Ok(blockchain)
    }

    /// Difficulty of the next block, derived by replaying retargets over
    /// the chain. Mirrors what the running node computed incrementally.
    fn replay_difficulty(chain: &[Block], config: &Config) -> u32 {
        let mut difficulty = config.initial_difficulty;
        for end in 1..=chain.len() {
            difficulty = consensus::next_difficulty(
                &chain[..end],
                difficulty,
                config.difficulty_retarget_interval,
                config.target_block_time_seconds,
            );
        }
        difficulty
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> Arc<CoreMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    /// Refuse all writes until operator intervention. Set by the recovery
    /// manager when no backup could repair a corrupted chain.
    pub fn halt(&self) {
        self.halted.store(true, std::sync::atomic::Ordering::SeqCst);
        log::error!("core is now CRITICAL: writes are refused until operator intervention");
    }

    pub fn resume(&self) {
        self.halted.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn check_writable(&self) -> CoreResult<()> {
        if self.is_halted() {
            return Err(CoreError::CorruptedChain(vec![
                "core is in CRITICAL state; writes refused".to_string(),
            ]));
        }
        Ok(())
    }

    // -- Transaction intake --

    /// Validate and stage a transaction for mining. Rejections are
    /// recorded by reason and surfaced on the event bus.
    pub fn submit_transaction(&self, tx: Transaction) -> CoreResult<()> {
        self.check_writable()?;
        let now = unix_now();
        let txid = tx.txid.clone();

        let result = self.try_admit(tx, now);
        match &result {
            Ok(fee_rate) => {
                self.events.emit(Event::TxAdmitted {
                    txid: txid.clone(),
                    fee_rate: *fee_rate,
                });
                self.refresh_mempool_gauges(now);
            }
            Err(e) => {
                let reason = e.kind().as_str().to_string();
                if matches!(e, CoreError::SenderBanned(_)) {
                    self.metrics.record_security_event("warning");
                }
                self.metrics.record_rejection(&reason);
                self.events.emit(Event::TxRejected {
                    reason,
                    txid: Some(txid),
                });
            }
        }
        result.map(|_| ())
    }

    fn try_admit(&self, tx: Transaction, now: u64) -> CoreResult<u64> {
        self.mempool.check_banned(&tx.sender, now)?;

        let started = Instant::now();
        let validated: CoreResult<()> = (|| {
            validation::validate_transaction_stateless(&tx, now)?;
            let state = self.state.read();
            validation::validate_transaction_inputs(&tx, &state.utxo, now)
        })();
        self.metrics
            .tx_validation_us
            .observe(started.elapsed().as_micros() as u64);

        if let Err(e) = validated {
            self.mempool.raise_ban_score(&tx.sender, now);
            return Err(e);
        }

        let fee_rate = tx.fee_rate();
        self.mempool.admit(tx, now)?;
        Ok(fee_rate)
    }

    fn refresh_mempool_gauges(&self, now: u64) {
        use std::sync::atomic::Ordering;
        let stats = self.mempool.stats(now);
        self.metrics
            .pending_transactions
            .store(stats.count as u64, Ordering::Relaxed);
        self.metrics
            .mempool_bytes
            .store(stats.bytes as u64, Ordering::Relaxed);
        self.metrics
            .active_sender_bans
            .store(stats.active_bans as u64, Ordering::Relaxed);
    }

    // -- Production --

    /// Produce and append the next block. The proof-of-work search runs
    /// without any chain lock; only the final append takes the writer.
    pub fn mine_next(&self, miner_address: &str, cancel: &CancelToken) -> CoreResult<Block> {
        self.check_writable()?;
        let now = unix_now();
        let (recent, difficulty, utxo_copy) = {
            let state = self.state.read();
            let start = state.chain.len().saturating_sub(consensus::MEDIAN_TIME_SPAN);
            (
                state.chain[start..].to_vec(),
                state.difficulty,
                UtxoManager::from_map(state.utxo.as_map().clone()),
            )
        };

        let started = Instant::now();
        let block = producer::produce_block(
            miner_address,
            &self.mempool,
            &utxo_copy,
            &recent,
            difficulty,
            &self.config,
            cancel,
            now,
        )?;
        self.metrics
            .mining_duration_ms
            .observe(started.elapsed().as_millis() as u64);

        self.append_block(block.clone())?;
        self.metrics
            .blocks_mined
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(block)
    }

    // -- Block intake --

    /// Append a block that extends the current tip.
    pub fn append_block(&self, block: Block) -> CoreResult<()> {
        self.check_writable()?;
        let mut state = self.state.write();
        self.append_locked(&mut state, block, true)?;
        self.connect_orphans_locked(&mut state);
        Ok(())
    }

    /// Entry point for externally produced blocks: extend, park, or reorg.
    pub fn receive_block(&self, block: Block) -> CoreResult<BlockDisposition> {
        self.check_writable()?;
        let now = unix_now();
        let hash = block.hash();
        let mut state = self.state.write();

        if state.invalid_blocks.contains(&hash) {
            return Err(CoreError::InvalidBlock(format!(
                "block {hash} previously failed validation"
            )));
        }
        // Idempotent on re-delivery.
        if state
            .chain
            .get(block.index() as usize)
            .map(|b| b.hash() == hash)
            .unwrap_or(false)
            || state.side_blocks.contains_key(&hash)
        {
            return Ok(BlockDisposition::Appended);
        }

        let tip_hash = state.chain.last().map(|b| b.hash()).unwrap_or_default();
        let block_ts = block.header.timestamp;
        let disposition = if block.header.previous_hash == tip_hash {
            self.append_locked(&mut state, block, true)?;
            self.metrics
                .blocks_propagated
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            // Arrival lag relative to the producer's clock is the only
            // propagation signal available without transport timestamps.
            self.metrics
                .block_propagation_ms
                .observe(now.saturating_sub(block_ts).saturating_mul(1_000));
            BlockDisposition::Appended
        } else {
            self.handle_possible_fork(&mut state, block, now)?
        };

        self.connect_orphans_locked(&mut state);
        Ok(disposition)
    }

    /// Validate and apply one block on the tip. Caller holds the writer.
    /// With `announce` false (reorg application) nothing is emitted or
    /// persisted; the reorg announces and persists once at the end.
    fn append_locked(&self, state: &mut ChainState, block: Block, announce: bool) -> CoreResult<()> {
        let now = unix_now();
        let prev = state
            .chain
            .last()
            .ok_or_else(|| CoreError::InvalidBlock("empty chain".into()))?;

        if block.header.previous_hash != prev.hash() {
            return Err(CoreError::UnknownParent(block.header.previous_hash.clone()));
        }

        let start = state.chain.len().saturating_sub(consensus::MEDIAN_TIME_SPAN);
        let txids = &state.txids;
        let ctx = BlockContext {
            prev,
            recent: &state.chain[start..],
            expected_difficulty: state.difficulty,
            current_supply: state.utxo.total_circulating_supply(),
            known_txid: &|id| txids.contains(id),
        };
        let drift = validation::validate_block(&block, &ctx, &state.utxo, &self.config, now)?;
        self.metrics.timestamp_drift_secs.observe(drift);

        // The trial apply inside validate_block guarantees these succeed.
        for tx in &block.transactions {
            state.utxo.apply_transaction(tx, block.header.timestamp)?;
            if tx.tx_type == TxType::ContractDeploy {
                state.contracts.apply_deploy(tx, block.header.timestamp)?;
            }
        }

        if let Err(e) = self.store.append(&block) {
            // Undo the in-memory effects so state and disk stay aligned.
            for tx in block.transactions.iter().rev() {
                let _ = state.utxo.revert_transaction(tx);
                if tx.tx_type == TxType::ContractDeploy {
                    state.contracts.revert_deploy(tx);
                }
            }
            self.metrics
                .errors_encountered
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Err(e);
        }

        for tx in &block.transactions {
            state.txids.insert(tx.txid.clone());
        }
        state.chain.push(block);

        state.difficulty = consensus::next_difficulty(
            &state.chain,
            state.difficulty,
            self.config.difficulty_retarget_interval,
            self.config.target_block_time_seconds,
        );

        let tip = state.chain.last().expect("just pushed");
        let reward = tip
            .transactions
            .first()
            .map(|cb| cb.outputs.first().map(|o| o.amount).unwrap_or(0))
            .unwrap_or(0);

        // Mempool maintenance: drop what was confirmed, then re-check
        // dependents against the new UTXO set.
        self.mempool.remove_confirmed(&tip.transactions);
        let utxo = &state.utxo;
        let ts = tip.header.timestamp;
        self.mempool.drop_invalidated(|tx| {
            validation::validate_transaction_inputs(tx, utxo, ts).is_ok()
        });

        self.metrics
            .transactions_processed
            .fetch_add(tip.transactions.len() as u64, std::sync::atomic::Ordering::Relaxed);

        if announce {
            self.persist_state_locked(state);
            self.update_chain_gauges(state, now);
            self.events.emit(Event::BlockAdded {
                index: tip.index(),
                hash: tip.hash(),
                miner: tip.miner.clone(),
                reward,
                tx_count: tip.transactions.len(),
            });
        }

        Ok(())
    }

    fn update_chain_gauges(&self, state: &ChainState, now: u64) {
        use std::sync::atomic::Ordering;
        let tip = state.chain.last().expect("chain never empty");
        self.metrics.chain_height.store(tip.index(), Ordering::Relaxed);
        self.metrics
            .difficulty
            .store(state.difficulty as u64, Ordering::Relaxed);
        self.metrics
            .last_block_time
            .store(tip.header.timestamp, Ordering::Relaxed);
        self.refresh_mempool_gauges(now);
    }

    fn persist_state_locked(&self, state: &ChainState) {
        let persisted = PersistedState {
            utxo_set: state.utxo.as_map().clone(),
            pending: self.mempool.pending_transactions(),
            contracts: state.contracts.contracts().clone(),
            receipts: state.contracts.receipts().to_vec(),
        };
        if let Err(e) = self.store.save_state(&persisted) {
            self.metrics
                .errors_encountered
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            log::error!("failed to persist chain state: {e}");
        }
    }

    // -- Fork handling --

    fn handle_possible_fork(
        &self,
        state: &mut ChainState,
        block: Block,
        now: u64,
    ) -> CoreResult<BlockDisposition> {
        let parent_hash = block.header.previous_hash.clone();
        let parent_known = state.side_blocks.contains_key(&parent_hash)
            || state.chain.iter().any(|b| b.hash() == parent_hash);

        if !parent_known {
            let hash = block.hash();
            log::info!(
                "parking orphan {} (missing parent {})",
                &hash[..16],
                &parent_hash[..16.min(parent_hash.len())]
            );
            state.orphan_seen.insert(hash, now);
            state.orphans.entry(parent_hash.clone()).or_default().push(block);
            self.events.emit(Event::NeedBlock { hash: parent_hash });
            return Ok(BlockDisposition::Orphaned);
        }

        let hash = block.hash();
        state.side_blocks.insert(hash.clone(), block.clone());

        // Walk the side chain back to the main chain to find the fork
        // point and collect the candidate suffix in height order.
        let mut candidate = vec![block];
        let fork_point = loop {
            let first = &candidate[0];
            let parent = first.header.previous_hash.clone();
            if let Some(pos) = state.chain.iter().position(|b| b.hash() == parent) {
                break pos as u64;
            }
            match state.side_blocks.get(&parent) {
                Some(side_parent) => candidate.insert(0, side_parent.clone()),
                None => {
                    // Gap in the side chain: wait for more blocks.
                    return Ok(BlockDisposition::Orphaned);
                }
            }
        };

        let main_suffix_work = consensus::cumulative_work(&state.chain[(fork_point as usize + 1)..]);
        let candidate_work = consensus::cumulative_work(&candidate);

        if candidate_work > main_suffix_work {
            self.reorg_locked(state, fork_point, candidate)?;
            Ok(BlockDisposition::Reorged)
        } else {
            log::info!(
                "side block {} parked: candidate work {} does not exceed main {}",
                &hash[..16],
                candidate_work,
                main_suffix_work
            );
            Ok(BlockDisposition::Orphaned)
        }
    }

    /// Replace the chain suffix above `fork_point` with `candidate`.
    /// On any application failure the original suffix is restored and the
    /// candidate tip is marked invalid; no partial state escapes the lock.
    fn reorg_locked(
        &self,
        state: &mut ChainState,
        fork_point: u64,
        candidate: Vec<Block>,
    ) -> CoreResult<()> {
        let old_tip_hash = state.chain.last().expect("chain never empty").hash();
        let rollback_log: Vec<Block> = state.chain[(fork_point as usize + 1)..].to_vec();

        log::info!(
            "reorg: fork point {}, rolling back {} blocks, applying {}",
            fork_point,
            rollback_log.len(),
            candidate.len()
        );

        // Revert the old suffix tip-first, transactions in reverse order.
        let mut displaced: Vec<Transaction> = Vec::new();
        for block in rollback_log.iter().rev() {
            for tx in block.transactions.iter().rev() {
                state.utxo.revert_transaction(tx)?;
                if tx.tx_type == TxType::ContractDeploy {
                    state.contracts.revert_deploy(tx);
                }
                state.txids.remove(&tx.txid);
                if !tx.is_coinbase() {
                    displaced.push(tx.clone());
                }
            }
        }
        state.chain.truncate(fork_point as usize + 1);
        state.difficulty = Self::replay_difficulty(&state.chain, &self.config);

        if let Some(index) = self.store.index() {
            index.remove_from(fork_point + 1)?;
        }

        // Apply the candidate suffix through the normal append path,
        // quietly: observers must see chain_reorg before the new tip.
        let mut applied = 0usize;
        let mut failure: Option<CoreError> = None;
        for block in &candidate {
            match self.append_locked(state, block.clone(), false) {
                Ok(()) => applied += 1,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            log::error!("reorg failed after {applied} blocks, restoring original chain: {e}");

            // Undo whatever part of the candidate landed.
            for block in candidate[..applied].iter().rev() {
                for tx in block.transactions.iter().rev() {
                    state.utxo.revert_transaction(tx)?;
                    if tx.tx_type == TxType::ContractDeploy {
                        state.contracts.revert_deploy(tx);
                    }
                    state.txids.remove(&tx.txid);
                }
            }
            state.chain.truncate(fork_point as usize + 1);
            state.difficulty = Self::replay_difficulty(&state.chain, &self.config);
            if let Some(index) = self.store.index() {
                index.remove_from(fork_point + 1)?;
            }

            // Replay the original suffix; it validated before, so this
            // cannot fail short of storage errors.
            for block in &rollback_log {
                for tx in &block.transactions {
                    state.utxo.apply_transaction(tx, block.header.timestamp)?;
                    if tx.tx_type == TxType::ContractDeploy {
                        state.contracts.apply_deploy(tx, block.header.timestamp)?;
                    }
                    state.txids.insert(tx.txid.clone());
                }
                self.store.append(block)?;
                state.chain.push(block.clone());
            }
            state.difficulty = Self::replay_difficulty(&state.chain, &self.config);

            for block in &candidate {
                let h = block.hash();
                state.side_blocks.remove(&h);
                state.invalid_blocks.insert(h);
            }
            return Err(CoreError::InvalidBlock(format!(
                "reorg candidate rejected: {e}"
            )));
        }

        for block in &candidate {
            state.side_blocks.remove(&block.hash());
        }

        // Transactions unique to the old branch go back through admission
        // against the new UTXO state.
        let now = unix_now();
        for tx in displaced {
            if state.txids.contains(&tx.txid) {
                continue;
            }
            if validation::validate_transaction_stateless(&tx, now).is_ok()
                && validation::validate_transaction_inputs(&tx, &state.utxo, now).is_ok()
            {
                let _ = self.mempool.admit(tx, now);
            }
        }

        let new_tip = state.chain.last().expect("chain never empty").clone();
        self.events.emit(Event::ChainReorg {
            fork_point,
            old_tip: old_tip_hash,
            new_tip: new_tip.hash(),
        });
        self.events.emit(Event::BlockAdded {
            index: new_tip.index(),
            hash: new_tip.hash(),
            miner: new_tip.miner.clone(),
            reward: new_tip
                .transactions
                .first()
                .and_then(|cb| cb.outputs.first())
                .map(|o| o.amount)
                .unwrap_or(0),
            tx_count: new_tip.transactions.len(),
        });
        self.persist_state_locked(state);
        self.update_chain_gauges(state, unix_now());

        Ok(())
    }

    /// Attach any parked orphans that now connect to the chain.
    fn connect_orphans_locked(&self, state: &mut ChainState) {
        loop {
            let tip_hash = state.chain.last().map(|b| b.hash()).unwrap_or_default();
            let Some(children) = state.orphans.remove(&tip_hash) else {
                break;
            };
            let mut attached = false;
            for child in children {
                let hash = child.hash();
                state.orphan_seen.remove(&hash);
                if self.append_locked(state, child.clone(), true).is_ok() {
                    attached = true;
                } else {
                    // Lost the race against a sibling; keep it around as a
                    // side block so fork choice can still consider it.
                    state.side_blocks.insert(hash, child);
                }
            }
            if !attached {
                break;
            }
        }
    }

    /// Periodic maintenance: expire mempool entries and stale orphans,
    /// refresh gauges, evaluate alert rules.
    pub fn tick(&self) {
        let now = unix_now();
        self.mempool.purge_expired(now);

        {
            let mut state = self.state.write();
            let expired: Vec<String> = state
                .orphan_seen
                .iter()
                .filter(|(_, seen)| now.saturating_sub(**seen) > ORPHAN_EXPIRY_SECS)
                .map(|(hash, _)| hash.clone())
                .collect();
            if !expired.is_empty() {
                let expired: HashSet<String> = expired.into_iter().collect();
                for hash in &expired {
                    state.orphan_seen.remove(hash);
                }
                for children in state.orphans.values_mut() {
                    children.retain(|b| !expired.contains(&b.hash()));
                }
                state.orphans.retain(|_, children| !children.is_empty());
            }
        }

        self.refresh_mempool_gauges(now);
        let stats = self.mempool.stats(now);
        for alert in self.alerts.evaluate(&stats) {
            log::warn!("alert {}: {}", alert.name, alert.message);
            self.events.emit(Event::Alert {
                name: alert.name,
                message: alert.message,
                level: alert.level,
            });
        }
    }

    // -- Read surface --

    pub fn get_balance(&self, address: &str) -> u128 {
        self.state.read().utxo.balance(address)
    }

    pub fn get_block(&self, r: &BlockRef) -> Option<Block> {
        let state = self.state.read();
        match r {
            BlockRef::Height(h) => state.chain.get(*h as usize).cloned(),
            BlockRef::Hash(hash) => state.chain.iter().find(|b| &b.hash() == hash).cloned(),
        }
    }

    pub fn height(&self) -> u64 {
        self.state.read().chain.last().map(|b| b.index()).unwrap_or(0)
    }

    pub fn tip_hash(&self) -> String {
        self.state
            .read()
            .chain
            .last()
            .map(|b| b.hash())
            .unwrap_or_default()
    }

    pub fn current_difficulty(&self) -> u32 {
        self.state.read().difficulty
    }

    pub fn pending_count(&self) -> usize {
        self.mempool.len()
    }

    pub fn unspent_outputs(&self, address: &str) -> Vec<crate::utxo::Utxo> {
        self.state.read().utxo.unspent_outputs(address)
    }

    pub fn get_contract(&self, address: &str) -> Option<ContractState> {
        self.state.read().contracts.get(address).cloned()
    }

    pub fn get_stats(&self) -> ChainStats {
        let now = unix_now();
        let state = self.state.read();
        let tip = state.chain.last().expect("chain never empty");
        let work: BigUint = consensus::cumulative_work(&state.chain);
        let mempool_stats = self.mempool.stats(now);
        ChainStats {
            height: tip.index(),
            tip_hash: tip.hash(),
            difficulty: state.difficulty,
            total_work: work.to_string(),
            block_count: state.chain.len(),
            pending_transactions: mempool_stats.count,
            mempool_bytes: mempool_stats.bytes,
            orphan_count: state.orphan_seen.len(),
            circulating_supply: state.utxo.total_circulating_supply(),
        }
    }

    pub fn total_circulating_supply(&self) -> u128 {
        self.state.read().utxo.total_circulating_supply()
    }

    pub fn snapshot_utxo(&self) -> UtxoSnapshot {
        self.state.read().utxo.snapshot()
    }

    pub fn restore_utxo(&self, snapshot: UtxoSnapshot) -> CoreResult<()> {
        self.state.write().utxo.restore(snapshot)
    }

    /// Clone of the full chain, for backups and corruption scans.
    pub fn chain_snapshot(&self) -> Vec<Block> {
        self.state.read().chain.clone()
    }

    /// Verify the whole chain against invariants I1..I8. `Ok(true)` or a
    /// `CorruptedChain` carrying every issue found.
    pub fn validate_chain(&self) -> CoreResult<bool> {
        let state = self.state.read();
        let issues = chain_issues(&state.chain, &state.utxo, &self.config);
        if issues.is_empty() {
            Ok(true)
        } else {
            Err(CoreError::CorruptedChain(issues))
        }
    }

    /// Replace the whole chain state from a validated backup. Storage is
    /// reset and re-appended so segments, index and state files agree.
    pub fn replace_chain(
        &self,
        blocks: Vec<Block>,
        utxo_snapshot: UtxoSnapshot,
        pending: Vec<Transaction>,
    ) -> CoreResult<()> {
        if blocks.is_empty() {
            return Err(CoreError::InvalidBlock("backup chain is empty".into()));
        }

        let mut state = self.state.write();

        let mut utxo = UtxoManager::new();
        utxo.restore(utxo_snapshot)?;

        let mut contracts = ContractRegistry::new();
        let mut txids = HashSet::new();
        for block in &blocks {
            for tx in &block.transactions {
                if tx.tx_type == TxType::ContractDeploy {
                    contracts.apply_deploy(tx, block.header.timestamp)?;
                }
                txids.insert(tx.txid.clone());
            }
        }

        self.store.reset(true)?;
        for block in &blocks {
            self.store.append(block)?;
        }

        state.difficulty = Self::replay_difficulty(&blocks, &self.config);
        state.chain = blocks;
        state.utxo = utxo;
        state.contracts = contracts;
        state.txids = txids;
        state.side_blocks.clear();
        state.orphans.clear();
        state.orphan_seen.clear();

        let now = unix_now();
        self.mempool.clear();
        for tx in pending {
            let _ = self.mempool.admit(tx, now);
        }

        self.persist_state_locked(&state);
        self.update_chain_gauges(&state, now);
        Ok(())
    }
}

/// Invariant sweep used by `validate_chain` and the corruption detector.
pub fn chain_issues(chain: &[Block], utxo: &UtxoManager, config: &Config) -> Vec<String> {
    let mut issues = Vec::new();

    if chain.is_empty() {
        issues.push("chain is empty".to_string());
        return issues;
    }

    let mut seen_txids: HashSet<&str> = HashSet::new();
    for (i, block) in chain.iter().enumerate() {
        if block.index() != i as u64 {
            issues.push(format!("block at position {i} has index {}", block.index()));
        }
        if i > 0 {
            let prev_hash = chain[i - 1].hash();
            if block.header.previous_hash != prev_hash {
                issues.push(format!("chain discontinuity at height {i}"));
            }
            if !block.header.meets_difficulty() {
                issues.push(format!("insufficient proof of work at height {i}"));
            }
        }
        let computed_root = Block::merkle_root(&block.transactions);
        if block.header.merkle_root != computed_root {
            issues.push(format!("merkle root mismatch at height {i}"));
        }
        for tx in &block.transactions {
            if !seen_txids.insert(tx.txid.as_str()) {
                issues.push(format!("duplicate txid {} at height {i}", tx.txid));
            }
            if i > 0 && !tx.verify_signature() {
                issues.push(format!("invalid signature on tx {} at height {i}", tx.txid));
            }
        }
    }

    let supply = utxo.total_circulating_supply();
    if supply > config.max_supply as u128 {
        issues.push(format!(
            "circulating supply {supply} exceeds max supply {}",
            config.max_supply
        ));
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::COIN;
    use crate::crypto::keys;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        Config {
            data_dir: dir.path().to_path_buf(),
            initial_difficulty: 4,
            // Keep retargets out of short test chains.
            difficulty_retarget_interval: 1_000,
            min_fee_rate: 1,
            ..Config::default()
        }
    }

    fn keyed(seed: u8) -> ([u8; 32], String) {
        let secret = [seed; 32];
        let (pk_hex, _) = keys::sign(&secret, b"probe");
        (secret, keys::address_from_public_key_hex(&pk_hex))
    }

    #[test]
    fn open_creates_genesis() {
        let dir = TempDir::new().unwrap();
        let chain = Blockchain::open(test_config(&dir)).unwrap();
        assert_eq!(chain.height(), 0);
        let stats = chain.get_stats();
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.circulating_supply, 0);
    }

    #[test]
    fn mine_appends_and_pays_miner() {
        let dir = TempDir::new().unwrap();
        let chain = Blockchain::open(test_config(&dir)).unwrap();
        let (_, miner) = keyed(1);

        let block = chain.mine_next(&miner, &CancelToken::new()).unwrap();
        assert_eq!(block.index(), 1);
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.get_balance(&miner), 50 * COIN as u128);
    }

    #[test]
    fn reopen_restores_chain_state() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        let (_, miner) = keyed(1);
        {
            let chain = Blockchain::open(cfg.clone()).unwrap();
            chain.mine_next(&miner, &CancelToken::new()).unwrap();
            chain.mine_next(&miner, &CancelToken::new()).unwrap();
        }
        let chain = Blockchain::open(cfg).unwrap();
        assert_eq!(chain.height(), 2);
        assert_eq!(chain.get_balance(&miner), 100 * COIN as u128);
        chain.validate_chain().unwrap();
    }

    #[test]
    fn submit_and_confirm_transfer() {
        let dir = TempDir::new().unwrap();
        let chain = Blockchain::open(test_config(&dir)).unwrap();
        let (secret, alice) = keyed(1);
        let (_, bob) = keyed(2);

        chain.mine_next(&alice, &CancelToken::new()).unwrap();
        let coin = chain.unspent_outputs(&alice)[0].clone();

        let tx = Transaction::transfer(
            &secret, &alice, &bob, 30 * COIN, COIN,
            vec![(coin.txid, coin.vout, coin.amount)],
            unix_now(), None,
        );
        chain.submit_transaction(tx).unwrap();
        assert_eq!(chain.pending_count(), 1);

        chain.mine_next(&alice, &CancelToken::new()).unwrap();
        assert_eq!(chain.pending_count(), 0);
        assert_eq!(chain.get_balance(&bob), 30 * COIN as u128);
        // 50 original - 30 - 1 fee + (50 reward + 1 fee) from the new coinbase.
        assert_eq!(chain.get_balance(&alice), 70 * COIN as u128);
    }

    #[test]
    fn receive_block_extending_tip() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();

        let node_a = Blockchain::open(test_config(&dir_a)).unwrap();
        let node_b = Blockchain::open(test_config(&dir_b)).unwrap();
        let (_, miner) = keyed(1);

        let block = node_a.mine_next(&miner, &CancelToken::new()).unwrap();
        let disposition = node_b.receive_block(block).unwrap();
        assert_eq!(disposition, BlockDisposition::Appended);
        assert_eq!(node_b.height(), 1);
    }

    #[test]
    fn unknown_parent_is_parked_and_requested() {
        let dir = TempDir::new().unwrap();
        let chain = Blockchain::open(test_config(&dir)).unwrap();
        let mut rx = chain.events().subscribe();
        let (_, miner) = keyed(1);

        // A block built two heights ahead on a parent this node never saw.
        let dir2 = TempDir::new().unwrap();
        let other = Blockchain::open(test_config(&dir2)).unwrap();
        other.mine_next(&miner, &CancelToken::new()).unwrap();
        let far = other.mine_next(&miner, &CancelToken::new()).unwrap();

        let disposition = chain.receive_block(far.clone()).unwrap();
        assert_eq!(disposition, BlockDisposition::Orphaned);
        assert_eq!(chain.get_stats().orphan_count, 1);

        let mut saw_need_block = false;
        while let Ok(ev) = rx.try_recv() {
            if let Event::NeedBlock { hash } = ev {
                assert_eq!(hash, far.header.previous_hash);
                saw_need_block = true;
            }
        }
        assert!(saw_need_block);
    }

    #[test]
    fn orphan_connects_when_parent_arrives() {
        let dir = TempDir::new().unwrap();
        let dir2 = TempDir::new().unwrap();
        let chain = Blockchain::open(test_config(&dir)).unwrap();
        let other = Blockchain::open(test_config(&dir2)).unwrap();
        let (_, miner) = keyed(1);

        let b1 = other.mine_next(&miner, &CancelToken::new()).unwrap();
        let b2 = other.mine_next(&miner, &CancelToken::new()).unwrap();

        assert_eq!(chain.receive_block(b2).unwrap(), BlockDisposition::Orphaned);
        assert_eq!(chain.height(), 0);

        // Parent arrives; the parked child attaches in the same call.
        assert_eq!(chain.receive_block(b1).unwrap(), BlockDisposition::Appended);
        assert_eq!(chain.height(), 2);
        assert_eq!(chain.get_stats().orphan_count, 0);
    }

    #[test]
    fn heavier_fork_triggers_reorg() {
        let dir = TempDir::new().unwrap();
        let dir2 = TempDir::new().unwrap();
        let chain = Blockchain::open(test_config(&dir)).unwrap();
        let rival = Blockchain::open(test_config(&dir2)).unwrap();
        let (_, local_miner) = keyed(1);
        let (_, rival_miner) = keyed(2);

        // Local chain: height 1. Rival chain: height 2, strictly more work.
        chain.mine_next(&local_miner, &CancelToken::new()).unwrap();
        let r1 = rival.mine_next(&rival_miner, &CancelToken::new()).unwrap();
        let r2 = rival.mine_next(&rival_miner, &CancelToken::new()).unwrap();

        let mut rx = chain.events().subscribe();
        let old_tip = chain.tip_hash();

        assert_eq!(chain.receive_block(r1).unwrap(), BlockDisposition::Orphaned);
        assert_eq!(chain.receive_block(r2.clone()).unwrap(), BlockDisposition::Reorged);

        assert_eq!(chain.height(), 2);
        assert_eq!(chain.tip_hash(), r2.hash());
        assert_eq!(chain.get_balance(&rival_miner), 100 * COIN as u128);
        assert_eq!(chain.get_balance(&local_miner), 0);
        chain.validate_chain().unwrap();

        let mut saw_reorg = false;
        while let Ok(ev) = rx.try_recv() {
            if let Event::ChainReorg {
                fork_point,
                old_tip: ev_old,
                new_tip,
            } = ev
            {
                assert_eq!(fork_point, 0);
                assert_eq!(ev_old, old_tip);
                assert_eq!(new_tip, r2.hash());
                saw_reorg = true;
            }
        }
        assert!(saw_reorg);
    }

    #[test]
    fn lighter_fork_is_parked() {
        let dir = TempDir::new().unwrap();
        let dir2 = TempDir::new().unwrap();
        let chain = Blockchain::open(test_config(&dir)).unwrap();
        let rival = Blockchain::open(test_config(&dir2)).unwrap();
        let (_, miner) = keyed(1);
        let (_, rival_miner) = keyed(2);

        chain.mine_next(&miner, &CancelToken::new()).unwrap();
        chain.mine_next(&miner, &CancelToken::new()).unwrap();
        let r1 = rival.mine_next(&rival_miner, &CancelToken::new()).unwrap();

        // Same work as block 1 but less than the two-block main chain.
        assert_eq!(chain.receive_block(r1).unwrap(), BlockDisposition::Orphaned);
        assert_eq!(chain.height(), 2);
        assert_eq!(chain.get_balance(&rival_miner), 0);
    }

    #[test]
    fn stats_report_work_and_supply() {
        let dir = TempDir::new().unwrap();
        let chain = Blockchain::open(test_config(&dir)).unwrap();
        let (_, miner) = keyed(1);
        chain.mine_next(&miner, &CancelToken::new()).unwrap();

        let stats = chain.get_stats();
        assert_eq!(stats.height, 1);
        // Two blocks at difficulty 4: 16 + 16.
        assert_eq!(stats.total_work, "32");
        assert_eq!(stats.circulating_supply, 50 * COIN as u128);
        assert_eq!(stats.difficulty, 4);
    }

    #[test]
    fn snapshot_restore_utxo_round_trip() {
        let dir = TempDir::new().unwrap();
        let chain = Blockchain::open(test_config(&dir)).unwrap();
        let (_, miner) = keyed(1);
        chain.mine_next(&miner, &CancelToken::new()).unwrap();

        let snap = chain.snapshot_utxo();
        assert_eq!(snap.total_value, 50 * COIN as u128);
        chain.restore_utxo(snap.clone()).unwrap();
        assert_eq!(chain.get_balance(&miner), 50 * COIN as u128);
    }
}
