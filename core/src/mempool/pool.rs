use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::config::Config;
use crate::errors::{CoreError, CoreResult};
use crate::tx::Transaction;

/// A transaction staged for inclusion, with the derived values admission
/// and selection order on.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub size: usize,
    /// Atomic units per 1000 serialized bytes.
    pub fee_rate: u64,
    /// Wall-clock admission time, drives expiry.
    pub added_at: u64,
}

#[derive(Debug, Default)]
struct BanState {
    score: u32,
    banned_until: Option<u64>,
}

/// Point-in-time counters for the metrics sink.
#[derive(Debug, Clone, Default)]
pub struct MempoolStats {
    pub count: usize,
    pub bytes: usize,
    pub active_bans: usize,
    pub invalid_submissions_total: u64,
    pub ban_rejections_total: u64,
    pub evicted_low_fee_total: u64,
    pub expired_total: u64,
}

/// Result of a successful admission: which entries were evicted to make room.
#[derive(Debug, Default)]
pub struct AdmitOutcome {
    pub evicted: Vec<String>,
}

/// Fee-rate ordered staging area for validated-but-unconfirmed transactions.
/// Holds its own locks and never the chain writer lock; the chain calls in
/// for admission, selection and post-block cleanup.
pub struct Mempool {
    max_bytes: usize,
    max_per_sender: usize,
    expiry_seconds: u64,
    min_fee_rate: u64,
    ban_score_threshold: u32,
    ban_duration_seconds: u64,

    entries: RwLock<HashMap<String, MempoolEntry>>,
    by_sender: RwLock<HashMap<String, HashSet<String>>>,
    /// "txid:vout" outpoints consumed by pending transactions. O(1)
    /// double-spend detection against the pool itself.
    spent_outpoints: RwLock<HashSet<String>>,
    bans: RwLock<HashMap<String, BanState>>,

    total_bytes: AtomicUsize,
    invalid_submissions: AtomicU64,
    ban_rejections: AtomicU64,
    evicted_low_fee: AtomicU64,
    expired: AtomicU64,
}

fn outpoint(txid: &str, vout: u32) -> String {
    format!("{txid}:{vout}")
}

impl Mempool {
    pub fn new(config: &Config) -> Self {
        Self {
            max_bytes: config.mempool_max_bytes,
            max_per_sender: config.mempool_max_per_sender,
            expiry_seconds: config.mempool_expiry_seconds,
            min_fee_rate: config.min_fee_rate,
            ban_score_threshold: config.ban_score_threshold,
            ban_duration_seconds: config.ban_duration_seconds,
            entries: RwLock::new(HashMap::new()),
            by_sender: RwLock::new(HashMap::new()),
            spent_outpoints: RwLock::new(HashSet::new()),
            bans: RwLock::new(HashMap::new()),
            total_bytes: AtomicUsize::new(0),
            invalid_submissions: AtomicU64::new(0),
            ban_rejections: AtomicU64::new(0),
            evicted_low_fee: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    // -- Ban bookkeeping --

    /// Check the sender's ban and record the rejection if banned.
    pub fn check_banned(&self, sender: &str, now: u64) -> CoreResult<()> {
        let mut bans = self.bans.write().unwrap();
        if let Some(state) = bans.get_mut(sender) {
            if let Some(until) = state.banned_until {
                if now < until {
                    drop(bans);
                    self.ban_rejections.fetch_add(1, Ordering::Relaxed);
                    return Err(CoreError::SenderBanned(sender.to_string()));
                }
                // Ban expired: wipe the slate.
                state.banned_until = None;
                state.score = 0;
            }
        }
        Ok(())
    }

    /// Raise the sender's ban score after an invalid submission. Crossing
    /// the threshold bans the sender for `ban_duration_seconds`.
    pub fn raise_ban_score(&self, sender: &str, now: u64) {
        self.invalid_submissions.fetch_add(1, Ordering::Relaxed);
        let mut bans = self.bans.write().unwrap();
        let state = bans.entry(sender.to_string()).or_default();
        state.score += 1;
        if state.score >= self.ban_score_threshold {
            state.banned_until = Some(now + self.ban_duration_seconds);
            log::warn!(
                "sender {} banned until {} (score {})",
                sender,
                now + self.ban_duration_seconds,
                state.score
            );
        }
    }

    pub fn active_ban_count(&self, now: u64) -> usize {
        self.bans
            .read()
            .unwrap()
            .values()
            .filter(|s| s.banned_until.is_some_and(|until| now < until))
            .count()
    }

    // -- Admission --

    /// Admit a transaction that already passed consensus validation.
    /// Applies the pool-local rules: duplicate and double-spend detection,
    /// nonce monotonicity, fee floor, byte-bound eviction, per-sender cap.
    pub fn admit(&self, tx: Transaction, now: u64) -> CoreResult<AdmitOutcome> {
        let size = tx.serialized_size();
        let fee_rate = tx.fee_rate();

        if fee_rate < self.min_fee_rate {
            return Err(CoreError::LowFeeRate {
                offered: fee_rate,
                floor: self.min_fee_rate,
            });
        }
        if size > self.max_bytes {
            return Err(CoreError::MempoolFull);
        }

        let mut entries = self.entries.write().unwrap();
        let mut by_sender = self.by_sender.write().unwrap();
        let mut spent = self.spent_outpoints.write().unwrap();

        if entries.contains_key(&tx.txid) {
            // Re-announcement of a pending transaction is not an error.
            return Ok(AdmitOutcome::default());
        }

        for input in &tx.inputs {
            let op = outpoint(&input.txid, input.vout);
            if spent.contains(&op) {
                return Err(CoreError::DoubleSpend(op));
            }
        }

        let sender_txids = by_sender.entry(tx.sender.clone()).or_default();
        if sender_txids.len() >= self.max_per_sender {
            return Err(CoreError::SenderCap(tx.sender.clone()));
        }

        // Optional per-sender nonce must be strictly monotonic among the
        // sender's pending transactions.
        if let Some(nonce) = tx.nonce {
            let max_pending = sender_txids
                .iter()
                .filter_map(|id| entries.get(id).and_then(|e| e.tx.nonce))
                .max();
            if let Some(max_pending) = max_pending {
                if nonce <= max_pending {
                    return Err(CoreError::InvalidTransaction(format!(
                        "nonce {nonce} not greater than pending nonce {max_pending}"
                    )));
                }
            }
        }

        // Make room. Only entries with a strictly lower fee rate than the
        // newcomer are evictable; otherwise the newcomer is the loser.
        let mut evicted = Vec::new();
        while self.total_bytes.load(Ordering::Relaxed) + size > self.max_bytes {
            let victim = super::eviction::lowest_fee_rate_entry(&entries);
            match victim {
                Some((victim_id, victim_rate)) if victim_rate < fee_rate => {
                    if let Some(entry) = entries.remove(&victim_id) {
                        for input in &entry.tx.inputs {
                            spent.remove(&outpoint(&input.txid, input.vout));
                        }
                        if let Some(ids) = by_sender.get_mut(&entry.tx.sender) {
                            ids.remove(&victim_id);
                        }
                        self.total_bytes.fetch_sub(entry.size, Ordering::Relaxed);
                        self.evicted_low_fee.fetch_add(1, Ordering::Relaxed);
                        evicted.push(victim_id);
                    }
                }
                Some((_, victim_rate)) => {
                    return Err(CoreError::LowFeeRate {
                        offered: fee_rate,
                        floor: victim_rate,
                    });
                }
                None => return Err(CoreError::MempoolFull),
            }
        }

        for input in &tx.inputs {
            spent.insert(outpoint(&input.txid, input.vout));
        }
        by_sender
            .entry(tx.sender.clone())
            .or_default()
            .insert(tx.txid.clone());
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        entries.insert(
            tx.txid.clone(),
            MempoolEntry {
                tx,
                size,
                fee_rate,
                added_at: now,
            },
        );

        Ok(AdmitOutcome { evicted })
    }

    // -- Removal paths --

    fn remove_locked(
        entries: &mut HashMap<String, MempoolEntry>,
        by_sender: &mut HashMap<String, HashSet<String>>,
        spent: &mut HashSet<String>,
        total_bytes: &AtomicUsize,
        txid: &str,
    ) -> Option<MempoolEntry> {
        let entry = entries.remove(txid)?;
        for input in &entry.tx.inputs {
            spent.remove(&outpoint(&input.txid, input.vout));
        }
        if let Some(ids) = by_sender.get_mut(&entry.tx.sender) {
            ids.remove(txid);
            if ids.is_empty() {
                by_sender.remove(&entry.tx.sender);
            }
        }
        total_bytes.fetch_sub(entry.size, Ordering::Relaxed);
        Some(entry)
    }

    pub fn remove(&self, txid: &str) -> Option<MempoolEntry> {
        let mut entries = self.entries.write().unwrap();
        let mut by_sender = self.by_sender.write().unwrap();
        let mut spent = self.spent_outpoints.write().unwrap();
        Self::remove_locked(&mut entries, &mut by_sender, &mut spent, &self.total_bytes, txid)
    }

    /// Drop every transaction included in a confirmed block.
    pub fn remove_confirmed(&self, txs: &[Transaction]) {
        for tx in txs {
            self.remove(&tx.txid);
        }
    }

    /// Drop everything. Used when the whole chain state is replaced.
    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
        self.by_sender.write().unwrap().clear();
        self.spent_outpoints.write().unwrap().clear();
        self.total_bytes.store(0, Ordering::Relaxed);
    }

    /// Drop pending transactions whose inputs are no longer spendable,
    /// re-checking dependents after the chain state moved (block append or
    /// reorg). The caller supplies the spendability predicate.
    pub fn drop_invalidated<F>(&self, mut still_spendable: F) -> Vec<String>
    where
        F: FnMut(&Transaction) -> bool,
    {
        let stale: Vec<String> = {
            let entries = self.entries.read().unwrap();
            entries
                .values()
                .filter(|e| !still_spendable(&e.tx))
                .map(|e| e.tx.txid.clone())
                .collect()
        };
        for txid in &stale {
            self.remove(txid);
        }
        stale
    }

    /// Purge entries older than the configured expiry. Called on each tick.
    pub fn purge_expired(&self, now: u64) -> Vec<String> {
        let cutoff = now.saturating_sub(self.expiry_seconds);
        let stale: Vec<String> = {
            let entries = self.entries.read().unwrap();
            entries
                .values()
                .filter(|e| e.added_at < cutoff)
                .map(|e| e.tx.txid.clone())
                .collect()
        };
        for txid in &stale {
            self.remove(txid);
            self.expired.fetch_add(1, Ordering::Relaxed);
        }
        stale
    }

    // -- Queries --

    pub fn contains(&self, txid: &str) -> bool {
        self.entries.read().unwrap().contains_key(txid)
    }

    pub fn get(&self, txid: &str) -> Option<Transaction> {
        self.entries.read().unwrap().get(txid).map(|e| e.tx.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.entries
            .read()
            .unwrap()
            .values()
            .map(|e| e.tx.clone())
            .collect()
    }

    pub fn stats(&self, now: u64) -> MempoolStats {
        MempoolStats {
            count: self.len(),
            bytes: self.total_bytes(),
            active_bans: self.active_ban_count(now),
            invalid_submissions_total: self.invalid_submissions.load(Ordering::Relaxed),
            ban_rejections_total: self.ban_rejections.load(Ordering::Relaxed),
            evicted_low_fee_total: self.evicted_low_fee.load(Ordering::Relaxed),
            expired_total: self.expired.load(Ordering::Relaxed),
        }
    }

    /// Select transactions for a block template: descending fee rate under
    /// a byte budget, with the constraint that a transaction spending
    /// another pending transaction's output comes after it.
    pub fn select_for_block(&self, max_bytes: usize) -> Vec<Transaction> {
        let entries = self.entries.read().unwrap();

        let mut candidates: Vec<&MempoolEntry> = entries.values().collect();
        candidates.sort_by(|a, b| {
            b.fee_rate
                .cmp(&a.fee_rate)
                .then(a.added_at.cmp(&b.added_at))
                .then(a.tx.txid.cmp(&b.tx.txid))
        });

        let mut selected: Vec<Transaction> = Vec::new();
        let mut selected_ids: HashSet<&str> = HashSet::new();
        let mut budget = max_bytes;

        // Passes until a fixpoint: a dependent becomes eligible once its
        // in-pool parent has been placed earlier in the block.
        loop {
            let mut progressed = false;
            for entry in &candidates {
                if selected_ids.contains(entry.tx.txid.as_str()) || entry.size > budget {
                    continue;
                }
                let deps_met = entry.tx.inputs.iter().all(|input| {
                    !entries.contains_key(&input.txid)
                        || selected_ids.contains(input.txid.as_str())
                });
                if deps_met {
                    selected_ids.insert(entry.tx.txid.as_str());
                    budget -= entry.size;
                    selected.push(entry.tx.clone());
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        selected
    }
}
