pub mod backup;
pub mod breaker;
pub mod corruption;

pub use backup::{BackupManager, BackupPayload};
pub use breaker::{CircuitBreaker, CircuitState, RetryPolicy};
pub use corruption::CorruptionDetector;

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::blockchain::{chain, Blockchain};
use crate::errors::{CoreError, CoreResult};
use crate::tx::Transaction;
use crate::utxo::UtxoManager;

/// Named operations wrapped by circuit breakers.
pub const GUARDED_OPERATIONS: [&str; 4] = ["mining", "validation", "network", "storage"];

/// Corruption scans run every six hours, cleanup once a day.
pub const CORRUPTION_SCAN_INTERVAL_SECS: u64 = 6 * 3_600;
pub const CLEANUP_INTERVAL_SECS: u64 = 24 * 3_600;

/// Guards the core with circuit breakers, takes scheduled backups, scans
/// for corruption and rolls the chain back from the newest valid backup
/// when the scan finds real damage.
pub struct RecoveryManager {
    chain: Arc<Blockchain>,
    backups: BackupManager,
    retry: RetryPolicy,
    breakers: HashMap<&'static str, CircuitBreaker>,
}

impl RecoveryManager {
    pub fn new(chain: Arc<Blockchain>) -> CoreResult<Self> {
        let backups = BackupManager::new(chain.config().backups_dir())?;
        let breakers = GUARDED_OPERATIONS
            .iter()
            .map(|name| (*name, CircuitBreaker::with_defaults(name)))
            .collect();
        Ok(Self {
            chain,
            backups,
            retry: RetryPolicy::default(),
            breakers,
        })
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn breaker(&self, operation: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(operation)
    }

    /// Run a closure through the named operation's circuit breaker.
    /// Unknown names run unguarded.
    pub fn call<T>(&self, operation: &str, f: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        match self.breakers.get(operation) {
            Some(breaker) => breaker.call(f),
            None => f(),
        }
    }

    pub fn create_backup(&self) -> CoreResult<PathBuf> {
        self.backups.create(
            self.chain.chain_snapshot(),
            self.chain.snapshot_utxo(),
            self.chain.mempool().pending_transactions(),
        )
    }

    /// Corruption sweep over the live state.
    pub fn scan(&self) -> CoreResult<Vec<String>> {
        let blocks = self.chain.chain_snapshot();
        let snapshot = self.chain.snapshot_utxo();
        let utxo = UtxoManager::from_map(snapshot.utxo_set);
        CorruptionDetector::new(self.chain.config()).detect(&blocks, &utxo)
    }

    fn pending_rescue_path(&self) -> PathBuf {
        self.chain.config().recovery_dir().join("pending_transactions.json")
    }

    fn preserve_pending(&self) -> CoreResult<Vec<Transaction>> {
        let pending = self.chain.mempool().pending_transactions();
        fs::create_dir_all(self.chain.config().recovery_dir())?;
        fs::write(
            self.pending_rescue_path(),
            serde_json::to_string_pretty(&pending)?,
        )?;
        Ok(pending)
    }

    /// Walk backups newest first and apply the first one that decodes,
    /// passes its integrity hash, and replays cleanly. Pending
    /// transactions are preserved first and resubmitted afterwards. When
    /// no backup works the core is halted.
    pub fn handle_corruption(&self) -> CoreResult<PathBuf> {
        log::warn!("corruption recovery started");
        let preserved = self.preserve_pending()?;

        for path in self.backups.list()? {
            let payload = match self.backups.restore(&path) {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("backup {} unusable: {e}", path.display());
                    continue;
                }
            };

            let replayed = match UtxoManager::from_chain(&payload.chain) {
                Ok(u) => u,
                Err(e) => {
                    log::warn!("backup {} replay failed: {e}", path.display());
                    continue;
                }
            };
            let issues = chain::chain_issues(&payload.chain, &replayed, self.chain.config());
            if !issues.is_empty() {
                log::warn!(
                    "backup {} fails validation ({} issues), trying older",
                    path.display(),
                    issues.len()
                );
                continue;
            }

            self.chain
                .replace_chain(payload.chain, payload.utxo, payload.pending)?;
            for tx in preserved {
                let _ = self.chain.submit_transaction(tx);
            }
            log::info!("chain restored from {}", path.display());
            return Ok(path);
        }

        self.chain.halt();
        Err(CoreError::CorruptedChain(vec![
            "no valid backup available; core halted".to_string(),
        ]))
    }

    /// One scheduler step. `minute` counts wake-ups since start; cadence
    /// is derived from it so the loop itself stays trivial.
    pub fn scheduler_tick(&self, minute: u64) {
        self.chain.tick();

        let backup_every = (self.chain.config().backup_interval_seconds / 60).max(1);
        if minute > 0 && minute % backup_every == 0 {
            if let Err(e) = self.retry.execute(|| self.create_backup()) {
                log::error!("scheduled backup failed: {e}");
            }
        }

        let scan_every = (CORRUPTION_SCAN_INTERVAL_SECS / 60).max(1);
        if minute > 0 && minute % scan_every == 0 {
            match self.scan() {
                Ok(issues) if issues.is_empty() => {}
                Ok(issues) => {
                    log::error!("corruption scan found {} issues", issues.len());
                    if let Err(e) = self.handle_corruption() {
                        log::error!("corruption recovery failed: {e}");
                    }
                }
                Err(e) => log::error!("corruption scan errored: {e}"),
            }
        }

        let cleanup_every = (CLEANUP_INTERVAL_SECS / 60).max(1);
        if minute > 0 && minute % cleanup_every == 0 {
            let keep = self.chain.config().backup_keep_count;
            if let Err(e) = self.backups.cleanup(keep) {
                log::error!("backup cleanup failed: {e}");
            }
        }
    }

    /// Scheduler loop: one wake-up per minute. Backups hourly (per
    /// config), corruption scans six-hourly, cleanup daily.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        let mut minute: u64 = 0;
        loop {
            ticker.tick().await;
            let mgr = Arc::clone(&self);
            let m = minute;
            // Snapshot work runs on the blocking pool; writers are not held up.
            let _ = tokio::task::spawn_blocking(move || mgr.scheduler_tick(m)).await;
            minute += 1;
        }
    }
}
