use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blockchain::block::Block;
use crate::crypto;
use crate::errors::{CoreError, CoreResult};
use crate::tx::Transaction;
use crate::utxo::UtxoSnapshot;

/// One full chain snapshot on disk: chain, UTXO set, pending transactions
/// and free-form metadata, sealed by an integrity hash.
#[derive(Debug, Serialize, Deserialize)]
pub struct BackupPayload {
    pub chain: Vec<Block>,
    pub utxo: UtxoSnapshot,
    pub pending: Vec<Transaction>,
    pub metadata: Value,
    pub integrity_hash: String,
}

fn payload_digest(chain: &[Block], utxo: &UtxoSnapshot, pending: &[Transaction]) -> CoreResult<String> {
    let body = serde_json::json!({
        "chain": chain,
        "utxo": utxo,
        "pending": pending,
    });
    Ok(crypto::sha256_hex(body.to_string().as_bytes()))
}

/// Writes, lists, restores and prunes `backup_*.json` snapshots.
pub struct BackupManager {
    dir: PathBuf,
}

impl BackupManager {
    pub fn new(dir: PathBuf) -> CoreResult<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Serialize a snapshot to `backup_<utc>_<height>.json`. The timestamp
    /// prefix makes lexical order chronological.
    pub fn create(
        &self,
        chain: Vec<Block>,
        utxo: UtxoSnapshot,
        pending: Vec<Transaction>,
    ) -> CoreResult<PathBuf> {
        let height = chain.last().map(|b| b.index()).unwrap_or(0);
        let integrity_hash = payload_digest(&chain, &utxo, &pending)?;
        let payload = BackupPayload {
            chain,
            utxo,
            pending,
            metadata: serde_json::json!({
                "height": height,
                "created_at": Utc::now().to_rfc3339(),
            }),
            integrity_hash,
        };

        let name = format!(
            "backup_{}_{}.json",
            Utc::now().format("%Y%m%d_%H%M%S%3f"),
            height
        );
        let path = self.dir.join(name);
        fs::write(&path, serde_json::to_string(&payload)?)?;
        log::info!("backup written: {}", path.display());
        Ok(path)
    }

    /// All backups, newest first.
    pub fn list(&self) -> CoreResult<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("backup_") && name.ends_with(".json") {
                out.push(entry.path());
            }
        }
        out.sort();
        out.reverse();
        Ok(out)
    }

    /// Decode and integrity-check a backup file.
    pub fn restore(&self, path: &Path) -> CoreResult<BackupPayload> {
        let payload: BackupPayload = serde_json::from_str(&fs::read_to_string(path)?)?;
        let expected = payload_digest(&payload.chain, &payload.utxo, &payload.pending)?;
        if expected != payload.integrity_hash {
            return Err(CoreError::CorruptSnapshot(format!(
                "backup {} integrity hash mismatch",
                path.display()
            )));
        }
        Ok(payload)
    }

    /// Delete everything but the `keep` most recent backups. Returns the
    /// number removed.
    pub fn cleanup(&self, keep: usize) -> CoreResult<usize> {
        let backups = self.list()?;
        let mut removed = 0;
        for stale in backups.iter().skip(keep) {
            fs::remove_file(stale)?;
            removed += 1;
        }
        if removed > 0 {
            log::info!("pruned {removed} old backups, kept {keep}");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utxo::UtxoManager;
    use tempfile::TempDir;

    fn snapshot_with_genesis() -> (Vec<Block>, UtxoSnapshot) {
        let genesis = Block::genesis(1_717_200_000, 4);
        let mut utxo = UtxoManager::new();
        utxo.apply_transaction(&genesis.transactions[0], genesis.header.timestamp)
            .unwrap();
        (vec![genesis], utxo.snapshot())
    }

    #[test]
    fn create_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let mgr = BackupManager::new(dir.path().to_path_buf()).unwrap();
        let (chain, utxo) = snapshot_with_genesis();

        let path = mgr.create(chain.clone(), utxo, vec![]).unwrap();
        let payload = mgr.restore(&path).unwrap();
        assert_eq!(payload.chain.len(), 1);
        assert_eq!(payload.chain[0].hash(), chain[0].hash());
        assert_eq!(payload.metadata["height"], 0);
    }

    #[test]
    fn tampered_backup_rejected() {
        let dir = TempDir::new().unwrap();
        let mgr = BackupManager::new(dir.path().to_path_buf()).unwrap();
        let (chain, utxo) = snapshot_with_genesis();
        let path = mgr.create(chain, utxo, vec![]).unwrap();

        let tampered = fs::read_to_string(&path)
            .unwrap()
            .replace("\"amount\":0", "\"amount\":9000");
        fs::write(&path, tampered).unwrap();

        assert!(matches!(
            mgr.restore(&path),
            Err(CoreError::CorruptSnapshot(_))
        ));
    }

    #[test]
    fn list_is_newest_first() {
        let dir = TempDir::new().unwrap();
        let mgr = BackupManager::new(dir.path().to_path_buf()).unwrap();
        let (chain, utxo) = snapshot_with_genesis();

        let first = mgr.create(chain.clone(), utxo.clone(), vec![]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = mgr.create(chain, utxo, vec![]).unwrap();

        let listed = mgr.list().unwrap();
        assert_eq!(listed, vec![second, first]);
    }

    #[test]
    fn cleanup_keeps_most_recent() {
        let dir = TempDir::new().unwrap();
        let mgr = BackupManager::new(dir.path().to_path_buf()).unwrap();
        let (chain, utxo) = snapshot_with_genesis();

        for _ in 0..5 {
            mgr.create(chain.clone(), utxo.clone(), vec![]).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let removed = mgr.cleanup(2).unwrap();
        assert_eq!(removed, 3);
        assert_eq!(mgr.list().unwrap().len(), 2);
    }
}
