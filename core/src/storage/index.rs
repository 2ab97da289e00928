use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use heed::byteorder::BigEndian;
use heed::types::{SerdeBincode, Str, U64};
use heed::{Database, Env, EnvOpenOptions};
use lru_cache::LruCache;
use serde::{Deserialize, Serialize};

use crate::blockchain::block::Block;
use crate::errors::{CoreError, CoreResult};

/// Where a block lives on disk: segment path relative to the data dir,
/// byte offset of its line, and the line's byte length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub file: String,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub entries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_size: usize,
}

/// Durable height/hash index over the append-only segment files, wrapped by
/// an LRU of fully parsed blocks. Owns `block_index.db` exclusively.
pub struct BlockIndex {
    env: Env,
    locations: Database<U64<BigEndian>, SerdeBincode<IndexEntry>>,
    hash_to_height: Database<Str, U64<BigEndian>>,
    cache: Mutex<LruCache<u64, Arc<Block>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl BlockIndex {
    pub fn open(path: &Path, cache_size: usize) -> CoreResult<Self> {
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(1024 * 1024 * 1024)
                .max_dbs(4)
                .open(path)
                .map_err(|e| CoreError::IndexWriteError(e.to_string()))?
        };

        let mut wtxn = env
            .write_txn()
            .map_err(|e| CoreError::IndexWriteError(e.to_string()))?;
        let locations = env
            .create_database(&mut wtxn, Some("locations"))
            .map_err(|e| CoreError::IndexWriteError(e.to_string()))?;
        let hash_to_height = env
            .create_database(&mut wtxn, Some("hash_to_height"))
            .map_err(|e| CoreError::IndexWriteError(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| CoreError::IndexWriteError(e.to_string()))?;

        Ok(Self {
            env,
            locations,
            hash_to_height,
            cache: Mutex::new(LruCache::new(cache_size.max(1))),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        })
    }

    /// Insert or overwrite the location of a block. Idempotent on equal
    /// inputs; a re-appended height (reorg) simply overwrites.
    pub fn index_block(
        &self,
        height: u64,
        hash: &str,
        file: &str,
        offset: u64,
        size: u64,
    ) -> CoreResult<()> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| CoreError::IndexWriteError(e.to_string()))?;
        let entry = IndexEntry {
            file: file.to_string(),
            offset,
            size,
        };
        self.locations
            .put(&mut wtxn, &height, &entry)
            .map_err(|e| CoreError::IndexWriteError(e.to_string()))?;
        self.hash_to_height
            .put(&mut wtxn, hash, &height)
            .map_err(|e| CoreError::IndexWriteError(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| CoreError::IndexWriteError(e.to_string()))?;
        Ok(())
    }

    pub fn get_location(&self, height: u64) -> CoreResult<Option<IndexEntry>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| CoreError::IndexWriteError(e.to_string()))?;
        self.locations
            .get(&rtxn, &height)
            .map_err(|e| CoreError::IndexWriteError(e.to_string()))
    }

    pub fn get_height(&self, hash: &str) -> CoreResult<Option<u64>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| CoreError::IndexWriteError(e.to_string()))?;
        self.hash_to_height
            .get(&rtxn, hash)
            .map_err(|e| CoreError::IndexWriteError(e.to_string()))
    }

    /// Delete every entry at `height >= fork_height` and drop the block
    /// cache. Used exclusively during reorg.
    pub fn remove_from(&self, fork_height: u64) -> CoreResult<()> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| CoreError::IndexWriteError(e.to_string()))?;

        let stale_hashes: Vec<String> = {
            let iter = self
                .hash_to_height
                .iter(&wtxn)
                .map_err(|e| CoreError::IndexWriteError(e.to_string()))?;
            let mut stale = Vec::new();
            for item in iter {
                let (hash, height) = item.map_err(|e| CoreError::IndexWriteError(e.to_string()))?;
                if height >= fork_height {
                    stale.push(hash.to_string());
                }
            }
            stale
        };
        for hash in &stale_hashes {
            self.hash_to_height
                .delete(&mut wtxn, hash)
                .map_err(|e| CoreError::IndexWriteError(e.to_string()))?;
        }

        let max = {
            self.locations
                .last(&wtxn)
                .map_err(|e| CoreError::IndexWriteError(e.to_string()))?
                .map(|(h, _)| h)
        };
        if let Some(max) = max {
            for h in fork_height..=max {
                self.locations
                    .delete(&mut wtxn, &h)
                    .map_err(|e| CoreError::IndexWriteError(e.to_string()))?;
            }
        }

        wtxn.commit()
            .map_err(|e| CoreError::IndexWriteError(e.to_string()))?;

        // Reorgs are rare; dropping the whole cache is cheaper than tracking
        // which heights survived.
        self.cache.lock().unwrap().clear();
        Ok(())
    }

    pub fn max_indexed_height(&self) -> CoreResult<Option<u64>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| CoreError::IndexWriteError(e.to_string()))?;
        Ok(self
            .locations
            .last(&rtxn)
            .map_err(|e| CoreError::IndexWriteError(e.to_string()))?
            .map(|(h, _)| h))
    }

    pub fn entry_count(&self) -> CoreResult<u64> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| CoreError::IndexWriteError(e.to_string()))?;
        self.locations
            .len(&rtxn)
            .map_err(|e| CoreError::IndexWriteError(e.to_string()))
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            entries: self.entry_count().unwrap_or(0),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_size: self.cache.lock().unwrap().len(),
        }
    }

    // -- Block cache. Entries are immutable once inserted; readers share
    //    the Arc and never see a partially built block. --

    pub fn cache_get(&self, height: u64) -> Option<Arc<Block>> {
        let mut cache = self.cache.lock().unwrap();
        match cache.get_mut(&height) {
            Some(block) => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(block))
            }
            None => {
                self.cache_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn cache_put(&self, height: u64, block: Arc<Block>) {
        self.cache.lock().unwrap().insert(height, block);
    }

    pub fn cache_invalidate(&self, height: u64) {
        self.cache.lock().unwrap().remove(&height);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_index(dir: &TempDir) -> BlockIndex {
        BlockIndex::open(&dir.path().join("block_index.db"), 8).unwrap()
    }

    #[test]
    fn index_and_lookup_round_trip() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);

        index
            .index_block(5, &"ab".repeat(32), "blocks/blocks_0.json", 1024, 512)
            .unwrap();

        let entry = index.get_location(5).unwrap().unwrap();
        assert_eq!(entry.file, "blocks/blocks_0.json");
        assert_eq!(entry.offset, 1024);
        assert_eq!(entry.size, 512);
        assert_eq!(index.get_height(&"ab".repeat(32)).unwrap(), Some(5));
        assert_eq!(index.max_indexed_height().unwrap(), Some(5));
    }

    #[test]
    fn missing_entries_are_none() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        assert!(index.get_location(7).unwrap().is_none());
        assert!(index.get_height("feed").unwrap().is_none());
        assert!(index.max_indexed_height().unwrap().is_none());
    }

    #[test]
    fn index_block_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        for _ in 0..3 {
            index
                .index_block(1, &"cd".repeat(32), "blocks/blocks_0.json", 0, 100)
                .unwrap();
        }
        assert_eq!(index.entry_count().unwrap(), 1);
        assert_eq!(
            index.get_location(1).unwrap().unwrap(),
            IndexEntry {
                file: "blocks/blocks_0.json".to_string(),
                offset: 0,
                size: 100
            }
        );
    }

    #[test]
    fn remove_from_deletes_suffix() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        for h in 0..10u64 {
            index
                .index_block(h, &format!("{h:064x}"), "blocks/blocks_0.json", h * 100, 100)
                .unwrap();
        }

        index.remove_from(6).unwrap();

        assert_eq!(index.max_indexed_height().unwrap(), Some(5));
        assert_eq!(index.entry_count().unwrap(), 6);
        assert!(index.get_location(6).unwrap().is_none());
        assert!(index.get_height(&format!("{:064x}", 7u64)).unwrap().is_none());
        assert!(index.get_location(5).unwrap().is_some());
    }

    #[test]
    fn cache_tracks_hits_and_misses() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        let block = Arc::new(Block::genesis(1_717_200_000, 4));

        assert!(index.cache_get(0).is_none());
        index.cache_put(0, Arc::clone(&block));
        let cached = index.cache_get(0).unwrap();
        assert_eq!(cached.hash(), block.hash());

        let stats = index.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_size, 1);
    }

    #[test]
    fn cache_evicts_beyond_capacity() {
        let dir = TempDir::new().unwrap();
        let index = BlockIndex::open(&dir.path().join("block_index.db"), 2).unwrap();
        for h in 0..3u64 {
            index.cache_put(h, Arc::new(Block::genesis(1_717_200_000 + h, 4)));
        }
        assert!(index.stats().cache_size <= 2);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let index = open_index(&dir);
            index
                .index_block(3, &"ee".repeat(32), "blocks/blocks_1.json", 10, 20)
                .unwrap();
        }
        let index = open_index(&dir);
        assert_eq!(index.max_indexed_height().unwrap(), Some(3));
        assert_eq!(index.get_height(&"ee".repeat(32)).unwrap(), Some(3));
    }
}
