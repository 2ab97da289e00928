use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::crypto::{self, keys};
use crate::tx::Transaction;

/// All-zero hash used as the genesis parent reference.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Note inscribed in the genesis coinbase metadata.
pub const GENESIS_NOTE: &str = "Onyx genesis - a ledger is a promise kept in public";

/// Block header. The header hash is SHA-256 of the canonical header JSON
/// (sorted keys, no whitespace, signature excluded) and must satisfy the
/// leading-zero-bit rule for `difficulty`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub index: u64,
    pub previous_hash: String,
    pub merkle_root: String,
    pub timestamp: u64,
    /// Required leading zero bits of the header hash.
    pub difficulty: u32,
    pub nonce: u64,
    #[serde(default)]
    pub miner_pubkey: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl BlockHeader {
    /// Canonical serialization of the header, signature excluded.
    pub fn canonical_json(&self) -> String {
        let mut body = serde_json::Map::new();
        body.insert("difficulty".into(), json!(self.difficulty));
        body.insert("index".into(), json!(self.index));
        body.insert("merkle_root".into(), json!(self.merkle_root));
        body.insert("miner_pubkey".into(), json!(self.miner_pubkey));
        body.insert("nonce".into(), json!(self.nonce));
        body.insert("previous_hash".into(), json!(self.previous_hash));
        body.insert("timestamp".into(), json!(self.timestamp));
        body.insert("version".into(), json!(self.version));
        Value::Object(body).to_string()
    }

    pub fn calculate_hash(&self) -> String {
        crypto::sha256_hex(self.canonical_json().as_bytes())
    }

    /// Proof-of-work check: at least `difficulty` leading zero bits.
    pub fn meets_difficulty(&self) -> bool {
        let digest = crypto::sha256(self.canonical_json().as_bytes());
        crypto::leading_zero_bits(&digest) >= self.difficulty
    }

    /// Work contributed by one block at this difficulty: 2^difficulty.
    pub fn work(&self) -> BigUint {
        BigUint::from(1u8) << self.difficulty
    }
}

/// Complete block: header plus ordered transactions, first of which must be
/// the coinbase. `miner` is the payout address recorded for explorers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub miner: String,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>, miner: String) -> Self {
        Self { header, transactions, miner }
    }

    pub fn index(&self) -> u64 {
        self.header.index
    }

    pub fn hash(&self) -> String {
        self.header.calculate_hash()
    }

    /// Merkle root over the ordered txid list. Empty set hashes to zero;
    /// an odd node is paired with itself.
    pub fn merkle_root(txs: &[Transaction]) -> String {
        if txs.is_empty() {
            return ZERO_HASH.to_string();
        }
        let mut level: Vec<Vec<u8>> = txs
            .iter()
            .map(|tx| hex::decode(&tx.txid).unwrap_or_else(|_| vec![0u8; 32]))
            .collect();

        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            for pair in level.chunks(2) {
                let mut combined = pair[0].clone();
                if pair.len() > 1 {
                    combined.extend_from_slice(&pair[1]);
                } else {
                    combined.extend_from_slice(&pair[0]);
                }
                next.push(crypto::sha256(&combined).to_vec());
            }
            level = next;
        }
        hex::encode(&level[0])
    }

    /// Deterministic genesis block. Same config, same hash on every node.
    pub fn genesis(genesis_timestamp: u64, difficulty: u32) -> Self {
        let mut coinbase = Transaction::coinbase(keys::GENESIS_SENDER, 0, 0, genesis_timestamp);
        coinbase.sender = keys::GENESIS_SENDER.to_string();
        coinbase.metadata = json!({ "note": GENESIS_NOTE });
        coinbase.txid = coinbase.compute_txid();

        let header = BlockHeader {
            version: 1,
            index: 0,
            previous_hash: ZERO_HASH.to_string(),
            merkle_root: Self::merkle_root(std::slice::from_ref(&coinbase)),
            timestamp: genesis_timestamp,
            difficulty,
            nonce: 0,
            miner_pubkey: String::new(),
            signature: None,
        };

        Self {
            header,
            transactions: vec![coinbase],
            miner: keys::GENESIS_SENDER.to_string(),
        }
    }

    pub fn total_fees(&self) -> u64 {
        self.transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .map(|tx| tx.fee)
            .sum()
    }
}
