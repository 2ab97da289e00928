use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::errors::{CoreError, CoreResult};
use crate::tx::{Transaction, TxType};

/// One unspent (or spent-and-retained) transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub address: String,
    pub amount: u64,
    pub spent: bool,
    /// Time-capsule outputs cannot be consumed before this timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_until: Option<u64>,
}

/// Owned copy of the UTXO state plus derived totals. The integrity hash
/// covers every entry in canonical order; `restore` refuses a snapshot
/// whose hash no longer matches its contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtxoSnapshot {
    pub utxo_set: HashMap<String, Vec<Utxo>>,
    pub total_utxos: usize,
    pub total_value: u128,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_hash: Option<String>,
}

/// Address -> output list map. Every balance mutation in the system goes
/// through this component; the chain writer lock serializes callers.
#[derive(Debug, Default)]
pub struct UtxoManager {
    set: HashMap<String, Vec<Utxo>>,
}

fn integrity_hash_of(set: &HashMap<String, Vec<Utxo>>) -> String {
    let mut lines: Vec<String> = Vec::new();
    for (address, utxos) in set {
        for u in utxos {
            lines.push(format!(
                "{}|{}|{}|{}|{}|{}",
                address,
                u.txid,
                u.vout,
                u.amount,
                u.spent,
                u.lock_until.unwrap_or(0)
            ));
        }
    }
    lines.sort_unstable();
    crypto::sha256_hex(lines.join("\n").as_bytes())
}

impl UtxoManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(set: HashMap<String, Vec<Utxo>>) -> Self {
        Self { set }
    }

    /// Rebuild from scratch by applying every confirmed transaction in
    /// chain order. Used by the corruption detector as the ground truth.
    pub fn from_chain(chain: &[crate::blockchain::block::Block]) -> CoreResult<Self> {
        let mut mgr = Self::new();
        for block in chain {
            for tx in &block.transactions {
                mgr.apply_transaction(tx, block.header.timestamp)?;
            }
        }
        Ok(mgr)
    }

    pub fn as_map(&self) -> &HashMap<String, Vec<Utxo>> {
        &self.set
    }

    fn find_input(&self, address: &str, txid: &str, vout: u32) -> Option<&Utxo> {
        self.set
            .get(address)?
            .iter()
            .find(|u| u.txid == txid && u.vout == vout)
    }

    /// Apply a validated transaction. Inputs are checked before anything is
    /// mutated, so a failed apply leaves the set untouched.
    pub fn apply_transaction(&mut self, tx: &Transaction, block_time: u64) -> CoreResult<()> {
        if !tx.is_coinbase() && tx.sender != crate::crypto::keys::GENESIS_SENDER {
            let mut input_sum: u64 = 0;
            for input in &tx.inputs {
                let utxo = self
                    .find_input(&tx.sender, &input.txid, input.vout)
                    .ok_or_else(|| {
                        CoreError::UnknownInput(format!("{}:{}", input.txid, input.vout))
                    })?;
                if utxo.spent {
                    return Err(CoreError::DoubleSpend(format!(
                        "{}:{}",
                        input.txid, input.vout
                    )));
                }
                if let Some(unlock) = utxo.lock_until {
                    if block_time < unlock {
                        return Err(CoreError::InvalidTransaction(format!(
                            "output {}:{} is time-locked until {}",
                            input.txid, input.vout, unlock
                        )));
                    }
                }
                input_sum = input_sum.saturating_add(utxo.amount);
            }

            let output_sum = tx.total_output_amount();
            if input_sum < output_sum.saturating_add(tx.fee) {
                return Err(CoreError::AmountMismatch {
                    inputs: input_sum,
                    outputs: output_sum,
                    fee: tx.fee,
                });
            }

            for input in &tx.inputs {
                let utxos = self
                    .set
                    .get_mut(&tx.sender)
                    .expect("input list verified above");
                if let Some(u) = utxos
                    .iter_mut()
                    .find(|u| u.txid == input.txid && u.vout == input.vout)
                {
                    u.spent = true;
                }
            }
        }

        let lock_until = if tx.tx_type == TxType::TimeCapsule {
            tx.unlock_time()
        } else {
            None
        };
        for (vout, output) in tx.outputs.iter().enumerate() {
            self.set
                .entry(output.address.clone())
                .or_default()
                .push(Utxo {
                    txid: tx.txid.clone(),
                    vout: vout as u32,
                    address: output.address.clone(),
                    amount: output.amount,
                    spent: false,
                    // Recipient outputs are locked; change back to the
                    // sender stays liquid.
                    lock_until: if output.address == tx.sender {
                        None
                    } else {
                        lock_until
                    },
                });
        }

        Ok(())
    }

    /// Inverse of `apply_transaction`, used during reorg: drop the outputs
    /// the transaction created and unmark its inputs.
    pub fn revert_transaction(&mut self, tx: &Transaction) -> CoreResult<()> {
        for output in &tx.outputs {
            if let Some(utxos) = self.set.get_mut(&output.address) {
                utxos.retain(|u| u.txid != tx.txid);
                if utxos.is_empty() {
                    self.set.remove(&output.address);
                }
            }
        }

        if !tx.is_coinbase() && tx.sender != crate::crypto::keys::GENESIS_SENDER {
            for input in &tx.inputs {
                let utxos = self.set.get_mut(&tx.sender).ok_or_else(|| {
                    CoreError::UnknownInput(format!("{}:{}", input.txid, input.vout))
                })?;
                match utxos
                    .iter_mut()
                    .find(|u| u.txid == input.txid && u.vout == input.vout)
                {
                    Some(u) => u.spent = false,
                    None => {
                        return Err(CoreError::UnknownInput(format!(
                            "{}:{}",
                            input.txid, input.vout
                        )))
                    }
                }
            }
        }

        Ok(())
    }

    /// Sum of unspent outputs owned by an address.
    pub fn balance(&self, address: &str) -> u128 {
        self.set
            .get(address)
            .map(|utxos| {
                utxos
                    .iter()
                    .filter(|u| !u.spent)
                    .map(|u| u.amount as u128)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Unspent outputs of an address, spendable-first for coin selection.
    pub fn unspent_outputs(&self, address: &str) -> Vec<Utxo> {
        self.set
            .get(address)
            .map(|utxos| utxos.iter().filter(|u| !u.spent).cloned().collect())
            .unwrap_or_default()
    }

    pub fn total_circulating_supply(&self) -> u128 {
        self.set
            .values()
            .flatten()
            .filter(|u| !u.spent)
            .map(|u| u.amount as u128)
            .sum()
    }

    pub fn total_utxos(&self) -> usize {
        self.set.values().map(Vec::len).sum()
    }

    pub fn snapshot(&self) -> UtxoSnapshot {
        UtxoSnapshot {
            utxo_set: self.set.clone(),
            total_utxos: self.total_utxos(),
            total_value: self.total_circulating_supply(),
            integrity_hash: Some(integrity_hash_of(&self.set)),
        }
    }

    /// Atomically replace state from a snapshot, verifying the integrity
    /// hash when present.
    pub fn restore(&mut self, snapshot: UtxoSnapshot) -> CoreResult<()> {
        if let Some(expected) = &snapshot.integrity_hash {
            let actual = integrity_hash_of(&snapshot.utxo_set);
            if &actual != expected {
                return Err(CoreError::CorruptSnapshot(format!(
                    "integrity hash mismatch: expected {expected}, computed {actual}"
                )));
            }
        }
        self.set = snapshot.utxo_set;
        Ok(())
    }
}
