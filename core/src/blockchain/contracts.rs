use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::{self, keys};
use crate::errors::{CoreError, CoreResult};
use crate::tx::Transaction;

/// Stored contract: opaque bytecode plus JSON storage. Execution happens in
/// an external runtime; the ledger only accounts for deployment and balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractState {
    pub creator: String,
    /// Hex encoded bytecode, never interpreted here.
    pub code: String,
    #[serde(default)]
    pub storage: Value,
    pub gas_limit: u64,
    pub balance: u64,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractReceipt {
    pub txid: String,
    pub contract_address: String,
    pub status: String,
    pub timestamp: u64,
}

/// Deterministic contract address derived from the deploying txid.
pub fn contract_address(txid: &str) -> String {
    keys::address_from_public_key_bytes(&crypto::sha256(txid.as_bytes()))
}

/// Registry of deployed contracts and their receipts. Owned by the chain,
/// persisted with the atomic state commit.
#[derive(Debug, Default)]
pub struct ContractRegistry {
    contracts: HashMap<String, ContractState>,
    receipts: Vec<ContractReceipt>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(
        contracts: HashMap<String, ContractState>,
        receipts: Vec<ContractReceipt>,
    ) -> Self {
        Self { contracts, receipts }
    }

    pub fn contracts(&self) -> &HashMap<String, ContractState> {
        &self.contracts
    }

    pub fn receipts(&self) -> &[ContractReceipt] {
        &self.receipts
    }

    pub fn get(&self, address: &str) -> Option<&ContractState> {
        self.contracts.get(address)
    }

    /// Register a confirmed `contract_deploy` transaction. The code and gas
    /// limit were already validated at admission.
    pub fn apply_deploy(&mut self, tx: &Transaction, block_time: u64) -> CoreResult<String> {
        let code = tx
            .contract_code()
            .ok_or_else(|| CoreError::InvalidTransaction("contract deploy without code".into()))?;
        let gas_limit = tx
            .gas_limit()
            .ok_or_else(|| CoreError::InvalidTransaction("contract deploy without gas limit".into()))?;

        let address = contract_address(&tx.txid);
        self.contracts.insert(
            address.clone(),
            ContractState {
                creator: tx.sender.clone(),
                code: code.to_string(),
                storage: Value::Object(Default::default()),
                gas_limit,
                balance: tx.amount,
                created_at: block_time,
            },
        );
        self.receipts.push(ContractReceipt {
            txid: tx.txid.clone(),
            contract_address: address.clone(),
            status: "deployed".to_string(),
            timestamp: block_time,
        });
        Ok(address)
    }

    /// Drop a deployment during reorg rollback.
    pub fn revert_deploy(&mut self, tx: &Transaction) {
        let address = contract_address(&tx.txid);
        self.contracts.remove(&address);
        self.receipts.retain(|r| r.txid != tx.txid);
    }
}
