use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::crypto::{self, keys};

/// Sender string carried by coinbase transactions. Like `GENESIS`, exempt
/// from signature verification; blocks enforce position and reward instead.
pub const COINBASE_SENDER: &str = "COINBASE";

/// Closed set of transaction kinds. Validation dispatches on this instead of
/// matching strings; adding a kind is a source-level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Transfer,
    Coinbase,
    Governance,
    TimeCapsule,
    ContractDeploy,
    ContractCall,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::Transfer => "transfer",
            TxType::Coinbase => "coinbase",
            TxType::Governance => "governance",
            TxType::TimeCapsule => "time_capsule",
            TxType::ContractDeploy => "contract_deploy",
            TxType::ContractCall => "contract_call",
        }
    }
}

/// Reference to an unspent output being consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub txid: String,
    pub vout: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Hash of the canonical serialization; empty until computed.
    pub txid: String,
    pub sender: String,
    pub recipient: String,
    /// Primary amount in atomic units (the recipient-facing value).
    pub amount: u64,
    pub fee: u64,
    pub timestamp: u64,
    pub tx_type: TxType,
    /// Optional per-sender monotonic sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    /// Hex encoded 32-byte Ed25519 public key; empty for coinbase.
    #[serde(default)]
    pub public_key: String,
    /// Hex encoded 64-byte Ed25519 signature over the txid digest.
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub inputs: Vec<TxInput>,
    #[serde(default)]
    pub outputs: Vec<TxOutput>,
    /// Opaque bag for type-specific data (unlock_time, contract code, ...).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// Render an atomic amount as a fixed-scale decimal with 8 fractional
/// digits. The canonical serialization uses this form so every
/// implementation hashes identical bytes.
pub fn format_amount(atomic: u64) -> String {
    format!("{}.{:08}", atomic / crate::config::COIN, atomic % crate::config::COIN)
}

impl Transaction {
    /// Canonical serialization: JSON with sorted keys, no whitespace,
    /// amounts as fixed-8 decimals, signature and txid excluded.
    /// serde_json's default map is ordered, so object keys come out sorted.
    pub fn canonical_json(&self) -> String {
        let inputs: Vec<Value> = self
            .inputs
            .iter()
            .map(|i| json!({ "txid": i.txid, "vout": i.vout }))
            .collect();
        let outputs: Vec<Value> = self
            .outputs
            .iter()
            .map(|o| json!({ "address": o.address, "amount": format_amount(o.amount) }))
            .collect();

        let mut body = serde_json::Map::new();
        body.insert("amount".into(), json!(format_amount(self.amount)));
        body.insert("fee".into(), json!(format_amount(self.fee)));
        body.insert("inputs".into(), Value::Array(inputs));
        if !self.metadata.is_null() {
            body.insert("metadata".into(), self.metadata.clone());
        }
        if let Some(n) = self.nonce {
            body.insert("nonce".into(), json!(n));
        }
        body.insert("outputs".into(), Value::Array(outputs));
        body.insert("public_key".into(), json!(self.public_key));
        body.insert("recipient".into(), json!(self.recipient));
        body.insert("sender".into(), json!(self.sender));
        body.insert("timestamp".into(), json!(self.timestamp));
        body.insert("tx_type".into(), json!(self.tx_type.as_str()));

        Value::Object(body).to_string()
    }

    pub fn compute_txid(&self) -> String {
        crypto::sha256_hex(self.canonical_json().as_bytes())
    }

    /// Serialized size in bytes, the denominator of the fee rate.
    pub fn serialized_size(&self) -> usize {
        self.canonical_json().len() + self.signature.len()
    }

    /// Fee rate in atomic units per 1000 bytes of serialized size.
    pub fn fee_rate(&self) -> u64 {
        let size = self.serialized_size().max(1) as u64;
        self.fee.saturating_mul(1000) / size
    }

    pub fn is_coinbase(&self) -> bool {
        self.tx_type == TxType::Coinbase
    }

    /// Senders exempt from signature checks: coinbase and genesis.
    pub fn is_signature_exempt(&self) -> bool {
        self.is_coinbase() || self.sender == keys::GENESIS_SENDER
    }

    /// Sign in place: fixes the txid, then signs its digest.
    pub fn sign(&mut self, secret_key: &[u8; 32]) {
        self.txid = self.compute_txid();
        let digest = crypto::sha256(self.canonical_json().as_bytes());
        let (public_key, signature) = keys::sign(secret_key, &digest);
        self.public_key = public_key;
        self.signature = signature;
    }

    /// Verify the stored txid, the signature over its digest, and that the
    /// claimed sender matches the address derived from the public key.
    pub fn verify_signature(&self) -> bool {
        if self.is_signature_exempt() {
            return true;
        }
        if self.txid != self.compute_txid() {
            return false;
        }
        let digest = crypto::sha256(self.canonical_json().as_bytes());
        let pk_bytes = match hex::decode(&self.public_key) {
            Ok(b) => b,
            Err(_) => return false,
        };
        let sig_bytes = match hex::decode(&self.signature) {
            Ok(b) => b,
            Err(_) => return false,
        };
        if !keys::verify(&pk_bytes, &digest, &sig_bytes) {
            return false;
        }
        keys::address_from_public_key_hex(&self.public_key) == self.sender
    }

    pub fn total_output_amount(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    // -- Metadata accessors for type-specific payloads --

    pub fn unlock_time(&self) -> Option<u64> {
        self.metadata.get("unlock_time").and_then(Value::as_u64)
    }

    pub fn contract_code(&self) -> Option<&str> {
        self.metadata.get("code").and_then(Value::as_str)
    }

    pub fn gas_limit(&self) -> Option<u64> {
        self.metadata.get("gas_limit").and_then(Value::as_u64)
    }

    // -- Constructors --

    /// Coinbase paying `reward` to `miner_address`. No inputs, one output,
    /// no signature. `height` salts the canonical form so two coinbases to
    /// the same miner never collide on txid.
    pub fn coinbase(miner_address: &str, reward: u64, height: u64, timestamp: u64) -> Self {
        let mut tx = Self {
            txid: String::new(),
            sender: COINBASE_SENDER.to_string(),
            recipient: miner_address.to_string(),
            amount: reward,
            fee: 0,
            timestamp,
            tx_type: TxType::Coinbase,
            nonce: Some(height),
            public_key: String::new(),
            signature: String::new(),
            inputs: vec![],
            outputs: vec![TxOutput {
                address: miner_address.to_string(),
                amount: reward,
            }],
            metadata: Value::Null,
        };
        tx.txid = tx.compute_txid();
        tx
    }

    /// Build and sign a transfer spending the given UTXO references.
    /// `inputs` carry their amounts so the change output can be computed;
    /// the difference above `amount + fee` returns to the sender.
    #[allow(clippy::too_many_arguments)]
    pub fn transfer(
        secret_key: &[u8; 32],
        sender: &str,
        recipient: &str,
        amount: u64,
        fee: u64,
        inputs: Vec<(String, u32, u64)>,
        timestamp: u64,
        nonce: Option<u64>,
    ) -> Self {
        let input_total: u64 = inputs.iter().map(|(_, _, a)| a).sum();
        let mut outputs = vec![TxOutput {
            address: recipient.to_string(),
            amount,
        }];
        let change = input_total.saturating_sub(amount.saturating_add(fee));
        if change > 0 {
            outputs.push(TxOutput {
                address: sender.to_string(),
                amount: change,
            });
        }

        let mut tx = Self {
            txid: String::new(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            amount,
            fee,
            timestamp,
            tx_type: TxType::Transfer,
            nonce,
            public_key: String::new(),
            signature: String::new(),
            inputs: inputs
                .into_iter()
                .map(|(txid, vout, _)| TxInput { txid, vout })
                .collect(),
            outputs,
            metadata: Value::Null,
        };
        tx.sign(secret_key);
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_transfer() -> Transaction {
        let secret = [3u8; 32];
        let (pk_hex, _) = keys::sign(&secret, b"probe");
        let sender = keys::address_from_public_key_hex(&pk_hex);
        Transaction::transfer(
            &secret,
            &sender,
            "onyx1recipient",
            30 * crate::config::COIN,
            crate::config::COIN,
            vec![("ab".repeat(32), 0, 50 * crate::config::COIN)],
            1_717_200_100,
            None,
        )
    }

    #[test]
    fn format_amount_fixed_scale() {
        assert_eq!(format_amount(0), "0.00000000");
        assert_eq!(format_amount(1), "0.00000001");
        assert_eq!(format_amount(crate::config::COIN), "1.00000000");
        assert_eq!(format_amount(30 * crate::config::COIN + 5), "30.00000005");
    }

    #[test]
    fn canonical_json_sorted_and_compact() {
        let tx = signed_transfer();
        let canonical = tx.canonical_json();
        assert!(!canonical.contains(' '));
        assert!(!canonical.contains("signature"));
        assert!(!canonical.contains("txid"));
        // "amount" sorts before "fee" sorts before "inputs"
        let a = canonical.find("\"amount\"").unwrap();
        let f = canonical.find("\"fee\"").unwrap();
        let i = canonical.find("\"inputs\"").unwrap();
        assert!(a < f && f < i);
    }

    #[test]
    fn txid_is_stable_under_signature() {
        let mut tx = signed_transfer();
        let before = tx.txid.clone();
        tx.signature = "00".repeat(64);
        assert_eq!(tx.compute_txid(), before);
    }

    #[test]
    fn signed_transfer_verifies() {
        let tx = signed_transfer();
        assert!(tx.verify_signature());
    }

    #[test]
    fn tampered_amount_fails_verification() {
        let mut tx = signed_transfer();
        tx.amount += 1;
        assert!(!tx.verify_signature());
    }

    #[test]
    fn wrong_sender_fails_verification() {
        let mut tx = signed_transfer();
        tx.sender = "onyx1somebodyelse".to_string();
        assert!(!tx.verify_signature());
    }

    #[test]
    fn transfer_includes_change_output() {
        let tx = signed_transfer();
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.outputs[0].amount, 30 * crate::config::COIN);
        assert_eq!(tx.outputs[1].amount, 19 * crate::config::COIN);
        assert_eq!(tx.outputs[1].address, tx.sender);
    }

    #[test]
    fn exact_spend_has_no_change() {
        let secret = [4u8; 32];
        let (pk_hex, _) = keys::sign(&secret, b"probe");
        let sender = keys::address_from_public_key_hex(&pk_hex);
        let tx = Transaction::transfer(
            &secret,
            &sender,
            "onyx1recipient",
            9 * crate::config::COIN,
            crate::config::COIN,
            vec![("cd".repeat(32), 1, 10 * crate::config::COIN)],
            1_717_200_100,
            None,
        );
        assert_eq!(tx.outputs.len(), 1);
    }

    #[test]
    fn coinbase_shape() {
        let cb = Transaction::coinbase("onyx1miner", 50 * crate::config::COIN, 7, 1000);
        assert!(cb.is_coinbase());
        assert!(cb.is_signature_exempt());
        assert!(cb.inputs.is_empty());
        assert_eq!(cb.outputs.len(), 1);
        assert_eq!(cb.txid, cb.compute_txid());
    }

    #[test]
    fn coinbase_txids_differ_by_height() {
        let a = Transaction::coinbase("onyx1miner", 50, 1, 1000);
        let b = Transaction::coinbase("onyx1miner", 50, 2, 1000);
        assert_ne!(a.txid, b.txid);
    }

    #[test]
    fn fee_rate_scales_with_size() {
        let tx = signed_transfer();
        let rate = tx.fee_rate();
        assert!(rate > 0);
        assert_eq!(rate, tx.fee * 1000 / tx.serialized_size() as u64);
    }

    #[test]
    fn tx_type_round_trips_through_serde() {
        for t in [
            TxType::Transfer,
            TxType::Coinbase,
            TxType::Governance,
            TxType::TimeCapsule,
            TxType::ContractDeploy,
            TxType::ContractCall,
        ] {
            let s = serde_json::to_string(&t).unwrap();
            assert_eq!(s.trim_matches('"'), t.as_str());
            let back: TxType = serde_json::from_str(&s).unwrap();
            assert_eq!(back, t);
        }
    }
}
