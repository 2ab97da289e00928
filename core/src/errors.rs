use serde::Serialize;
use thiserror::Error;

/// Stable machine-readable error kinds surfaced on the external interface.
///
/// Every rejected transaction or block maps to exactly one of these; the
/// human-readable message rides alongside in [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidTransaction,
    InvalidBlock,
    DoubleSpend,
    UnknownInput,
    AmountMismatch,
    MerkleMismatch,
    TimestampOutOfRange,
    ProofOfWorkFailed,
    UnknownParent,
    ChainDiscontinuity,
    MempoolFull,
    LowFeeRate,
    SenderBanned,
    SenderCap,
    StorageIo,
    IndexWriteError,
    CorruptSnapshot,
    CorruptedChain,
    CircuitOpen,
    Cancelled,
    EmptyMempoolNotAllowed,
}

impl ErrorKind {
    /// Stable snake_case label, matching the serialized form. Used as the
    /// rejection-reason key in metrics and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidTransaction => "invalid_transaction",
            ErrorKind::InvalidBlock => "invalid_block",
            ErrorKind::DoubleSpend => "double_spend",
            ErrorKind::UnknownInput => "unknown_input",
            ErrorKind::AmountMismatch => "amount_mismatch",
            ErrorKind::MerkleMismatch => "merkle_mismatch",
            ErrorKind::TimestampOutOfRange => "timestamp_out_of_range",
            ErrorKind::ProofOfWorkFailed => "proof_of_work_failed",
            ErrorKind::UnknownParent => "unknown_parent",
            ErrorKind::ChainDiscontinuity => "chain_discontinuity",
            ErrorKind::MempoolFull => "mempool_full",
            ErrorKind::LowFeeRate => "low_fee_rate",
            ErrorKind::SenderBanned => "sender_banned",
            ErrorKind::SenderCap => "sender_cap",
            ErrorKind::StorageIo => "storage_io",
            ErrorKind::IndexWriteError => "index_write_error",
            ErrorKind::CorruptSnapshot => "corrupt_snapshot",
            ErrorKind::CorruptedChain => "corrupted_chain",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::EmptyMempoolNotAllowed => "empty_mempool_not_allowed",
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("double spend: input {0} already spent")]
    DoubleSpend(String),

    #[error("unknown input: {0}")]
    UnknownInput(String),

    #[error("amount mismatch: inputs {inputs} < outputs {outputs} + fee {fee}")]
    AmountMismatch { inputs: u64, outputs: u64, fee: u64 },

    #[error("merkle root mismatch: header {header}, computed {computed}")]
    MerkleMismatch { header: String, computed: String },

    #[error("timestamp out of range: {0}")]
    TimestampOutOfRange(String),

    #[error("proof of work failed: {0}")]
    ProofOfWorkFailed(String),

    #[error("unknown parent block {0}")]
    UnknownParent(String),

    #[error("chain discontinuity at height {0}")]
    ChainDiscontinuity(u64),

    #[error("mempool full")]
    MempoolFull,

    #[error("fee rate {offered} below floor {floor}")]
    LowFeeRate { offered: u64, floor: u64 },

    #[error("sender {0} is banned")]
    SenderBanned(String),

    #[error("sender {0} reached the pending transaction cap")]
    SenderCap(String),

    #[error("storage error: {0}")]
    StorageIo(String),

    #[error("index write error: {0}")]
    IndexWriteError(String),

    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("corrupted chain: {0:?}")]
    CorruptedChain(Vec<String>),

    #[error("circuit breaker open for operation {0}")]
    CircuitOpen(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("mempool is empty and coinbase-only blocks are disabled")]
    EmptyMempoolNotAllowed,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidTransaction(_) => ErrorKind::InvalidTransaction,
            CoreError::InvalidBlock(_) => ErrorKind::InvalidBlock,
            CoreError::DoubleSpend(_) => ErrorKind::DoubleSpend,
            CoreError::UnknownInput(_) => ErrorKind::UnknownInput,
            CoreError::AmountMismatch { .. } => ErrorKind::AmountMismatch,
            CoreError::MerkleMismatch { .. } => ErrorKind::MerkleMismatch,
            CoreError::TimestampOutOfRange(_) => ErrorKind::TimestampOutOfRange,
            CoreError::ProofOfWorkFailed(_) => ErrorKind::ProofOfWorkFailed,
            CoreError::UnknownParent(_) => ErrorKind::UnknownParent,
            CoreError::ChainDiscontinuity(_) => ErrorKind::ChainDiscontinuity,
            CoreError::MempoolFull => ErrorKind::MempoolFull,
            CoreError::LowFeeRate { .. } => ErrorKind::LowFeeRate,
            CoreError::SenderBanned(_) => ErrorKind::SenderBanned,
            CoreError::SenderCap(_) => ErrorKind::SenderCap,
            CoreError::StorageIo(_) => ErrorKind::StorageIo,
            CoreError::IndexWriteError(_) => ErrorKind::IndexWriteError,
            CoreError::CorruptSnapshot(_) => ErrorKind::CorruptSnapshot,
            CoreError::CorruptedChain(_) => ErrorKind::CorruptedChain,
            CoreError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            CoreError::Cancelled => ErrorKind::Cancelled,
            CoreError::EmptyMempoolNotAllowed => ErrorKind::EmptyMempoolNotAllowed,
        }
    }

    /// Structured rejection payload for the external interface.
    /// No stack traces, just `{error_kind, message, details?}`.
    pub fn to_payload(&self) -> serde_json::Value {
        let details = match self {
            CoreError::CorruptedChain(issues) => Some(serde_json::json!({ "issues": issues })),
            CoreError::AmountMismatch { inputs, outputs, fee } => Some(serde_json::json!({
                "inputs": inputs, "outputs": outputs, "fee": fee,
            })),
            CoreError::LowFeeRate { offered, floor } => Some(serde_json::json!({
                "offered": offered, "floor": floor,
            })),
            _ => None,
        };
        let mut payload = serde_json::json!({
            "error_kind": self.kind(),
            "message": self.to_string(),
        });
        if let Some(d) = details {
            payload["details"] = d;
        }
        payload
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::StorageIo(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::StorageIo(format!("serialization: {e}"))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
