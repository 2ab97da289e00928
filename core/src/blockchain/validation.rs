use std::collections::HashSet;

use crate::blockchain::block::Block;
use crate::blockchain::consensus;
use crate::config::Config;
use crate::errors::{CoreError, CoreResult};
use crate::tx::{Transaction, TxType};
use crate::utxo::UtxoManager;

/// How far a transaction timestamp may lag the reference clock.
pub const TX_MAX_AGE_SECS: u64 = 15 * 60;

/// How far a transaction timestamp may lead the reference clock.
pub const TX_MAX_FUTURE_SECS: u64 = 2 * 60;

/// Stateless transaction checks: structure, txid, timestamp window,
/// signature, and type-specific payload rules. UTXO-dependent checks are
/// separate so intra-block chains can be verified by sequential apply.
pub fn validate_transaction_stateless(tx: &Transaction, reference_time: u64) -> CoreResult<()> {
    if tx.is_coinbase() {
        return Err(CoreError::InvalidTransaction(
            "coinbase transactions are built by the producer, not submitted".into(),
        ));
    }
    if tx.sender.is_empty() || tx.recipient.is_empty() {
        return Err(CoreError::InvalidTransaction("missing sender or recipient".into()));
    }
    if tx.outputs.is_empty() {
        return Err(CoreError::InvalidTransaction("transaction has no outputs".into()));
    }
    if tx.inputs.is_empty() && tx.sender != crate::crypto::keys::GENESIS_SENDER {
        return Err(CoreError::InvalidTransaction("transaction has no inputs".into()));
    }
    if tx.fee == 0 && tx.tx_type != TxType::Governance {
        return Err(CoreError::InvalidTransaction(format!(
            "zero fee is only allowed for governance, not {}",
            tx.tx_type.as_str()
        )));
    }

    if tx.txid != tx.compute_txid() {
        return Err(CoreError::InvalidTransaction("txid does not match canonical hash".into()));
    }

    let lower = reference_time.saturating_sub(TX_MAX_AGE_SECS);
    let upper = reference_time + TX_MAX_FUTURE_SECS;
    if tx.timestamp < lower || tx.timestamp > upper {
        return Err(CoreError::TimestampOutOfRange(format!(
            "transaction timestamp {} outside [{lower}, {upper}]",
            tx.timestamp
        )));
    }

    if !tx.verify_signature() {
        return Err(CoreError::InvalidTransaction(format!(
            "invalid signature for tx {}",
            tx.txid
        )));
    }

    match tx.tx_type {
        TxType::TimeCapsule => {
            let unlock = tx.unlock_time().ok_or_else(|| {
                CoreError::InvalidTransaction("time capsule without unlock_time".into())
            })?;
            if unlock <= reference_time {
                return Err(CoreError::InvalidTransaction(format!(
                    "time capsule unlock_time {unlock} is not in the future"
                )));
            }
        }
        TxType::ContractDeploy => {
            let code = tx.contract_code().ok_or_else(|| {
                CoreError::InvalidTransaction("contract deploy without code".into())
            })?;
            if code.is_empty() || hex::decode(code).is_err() {
                return Err(CoreError::InvalidTransaction("contract code is not valid hex".into()));
            }
            match tx.gas_limit() {
                Some(limit) if limit > 0 => {}
                _ => {
                    return Err(CoreError::InvalidTransaction(
                        "contract deploy needs a positive gas_limit".into(),
                    ))
                }
            }
        }
        _ => {}
    }

    Ok(())
}

/// UTXO-dependent checks against the current set: inputs present, unspent,
/// unlocked, and covering `outputs + fee`.
pub fn validate_transaction_inputs(
    tx: &Transaction,
    utxo: &UtxoManager,
    reference_time: u64,
) -> CoreResult<()> {
    if tx.is_coinbase() || tx.sender == crate::crypto::keys::GENESIS_SENDER {
        return Ok(());
    }

    let available = utxo.unspent_outputs(&tx.sender);
    let mut input_sum: u64 = 0;
    for input in &tx.inputs {
        let found = available
            .iter()
            .find(|u| u.txid == input.txid && u.vout == input.vout);
        match found {
            Some(u) => {
                if let Some(unlock) = u.lock_until {
                    if reference_time < unlock {
                        return Err(CoreError::InvalidTransaction(format!(
                            "output {}:{} is time-locked until {unlock}",
                            input.txid, input.vout
                        )));
                    }
                }
                input_sum = input_sum.saturating_add(u.amount);
            }
            None => {
                // A consumed output is no longer spendable material; from
                // the submitter's view it does not exist. Conflicts with
                // still-pending transactions surface as DoubleSpend from
                // the mempool instead.
                return Err(CoreError::UnknownInput(format!(
                    "{}:{}",
                    input.txid, input.vout
                )));
            }
        }
    }

    let output_sum = tx.total_output_amount();
    if input_sum < output_sum.saturating_add(tx.fee) {
        return Err(CoreError::AmountMismatch {
            inputs: input_sum,
            outputs: output_sum,
            fee: tx.fee,
        });
    }

    Ok(())
}

/// Everything `validate_block` needs beyond the block itself.
pub struct BlockContext<'a> {
    pub prev: &'a Block,
    /// Trailing chain slice ending at `prev`, for median-time-past.
    pub recent: &'a [Block],
    pub expected_difficulty: u32,
    pub current_supply: u128,
    /// True when the txid is already confirmed somewhere on the chain.
    pub known_txid: &'a dyn Fn(&str) -> bool,
}

/// Full block validation against the current tip. Returns the observed
/// timestamp drift (now - block timestamp, clamped at zero) for the
/// metrics histogram.
pub fn validate_block(
    block: &Block,
    ctx: &BlockContext<'_>,
    utxo: &UtxoManager,
    config: &Config,
    now: u64,
) -> CoreResult<u64> {
    // 1. Linkage.
    if block.index() != ctx.prev.index() + 1 {
        return Err(CoreError::ChainDiscontinuity(block.index()));
    }
    let prev_hash = ctx.prev.hash();
    if block.header.previous_hash != prev_hash {
        return Err(CoreError::InvalidBlock(format!(
            "previous_hash {} does not match tip {}",
            &block.header.previous_hash[..16.min(block.header.previous_hash.len())],
            &prev_hash[..16]
        )));
    }

    // 2. Timestamp: strictly after median-time-past, not too far ahead of
    //    the wall clock.
    let mtp = consensus::median_time_past(ctx.recent);
    if block.header.timestamp <= mtp {
        return Err(CoreError::TimestampOutOfRange(format!(
            "block timestamp {} not after median time past {mtp}",
            block.header.timestamp
        )));
    }
    if block.header.timestamp > now + consensus::MAX_FUTURE_DRIFT {
        return Err(CoreError::TimestampOutOfRange(format!(
            "block timestamp {} too far in the future (now {now})",
            block.header.timestamp
        )));
    }

    // 3. Declared difficulty and proof of work.
    if block.header.difficulty != ctx.expected_difficulty {
        return Err(CoreError::InvalidBlock(format!(
            "difficulty {} does not match expected {}",
            block.header.difficulty, ctx.expected_difficulty
        )));
    }
    if !block.header.meets_difficulty() {
        return Err(CoreError::ProofOfWorkFailed(format!(
            "hash {} does not have {} leading zero bits",
            block.hash(),
            block.header.difficulty
        )));
    }

    // 4. Merkle binding.
    let computed_root = Block::merkle_root(&block.transactions);
    if block.header.merkle_root != computed_root {
        return Err(CoreError::MerkleMismatch {
            header: block.header.merkle_root.clone(),
            computed: computed_root,
        });
    }

    // 5. Coinbase position and reward.
    let coinbase = block
        .transactions
        .first()
        .ok_or_else(|| CoreError::InvalidBlock("block has no transactions".into()))?;
    if !coinbase.is_coinbase() {
        return Err(CoreError::InvalidBlock("first transaction must be coinbase".into()));
    }
    if !coinbase.inputs.is_empty() || coinbase.outputs.len() != 1 {
        return Err(CoreError::InvalidBlock(
            "coinbase must have no inputs and exactly one output".into(),
        ));
    }
    let fees = block.total_fees();
    let max_reward = config.block_reward.saturating_add(fees);
    let minted = coinbase.outputs[0].amount;
    if minted > max_reward {
        return Err(CoreError::InvalidBlock(format!(
            "coinbase output {minted} exceeds reward + fees {max_reward}"
        )));
    }
    // Fees already circulate in the inputs that pay them; the coinbase
    // only recollects them. Net new issuance is the coinbase minus fees.
    let net_issuance = minted.saturating_sub(fees);
    if ctx.current_supply + net_issuance as u128 > config.max_supply as u128 {
        return Err(CoreError::InvalidBlock(format!(
            "coinbase would exceed max supply {}",
            config.max_supply
        )));
    }

    // 6. Per-transaction rules and txid uniqueness.
    let mut seen: HashSet<&str> = HashSet::new();
    for (i, tx) in block.transactions.iter().enumerate() {
        if !seen.insert(tx.txid.as_str()) {
            return Err(CoreError::InvalidBlock(format!(
                "duplicate txid {} within block",
                tx.txid
            )));
        }
        if (ctx.known_txid)(&tx.txid) {
            return Err(CoreError::InvalidBlock(format!(
                "txid {} already confirmed on chain",
                tx.txid
            )));
        }
        if i == 0 {
            continue;
        }
        if tx.is_coinbase() {
            return Err(CoreError::InvalidBlock("coinbase outside first position".into()));
        }
        validate_transaction_stateless(tx, block.header.timestamp)?;
    }

    // 7. Trial apply on a scratch copy. Sequential application also covers
    //    intra-block dependencies and double-spends.
    let mut trial = UtxoManager::from_map(utxo.as_map().clone());
    for tx in &block.transactions {
        trial
            .apply_transaction(tx, block.header.timestamp)
            .map_err(|e| match e {
                CoreError::DoubleSpend(_) | CoreError::UnknownInput(_) | CoreError::AmountMismatch { .. } => e,
                other => CoreError::InvalidBlock(other.to_string()),
            })?;
    }

    Ok(now.saturating_sub(block.header.timestamp))
}
