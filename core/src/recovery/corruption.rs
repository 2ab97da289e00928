use crate::blockchain::block::Block;
use crate::blockchain::chain;
use crate::config::Config;
use crate::errors::CoreResult;
use crate::utxo::UtxoManager;

/// Balance comparison tolerance: one atomic unit (1e-8 ONX).
pub const UTXO_TOLERANCE: u128 = 1;

/// Five-check corruption sweep over a chain snapshot:
/// block hash/PoW integrity, chain continuity, UTXO consistency against a
/// fresh replay, supply-cap validation, and per-transaction signatures.
pub struct CorruptionDetector<'a> {
    config: &'a Config,
}

impl<'a> CorruptionDetector<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn detect(&self, blocks: &[Block], utxo: &UtxoManager) -> CoreResult<Vec<String>> {
        // Hash integrity, continuity, duplicate txids, signatures, supply.
        let mut issues = chain::chain_issues(blocks, utxo, self.config);

        // UTXO consistency: rebuild from the chain and compare balances.
        match UtxoManager::from_chain(blocks) {
            Ok(rebuilt) => {
                let expected = rebuilt.total_circulating_supply();
                let actual = utxo.total_circulating_supply();
                let delta = expected.abs_diff(actual);
                if delta > UTXO_TOLERANCE {
                    issues.push(format!(
                        "utxo set diverges from chain replay: replayed supply {expected}, live supply {actual}"
                    ));
                }

                for (address, utxos) in rebuilt.as_map() {
                    let live = utxo.balance(address);
                    let replayed: u128 = utxos
                        .iter()
                        .filter(|u| !u.spent)
                        .map(|u| u.amount as u128)
                        .sum();
                    if live.abs_diff(replayed) > UTXO_TOLERANCE {
                        issues.push(format!(
                            "balance mismatch for {address}: replayed {replayed}, live {live}"
                        ));
                    }
                }
            }
            Err(e) => issues.push(format!("chain replay failed: {e}")),
        }

        Ok(issues)
    }
}
