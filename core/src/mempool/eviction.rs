use std::collections::HashMap;

use super::pool::MempoolEntry;

/// Pick the eviction victim: lowest fee rate first, ties broken by oldest
/// admission time, then txid for determinism. Returns the victim's txid
/// and fee rate so the caller can compare against a newcomer.
pub fn lowest_fee_rate_entry(entries: &HashMap<String, MempoolEntry>) -> Option<(String, u64)> {
    entries
        .values()
        .min_by(|a, b| {
            a.fee_rate
                .cmp(&b.fee_rate)
                .then(a.added_at.cmp(&b.added_at))
                .then(a.tx.txid.cmp(&b.tx.txid))
        })
        .map(|e| (e.tx.txid.clone(), e.fee_rate))
}
