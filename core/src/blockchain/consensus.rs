//! Consensus rules: difficulty retargeting, median-time-past, cumulative
//! work. The proof-of-work rule itself lives on `BlockHeader` (leading
//! zero bits of the canonical header hash).

use num_bigint::BigUint;

use crate::blockchain::block::Block;

/// Number of trailing blocks whose timestamp median bounds a new block.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Maximum seconds a block timestamp may sit ahead of wall clock.
pub const MAX_FUTURE_DRIFT: u64 = 7_200;

/// Bounds on a single retarget step.
pub const MAX_ADJUSTMENT_UP: f64 = 4.0;
pub const MAX_ADJUSTMENT_DOWN: f64 = 0.25;

/// Difficulty floor and ceiling, in leading zero bits.
pub const MIN_DIFFICULTY: u32 = 1;
pub const MAX_DIFFICULTY: u32 = 240;

/// Median of the last [`MEDIAN_TIME_SPAN`] block timestamps. A new block
/// must be strictly later than this. With fewer blocks the median is taken
/// over what exists.
pub fn median_time_past(chain: &[Block]) -> u64 {
    if chain.is_empty() {
        return 0;
    }
    let take = chain.len().min(MEDIAN_TIME_SPAN);
    let mut stamps: Vec<u64> = chain[chain.len() - take..]
        .iter()
        .map(|b| b.header.timestamp)
        .collect();
    stamps.sort_unstable();
    stamps[stamps.len() / 2]
}

/// Retarget: every `interval` blocks, scale difficulty by the ratio of
/// target span to observed span, clamped to [0.25, 4.0]. Between retarget
/// heights the difficulty carries over unchanged.
pub fn next_difficulty(
    chain: &[Block],
    current_difficulty: u32,
    interval: u64,
    target_block_time: u64,
) -> u32 {
    let tip_height = match chain.last() {
        Some(b) => b.header.index,
        None => return current_difficulty,
    };
    if interval == 0 || tip_height == 0 || tip_height % interval != 0 {
        return current_difficulty;
    }

    let window_start = chain.len().saturating_sub(interval as usize + 1);
    let first = &chain[window_start];
    let last = chain.last().expect("non-empty chain");
    let span_blocks = (last.header.index - first.header.index).max(1);

    let actual_span = last
        .header
        .timestamp
        .saturating_sub(first.header.timestamp)
        .max(1);
    let target_span = span_blocks * target_block_time;

    let ratio = (target_span as f64 / actual_span as f64)
        .clamp(MAX_ADJUSTMENT_DOWN, MAX_ADJUSTMENT_UP);

    let adjusted = (current_difficulty as f64 * ratio).round() as u32;
    adjusted.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY)
}

/// Cumulative work of a chain segment: sum of 2^difficulty per block.
pub fn cumulative_work(blocks: &[Block]) -> BigUint {
    blocks
        .iter()
        .fold(BigUint::from(0u8), |acc, b| acc + b.header.work())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::{BlockHeader, ZERO_HASH};

    fn block_at(index: u64, timestamp: u64, difficulty: u32) -> Block {
        Block::new(
            BlockHeader {
                version: 1,
                index,
                previous_hash: ZERO_HASH.to_string(),
                merkle_root: ZERO_HASH.to_string(),
                timestamp,
                difficulty,
                nonce: 0,
                miner_pubkey: String::new(),
                signature: None,
            },
            vec![],
            String::new(),
        )
    }

    fn chain_with_spacing(len: u64, spacing: u64, difficulty: u32) -> Vec<Block> {
        (0..len)
            .map(|i| block_at(i, 1_000_000 + i * spacing, difficulty))
            .collect()
    }

    #[test]
    fn median_of_eleven() {
        let chain = chain_with_spacing(20, 60, 8);
        // Last 11 timestamps end at index 19; median is the 6th of them.
        let expected = chain[14].header.timestamp;
        assert_eq!(median_time_past(&chain), expected);
    }

    #[test]
    fn median_with_short_chain() {
        let chain = chain_with_spacing(3, 60, 8);
        assert_eq!(median_time_past(&chain), chain[1].header.timestamp);
    }

    #[test]
    fn median_empty_chain_is_zero() {
        assert_eq!(median_time_past(&[]), 0);
    }

    #[test]
    fn no_retarget_off_interval() {
        let chain = chain_with_spacing(11, 30, 10);
        // tip height 10, interval 4: 10 % 4 != 0
        assert_eq!(next_difficulty(&chain, 10, 4, 60), 10);
    }

    #[test]
    fn perfect_timing_keeps_difficulty() {
        let chain = chain_with_spacing(11, 60, 10);
        assert_eq!(next_difficulty(&chain, 10, 10, 60), 10);
    }

    #[test]
    fn fast_blocks_raise_difficulty() {
        let chain = chain_with_spacing(11, 30, 10);
        let next = next_difficulty(&chain, 10, 10, 60);
        assert_eq!(next, 20);
    }

    #[test]
    fn slow_blocks_lower_difficulty() {
        let chain = chain_with_spacing(11, 120, 10);
        let next = next_difficulty(&chain, 10, 10, 60);
        assert_eq!(next, 5);
    }

    #[test]
    fn adjustment_clamped_at_4x() {
        // Blocks 100x too fast; the step is still bounded.
        let chain = chain_with_spacing(11, 1, 10);
        let next = next_difficulty(&chain, 10, 10, 60);
        assert_eq!(next, 40);
    }

    #[test]
    fn adjustment_clamped_at_quarter() {
        let chain = chain_with_spacing(11, 100_000, 40);
        let next = next_difficulty(&chain, 40, 10, 60);
        assert_eq!(next, 10);
    }

    #[test]
    fn difficulty_floor_holds() {
        let chain = chain_with_spacing(11, 100_000, 2);
        let next = next_difficulty(&chain, 2, 10, 60);
        assert_eq!(next, MIN_DIFFICULTY);
    }

    #[test]
    fn cumulative_work_sums_powers_of_two() {
        let chain = vec![block_at(0, 0, 3), block_at(1, 60, 4)];
        assert_eq!(cumulative_work(&chain), BigUint::from(8u8 + 16u8));
    }
}
