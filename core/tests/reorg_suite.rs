//! Fork choice and reorganization scenarios across two independent nodes.

use std::time::{SystemTime, UNIX_EPOCH};

use tempfile::TempDir;

use onyx_core::blockchain::CancelToken;
use onyx_core::config::COIN;
use onyx_core::crypto::keys;
use onyx_core::tx::Transaction;
use onyx_core::{BlockDisposition, Blockchain, Config, Event};

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

fn test_config(dir: &TempDir) -> Config {
    Config {
        data_dir: dir.path().to_path_buf(),
        initial_difficulty: 4,
        difficulty_retarget_interval: 1_000,
        min_fee_rate: 1,
        ..Config::default()
    }
}

fn keyed(seed: u8) -> ([u8; 32], String) {
    let secret = [seed; 32];
    let (pk_hex, _) = keys::sign(&secret, b"probe");
    (secret, keys::address_from_public_key_hex(&pk_hex))
}

/// Build two nodes sharing the same prefix: `left` mines `shared` blocks,
/// `right` receives them all.
fn twin_nodes(
    dir_l: &TempDir,
    dir_r: &TempDir,
    shared_miner: &str,
    shared: u64,
) -> (Blockchain, Blockchain) {
    let left = Blockchain::open(test_config(dir_l)).unwrap();
    let right = Blockchain::open(test_config(dir_r)).unwrap();

    for _ in 0..shared {
        let block = left.mine_next(shared_miner, &CancelToken::new()).unwrap();
        assert_eq!(
            right.receive_block(block).unwrap(),
            BlockDisposition::Appended
        );
    }
    assert_eq!(left.tip_hash(), right.tip_hash());
    (left, right)
}

#[test]
fn heavier_chain_wins_with_fork_point_five() {
    let dir_l = TempDir::new().unwrap();
    let dir_r = TempDir::new().unwrap();
    let (alice_key, alice) = keyed(1);
    let (_, right_miner) = keyed(2);
    let (_, bob) = keyed(3);

    // Shared ancestry up to height 5, all rewards to Alice.
    let (left, right) = twin_nodes(&dir_l, &dir_r, &alice, 5);

    // A transfer unique to the left branch, funded by a shared-prefix coin.
    let coin = left.unspent_outputs(&alice)[0].clone();
    let unique_tx = Transaction::transfer(
        &alice_key, &alice, &bob, 10 * COIN, COIN,
        vec![(coin.txid, coin.vout, coin.amount)],
        now(), None,
    );
    let unique_txid = unique_tx.txid.clone();
    left.submit_transaction(unique_tx).unwrap();

    // Left extends to height 8; right extends to height 9.
    for _ in 0..3 {
        left.mine_next(&alice, &CancelToken::new()).unwrap();
    }
    let mut right_blocks = Vec::new();
    for _ in 0..4 {
        right_blocks.push(right.mine_next(&right_miner, &CancelToken::new()).unwrap());
    }
    assert_eq!(left.height(), 8);
    assert_eq!(right.height(), 9);
    assert_eq!(left.get_balance(&bob), 10 * COIN as u128);

    let mut events = left.events().subscribe();
    let old_tip = left.tip_hash();

    // Feed the right branch to the left node. The first three park as
    // side blocks; the fourth tips the cumulative work balance.
    for (i, block) in right_blocks.iter().enumerate() {
        let disposition = left.receive_block(block.clone()).unwrap();
        if i < right_blocks.len() - 1 {
            assert_eq!(disposition, BlockDisposition::Orphaned, "block {i} should park");
        } else {
            assert_eq!(disposition, BlockDisposition::Reorged);
        }
    }

    // The left node now follows the right chain.
    assert_eq!(left.height(), 9);
    assert_eq!(left.tip_hash(), right.tip_hash());
    left.validate_chain().unwrap();

    // chain_reorg{fork_point=5} precedes the new tip's block_added.
    let mut order = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            Event::ChainReorg { fork_point, old_tip: ev_old, new_tip } => {
                assert_eq!(fork_point, 5);
                assert_eq!(ev_old, old_tip);
                assert_eq!(new_tip, right.tip_hash());
                order.push("reorg");
            }
            Event::BlockAdded { hash, .. } if hash == right.tip_hash() => {
                order.push("block_added");
            }
            _ => {}
        }
    }
    assert_eq!(order, vec!["reorg", "block_added"]);

    // The left-only transfer still validates on the new chain and went
    // back to the mempool.
    assert!(left.mempool().contains(&unique_txid));
    assert_eq!(left.get_balance(&bob), 0);

    // Rewards follow the branches: Alice keeps only the shared prefix,
    // the right miner owns the new suffix.
    assert_eq!(left.get_balance(&right_miner), 4 * 50 * COIN as u128);
    assert_eq!(
        left.get_balance(&alice),
        5 * 50 * COIN as u128,
        "left-branch rewards must be reverted"
    );

    // The UTXO state equals a fresh genesis-to-tip application.
    let replayed =
        onyx_core::utxo::UtxoManager::from_chain(&left.chain_snapshot()).unwrap();
    assert_eq!(
        replayed.total_circulating_supply(),
        left.total_circulating_supply()
    );
    let snapshot = left.snapshot_utxo();
    assert_eq!(snapshot.integrity_hash, replayed.snapshot().integrity_hash);
}

#[test]
fn equal_work_does_not_reorg() {
    let dir_l = TempDir::new().unwrap();
    let dir_r = TempDir::new().unwrap();
    let (_, alice) = keyed(1);
    let (_, rival) = keyed(2);

    let (left, right) = twin_nodes(&dir_l, &dir_r, &alice, 3);

    // Both branches extend by one block of equal difficulty.
    left.mine_next(&alice, &CancelToken::new()).unwrap();
    let rival_block = right.mine_next(&rival, &CancelToken::new()).unwrap();

    let tip_before = left.tip_hash();
    assert_eq!(
        left.receive_block(rival_block).unwrap(),
        BlockDisposition::Orphaned
    );
    assert_eq!(left.tip_hash(), tip_before, "equal work must not move the tip");
}

#[test]
fn reorged_state_survives_restart() {
    let dir_l = TempDir::new().unwrap();
    let dir_r = TempDir::new().unwrap();
    let (_, alice) = keyed(1);
    let (_, rival) = keyed(2);

    let config_l = test_config(&dir_l);
    {
        let (left, right) = twin_nodes(&dir_l, &dir_r, &alice, 2);
        left.mine_next(&alice, &CancelToken::new()).unwrap();
        let r1 = right.mine_next(&rival, &CancelToken::new()).unwrap();
        let r2 = right.mine_next(&rival, &CancelToken::new()).unwrap();

        left.receive_block(r1).unwrap();
        assert_eq!(
            left.receive_block(r2).unwrap(),
            BlockDisposition::Reorged
        );
        assert_eq!(left.height(), 4);
        assert_eq!(left.tip_hash(), right.tip_hash());
    }

    // After restart the reorged chain is what loads: the index suffix was
    // rewritten, so replaced heights resolve to the new branch.
    let reloaded = Blockchain::open(config_l).unwrap();
    assert_eq!(reloaded.height(), 4);
    assert_eq!(reloaded.get_balance(&rival), 100 * COIN as u128);
    assert_eq!(reloaded.get_balance(&alice), 100 * COIN as u128);
    reloaded.validate_chain().unwrap();
}

#[test]
fn orphan_chain_connects_in_reverse_arrival_order() {
    let dir_l = TempDir::new().unwrap();
    let dir_r = TempDir::new().unwrap();
    let (_, alice) = keyed(1);

    let left = Blockchain::open(test_config(&dir_l)).unwrap();
    let right = Blockchain::open(test_config(&dir_r)).unwrap();

    let mut blocks = Vec::new();
    for _ in 0..3 {
        blocks.push(right.mine_next(&alice, &CancelToken::new()).unwrap());
    }

    // Deliver newest-first: everything parks until the connector arrives.
    assert_eq!(
        left.receive_block(blocks[2].clone()).unwrap(),
        BlockDisposition::Orphaned
    );
    assert_eq!(
        left.receive_block(blocks[1].clone()).unwrap(),
        BlockDisposition::Orphaned
    );
    assert_eq!(left.height(), 0);

    assert_eq!(
        left.receive_block(blocks[0].clone()).unwrap(),
        BlockDisposition::Appended
    );
    assert_eq!(left.height(), 3);
    assert_eq!(left.tip_hash(), right.tip_hash());
}
