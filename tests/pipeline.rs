//! End-to-end pipeline scenarios: submission through ordering, validation,
//! consensus, and durable commit on a single-peer ledger.

mod common;

use std::time::Duration;

use tempfile::tempdir;
use tokio::time::timeout;

use common::{balance_of, setup, transfer};
use vellum_chain::errors::ChainError;
use vellum_chain::node::{Node, TxStatus};

const COMMIT_WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn transfer_is_committed_and_balances_move() {
    let dir = tempdir().unwrap();
    let env = setup(dir.path(), 200, 1_000);
    let node = Node::new(env.config).unwrap();
    let handle = node.handle();
    let mut commits = handle.on_commit();
    let worker = tokio::spawn(node.start());

    let tx = transfer(&env.alice, "alice", "bob", 10);
    let hash = handle.submit_transaction(tx).unwrap();

    let block = timeout(COMMIT_WAIT, commits.recv())
        .await
        .expect("commit within the proposal interval")
        .unwrap();
    assert_eq!(block.height, 2);
    assert_eq!(block.transactions.len(), 1);
    assert_eq!(block.transactions[0].hash_hex(), hash);

    assert!(matches!(
        handle.transaction_status(&hash),
        Some(TxStatus::Committed { height: 2 })
    ));
    let alice_assets = handle.account_assets("alice").unwrap();
    let bob_assets = handle.account_assets("bob").unwrap();
    assert_eq!(balance_of(&alice_assets, "coin"), 90);
    assert_eq!(balance_of(&bob_assets, "coin"), 110);

    handle.shutdown();
    let _ = worker.await;
}

#[tokio::test]
async fn forged_signature_is_rejected_statelessly() {
    let dir = tempdir().unwrap();
    let env = setup(dir.path(), 200, 1_000);
    let node = Node::new(env.config).unwrap();
    let handle = node.handle();

    let mut tx = transfer(&env.alice, "alice", "bob", 10);
    tx.payload.created_ms += 1;
    let err = handle.submit_transaction(tx).unwrap_err();
    assert!(matches!(err, ChainError::Crypto(_)));
    // Nothing was enqueued, so no proposal can ever carry it.
    assert_eq!(handle.node_status().unwrap().queue_depth, 0);
}

#[tokio::test]
async fn stateful_failure_drops_only_the_failing_transaction() {
    let dir = tempdir().unwrap();
    let env = setup(dir.path(), 300, 1_000);
    let node = Node::new(env.config).unwrap();
    let handle = node.handle();
    let mut proposals = handle.on_proposal();
    let mut commits = handle.on_commit();
    let worker = tokio::spawn(node.start());

    let first = transfer(&env.alice, "alice", "bob", 50);
    let second = transfer(&env.alice, "alice", "bob", 100);
    let first_hash = handle.submit_transaction(first).unwrap();
    let second_hash = handle.submit_transaction(second).unwrap();

    let proposal = timeout(COMMIT_WAIT, proposals.recv()).await.unwrap().unwrap();
    assert_eq!(proposal.transactions.len(), 2);

    let block = timeout(COMMIT_WAIT, commits.recv()).await.unwrap().unwrap();
    assert_eq!(block.transactions.len(), 1);
    assert_eq!(block.transactions[0].hash_hex(), first_hash);

    assert!(matches!(
        handle.transaction_status(&first_hash),
        Some(TxStatus::Committed { .. })
    ));
    assert!(matches!(
        handle.transaction_status(&second_hash),
        Some(TxStatus::Rejected { .. })
    ));
    let alice_assets = handle.account_assets("alice").unwrap();
    let bob_assets = handle.account_assets("bob").unwrap();
    assert_eq!(balance_of(&alice_assets, "coin"), 50);
    assert_eq!(balance_of(&bob_assets, "coin"), 150);
    assert_eq!(handle.node_status().unwrap().dropped_transactions, 1);

    handle.shutdown();
    let _ = worker.await;
}

#[tokio::test]
async fn queue_overflow_pushes_back() {
    let dir = tempdir().unwrap();
    // High-water at one proposal's worth; the pipeline is not started, so
    // nothing drains the queue underneath the test.
    let env = setup(dir.path(), 60_000, 10);
    let node = Node::new(env.config).unwrap();
    let handle = node.handle();

    for amount in 1..=10 {
        handle
            .submit_transaction(transfer(&env.alice, "alice", "bob", amount))
            .unwrap();
    }
    let err = handle
        .submit_transaction(transfer(&env.alice, "alice", "bob", 11))
        .unwrap_err();
    assert!(matches!(err, ChainError::Backpressure));
    assert_eq!(handle.node_status().unwrap().queue_depth, 10);
}

#[tokio::test]
async fn duplicate_submissions_commit_once() {
    let dir = tempdir().unwrap();
    let env = setup(dir.path(), 200, 1_000);
    let node = Node::new(env.config).unwrap();
    let handle = node.handle();
    let mut commits = handle.on_commit();
    let worker = tokio::spawn(node.start());

    let tx = transfer(&env.alice, "alice", "bob", 10);
    let hash = handle.submit_transaction(tx.clone()).unwrap();
    let duplicate_hash = handle.submit_transaction(tx).unwrap();
    assert_eq!(hash, duplicate_hash);

    let block = timeout(COMMIT_WAIT, commits.recv()).await.unwrap().unwrap();
    assert_eq!(block.transactions.len(), 1);
    let alice_assets = handle.account_assets("alice").unwrap();
    assert_eq!(balance_of(&alice_assets, "coin"), 90);

    handle.shutdown();
    let _ = worker.await;
}

#[tokio::test]
async fn consecutive_batches_commit_in_order() {
    let dir = tempdir().unwrap();
    let env = setup(dir.path(), 150, 1_000);
    let node = Node::new(env.config).unwrap();
    let handle = node.handle();
    let mut commits = handle.on_commit();
    let worker = tokio::spawn(node.start());

    handle
        .submit_transaction(transfer(&env.alice, "alice", "bob", 5))
        .unwrap();
    let first = timeout(COMMIT_WAIT, commits.recv()).await.unwrap().unwrap();
    assert_eq!(first.height, 2);

    handle
        .submit_transaction(transfer(&env.bob, "bob", "alice", 7))
        .unwrap();
    let second = timeout(COMMIT_WAIT, commits.recv()).await.unwrap().unwrap();
    assert_eq!(second.height, 3);
    assert_eq!(second.previous_hash, first.hash);

    let alice_assets = handle.account_assets("alice").unwrap();
    assert_eq!(balance_of(&alice_assets, "coin"), 102);

    handle.shutdown();
    let _ = worker.await;
}
