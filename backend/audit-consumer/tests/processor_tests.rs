//! Partition claim processing against in-memory broker and ledger
mod common;

use audit_consumer::services::consumer::{PartitionClaim, PartitionClaimProcessor};
use audit_consumer::services::ledger::WritePolicy;
use common::{change_event, eventually, message, FakeGroupConsumer, MemoryLedger, TOPIC};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test]
async fn test_writes_follow_arrival_order() {
    let consumer = Arc::new(FakeGroupConsumer::default());
    let ledger = MemoryLedger::new();
    let (_stop_tx, stop_rx) = watch::channel(false);
    let (tx, claim) = PartitionClaim::channel(TOPIC, 0, 1, 16);

    for offset in 0..10 {
        tx.send(message(0, offset, 1, Some(change_event(100 + offset))))
            .await
            .unwrap();
    }
    drop(tx);

    let processor = PartitionClaimProcessor::new(
        Arc::clone(&consumer),
        ledger.writer(WritePolicy::Retry),
        claim,
        stop_rx,
    );
    let summary = processor.run().await;

    assert_eq!(summary.written, 10);
    assert_eq!(summary.last_committed, Some(10));
    assert_eq!(ledger.ids(), (100..110).collect::<Vec<_>>());
    assert_eq!(consumer.committed(0), (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_malformed_message_skipped_and_committed() {
    let consumer = Arc::new(FakeGroupConsumer::default());
    let ledger = MemoryLedger::new();
    let (_stop_tx, stop_rx) = watch::channel(false);
    let (tx, claim) = PartitionClaim::channel(TOPIC, 2, 1, 16);

    let truncated = change_event(1)[..20].to_vec();
    tx.send(message(2, 40, 1, Some(truncated))).await.unwrap();
    tx.send(message(2, 41, 1, Some(change_event(2)))).await.unwrap();
    drop(tx);

    let summary = PartitionClaimProcessor::new(
        Arc::clone(&consumer),
        ledger.writer(WritePolicy::Retry),
        claim,
        stop_rx,
    )
    .run()
    .await;

    assert_eq!(summary.malformed, 1);
    assert_eq!(summary.written, 1);
    assert_eq!(ledger.ids(), vec![2]);
    assert_eq!(consumer.committed(2), vec![41, 42]);
}

#[tokio::test]
async fn test_tombstone_advances_cursor_without_write() {
    let consumer = Arc::new(FakeGroupConsumer::default());
    let ledger = MemoryLedger::new();
    let (_stop_tx, stop_rx) = watch::channel(false);
    let (tx, claim) = PartitionClaim::channel(TOPIC, 0, 1, 16);

    tx.send(message(0, 7, 1, None)).await.unwrap();
    drop(tx);

    let summary = PartitionClaimProcessor::new(
        Arc::clone(&consumer),
        ledger.writer(WritePolicy::Retry),
        claim,
        stop_rx,
    )
    .run()
    .await;

    assert_eq!(summary.tombstones, 1);
    assert_eq!(ledger.len(), 0);
    assert_eq!(consumer.committed(0), vec![8]);
}

#[tokio::test]
async fn test_redelivered_offset_committed_once() {
    let consumer = Arc::new(FakeGroupConsumer::default());
    let ledger = MemoryLedger::new();
    let (_stop_tx, stop_rx) = watch::channel(false);
    let (tx, claim) = PartitionClaim::channel(TOPIC, 0, 1, 16);

    tx.send(message(0, 3, 1, Some(change_event(3)))).await.unwrap();
    tx.send(message(0, 3, 1, Some(change_event(3)))).await.unwrap();
    tx.send(message(0, 2, 1, Some(change_event(2)))).await.unwrap();
    tx.send(message(0, 4, 1, Some(change_event(4)))).await.unwrap();
    drop(tx);

    let summary = PartitionClaimProcessor::new(
        Arc::clone(&consumer),
        ledger.writer(WritePolicy::Retry),
        claim,
        stop_rx,
    )
    .run()
    .await;

    assert_eq!(summary.duplicates, 2);
    assert_eq!(ledger.ids(), vec![3, 4]);
    assert_eq!(consumer.committed(0), vec![4, 5]);
}

#[tokio::test]
async fn test_message_from_other_generation_discarded() {
    let consumer = Arc::new(FakeGroupConsumer::default());
    let ledger = MemoryLedger::new();
    let (_stop_tx, stop_rx) = watch::channel(false);
    let (tx, claim) = PartitionClaim::channel(TOPIC, 0, 2, 16);

    tx.send(message(0, 0, 1, Some(change_event(1)))).await.unwrap();
    tx.send(message(0, 1, 2, Some(change_event(2)))).await.unwrap();
    drop(tx);

    let summary = PartitionClaimProcessor::new(
        Arc::clone(&consumer),
        ledger.writer(WritePolicy::Retry),
        claim,
        stop_rx,
    )
    .run()
    .await;

    assert_eq!(summary.discarded, 1);
    assert_eq!(ledger.ids(), vec![2]);
    assert_eq!(consumer.committed(0), vec![2]);
}

#[tokio::test]
async fn test_retry_policy_appends_once_after_transient_failures() {
    let consumer = Arc::new(FakeGroupConsumer::default());
    let ledger = MemoryLedger::new();
    ledger.fail_next_appends(3);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let (tx, claim) = PartitionClaim::channel(TOPIC, 0, 1, 16);

    tx.send(message(0, 0, 1, Some(change_event(1)))).await.unwrap();
    drop(tx);

    let summary = PartitionClaimProcessor::new(
        Arc::clone(&consumer),
        ledger.writer(WritePolicy::Retry),
        claim,
        stop_rx,
    )
    .run()
    .await;

    assert_eq!(summary.written, 1);
    assert_eq!(ledger.appends_started(), 4);
    assert_eq!(ledger.ids(), vec![1]);
    assert_eq!(consumer.committed(0), vec![1]);
}

#[tokio::test]
async fn test_skip_policy_leaves_failed_offset_uncommitted() {
    let consumer = Arc::new(FakeGroupConsumer::default());
    let ledger = MemoryLedger::new();
    ledger.fail_next_appends(1);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let (tx, claim) = PartitionClaim::channel(TOPIC, 0, 1, 16);

    tx.send(message(0, 0, 1, Some(change_event(1)))).await.unwrap();
    drop(tx);

    let summary = PartitionClaimProcessor::new(
        Arc::clone(&consumer),
        ledger.writer(WritePolicy::Skip),
        claim,
        stop_rx,
    )
    .run()
    .await;

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.last_committed, None);
    assert_eq!(ledger.len(), 0);
    assert!(consumer.committed(0).is_empty());
}

#[tokio::test]
async fn test_stop_mid_write_completes_write_and_commit() {
    let consumer = Arc::new(FakeGroupConsumer::default());
    let ledger = MemoryLedger::new();
    ledger.set_append_delay(Duration::from_millis(200));
    let (stop_tx, stop_rx) = watch::channel(false);
    let (tx, claim) = PartitionClaim::channel(TOPIC, 0, 1, 16);

    tx.send(message(0, 0, 1, Some(change_event(1)))).await.unwrap();
    tx.send(message(0, 1, 1, Some(change_event(2)))).await.unwrap();

    let handle = tokio::spawn(
        PartitionClaimProcessor::new(
            Arc::clone(&consumer),
            ledger.writer(WritePolicy::Retry),
            claim,
            stop_rx,
        )
        .run(),
    );

    let probe = ledger.clone();
    eventually("first append to start", move || probe.appends_started() == 1).await;
    stop_tx.send(true).unwrap();

    let summary = handle.await.unwrap();

    assert_eq!(summary.written, 1);
    assert_eq!(ledger.ids(), vec![1]);
    assert_eq!(consumer.committed(0), vec![1]);
    drop(tx);
}

#[tokio::test]
async fn test_stop_abandons_retry_wait() {
    let consumer = Arc::new(FakeGroupConsumer::default());
    let ledger = MemoryLedger::new();
    ledger.fail_next_appends(u32::MAX);
    let (stop_tx, stop_rx) = watch::channel(false);
    let (tx, claim) = PartitionClaim::channel(TOPIC, 0, 1, 16);

    tx.send(message(0, 0, 1, Some(change_event(1)))).await.unwrap();

    let handle = tokio::spawn(
        PartitionClaimProcessor::new(
            Arc::clone(&consumer),
            ledger.writer(WritePolicy::Retry),
            claim,
            stop_rx,
        )
        .run(),
    );

    let probe = ledger.clone();
    eventually("a few retries", move || probe.appends_started() >= 3).await;
    stop_tx.send(true).unwrap();

    let summary = handle.await.unwrap();

    assert_eq!(summary.written, 0);
    assert_eq!(ledger.len(), 0);
    assert!(consumer.committed(0).is_empty());
    drop(tx);
}
