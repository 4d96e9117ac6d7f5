mod common;

use std::time::Duration;

use common_kafka::RebalanceEvent;
use serde_json::json;
use sink_worker::error::DeliveryError;
use tokio::time::sleep;

use common::{FakeDelivery, MemoryOffsets, Pipeline};

fn reading(offset: i64) -> serde_json::Value {
    json!({"sensor": "t-1", "temperature": 20.5, "seq": offset})
}

#[tokio::test(start_paused = true)]
async fn small_batch_is_flushed_by_the_timeout() {
    let delivery = FakeDelivery::accepting();
    let offsets = std::sync::Arc::new(MemoryOffsets::default());
    let pipeline = Pipeline::start(delivery.clone(), offsets.clone(), 1000);

    for offset in 0..5 {
        pipeline.send(0, offset, reading(offset));
    }
    sleep(Duration::from_millis(500)).await;
    assert!(delivery.delivered().is_empty());

    sleep(Duration::from_millis(1500)).await;
    assert_eq!(delivery.delivered(), vec![(0, vec![0, 1, 2, 3, 4])]);
    assert_eq!(offsets.stored(), vec![(0, 5)]);

    let report = pipeline.stop().await;
    assert!(report.is_clean());
    assert_eq!(report.partitions[&0].records_delivered, 5);
    assert_eq!(report.partitions[&0].last_committed, Some(4));
}

#[tokio::test(start_paused = true)]
async fn transient_failure_is_retried_and_commits_stay_in_order() {
    let delivery = FakeDelivery::scripted(Box::new(|_, attempt| match attempt {
        1 => Err(DeliveryError::transient("connection reset by peer")),
        _ => Ok(()),
    }));
    let offsets = std::sync::Arc::new(MemoryOffsets::default());
    let pipeline = Pipeline::start(delivery.clone(), offsets.clone(), 2);

    for offset in 10..14 {
        pipeline.send(0, offset, reading(offset));
    }
    sleep(Duration::from_secs(2)).await;

    assert_eq!(delivery.attempts(), 3);
    assert_eq!(
        delivery.delivered(),
        vec![(0, vec![10, 11]), (0, vec![12, 13])]
    );
    assert_eq!(offsets.stored(), vec![(0, 12), (0, 14)]);

    let report = pipeline.stop().await;
    assert_eq!(report.partitions[&0].retries, 1);
    assert_eq!(report.partitions[&0].batches_delivered, 2);
}

#[tokio::test(start_paused = true)]
async fn fatal_failure_halts_only_its_partition() {
    let delivery = FakeDelivery::scripted(Box::new(|batch, _| {
        if batch.partition() == 0 {
            Err(DeliveryError::fatal("column \"temperature\" is of type boolean"))
        } else {
            Ok(())
        }
    }));
    let offsets = std::sync::Arc::new(MemoryOffsets::default());
    let pipeline = Pipeline::start(delivery.clone(), offsets.clone(), 1000);

    for offset in 0..2 {
        pipeline.send(0, offset, reading(offset));
    }
    for offset in 0..3 {
        pipeline.send(1, offset, reading(offset));
    }
    sleep(Duration::from_secs(2)).await;

    assert_eq!(delivery.delivered(), vec![(1, vec![0, 1, 2])]);
    assert_eq!(offsets.stored(), vec![(1, 3)]);
    assert_eq!(pipeline.context.committer.committed(0), None);
    assert!(!pipeline.context.liveness.get_status().healthy);

    // Later records of the halted partition are not delivered
    pipeline.send(0, 2, reading(2));
    sleep(Duration::from_secs(2)).await;
    assert_eq!(delivery.delivered(), vec![(1, vec![0, 1, 2])]);

    let report = pipeline.stop().await;
    assert!(!report.is_clean());
    assert_eq!(report.halted, vec![0]);
    assert_eq!(report.partitions[&1].records_delivered, 3);
}

#[tokio::test(start_paused = true)]
async fn undecodable_messages_are_skipped_and_committed() {
    let delivery = FakeDelivery::accepting();
    let offsets = std::sync::Arc::new(MemoryOffsets::default());
    let pipeline = Pipeline::start(delivery.clone(), offsets.clone(), 1000);

    pipeline.send_raw(0, 0, Some(b"not json".to_vec()));
    pipeline.send(0, 1, reading(1));
    pipeline.send_raw(0, 2, None);
    sleep(Duration::from_secs(2)).await;

    assert_eq!(delivery.delivered(), vec![(0, vec![1])]);
    assert_eq!(offsets.stored(), vec![(0, 3)]);

    let report = pipeline.stop().await;
    assert_eq!(report.partitions[&0].records_skipped, 2);
}

#[tokio::test(start_paused = true)]
async fn revoked_partition_drops_its_open_batch() {
    let delivery = FakeDelivery::accepting();
    let offsets = std::sync::Arc::new(MemoryOffsets::default());
    let pipeline = Pipeline::start(delivery.clone(), offsets.clone(), 1000);

    pipeline
        .rebalances
        .send(RebalanceEvent::Assigned(vec![0]))
        .unwrap();
    pipeline.send(0, 0, reading(0));
    pipeline.send(0, 1, reading(1));
    sleep(Duration::from_millis(100)).await;

    pipeline
        .rebalances
        .send(RebalanceEvent::Revoked(vec![0]))
        .unwrap();
    sleep(Duration::from_secs(2)).await;
    assert!(delivery.delivered().is_empty());
    assert!(offsets.stored().is_empty());

    // Reassigned later, the uncommitted records are consumed again
    pipeline
        .rebalances
        .send(RebalanceEvent::Assigned(vec![0]))
        .unwrap();
    pipeline.send(0, 0, reading(0));
    pipeline.send(0, 1, reading(1));
    sleep(Duration::from_secs(2)).await;
    assert_eq!(delivery.delivered(), vec![(0, vec![0, 1])]);
    assert_eq!(offsets.stored(), vec![(0, 2)]);

    let report = pipeline.stop().await;
    assert!(report.is_clean());
    assert_eq!(report.partitions[&0].batches_delivered, 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_does_not_commit_buffered_records() {
    let delivery = FakeDelivery::accepting();
    let offsets = std::sync::Arc::new(MemoryOffsets::default());
    let pipeline = Pipeline::start(delivery.clone(), offsets.clone(), 1000);

    pipeline.send(0, 0, reading(0));
    sleep(Duration::from_millis(200)).await;

    let report = pipeline.stop().await;
    assert!(report.is_clean());
    assert!(delivery.delivered().is_empty());
    assert!(offsets.stored().is_empty());
}
