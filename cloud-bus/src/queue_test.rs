// ============================================================================
// FrameQueue Tests
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::FrameQueue;
use crate::frame::Frame;

fn frame(timestamp: i64) -> Frame {
    Frame::new(Bytes::from(vec![timestamp as u8]), timestamp)
}

#[tokio::test]
async fn test_fifo_order_within_capacity() {
    let queue = FrameQueue::new("fifo", 4, false);
    for ts in 1..=3 {
        assert!(queue.enqueue(frame(ts)).await);
    }
    for ts in 1..=3 {
        let got = queue.try_dequeue(Duration::from_millis(50)).await.unwrap();
        assert_eq!(got.timestamp, ts);
    }
}

#[tokio::test]
async fn test_dropping_policy_keeps_the_newest_frame() {
    let queue = FrameQueue::new("drop1", 1, true);
    for ts in 1..=5 {
        assert!(queue.enqueue(frame(ts)).await);
        // At most one frame resident, ever.
        assert!(queue.len() <= 1);
    }
    assert_eq!(queue.dropped(), 4);
    let got = queue.try_dequeue(Duration::from_millis(50)).await.unwrap();
    assert_eq!(got.timestamp, 5);
    assert!(queue.try_dequeue(Duration::from_millis(10)).await.is_none());
}

#[tokio::test]
async fn test_blocking_policy_suspends_the_producer() {
    let queue = Arc::new(FrameQueue::new("block2", 2, false));
    assert!(queue.enqueue(frame(1)).await);
    assert!(queue.enqueue(frame(2)).await);

    let queue_clone = queue.clone();
    let producer = tokio::spawn(async move { queue_clone.enqueue(frame(3)).await });

    // Enqueue #3 on a full capacity-2 queue must not complete on its own.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!producer.is_finished());

    // One dequeue releases it.
    let got = queue.try_dequeue(Duration::from_millis(50)).await.unwrap();
    assert_eq!(got.timestamp, 1);
    assert!(tokio::time::timeout(Duration::from_millis(200), producer)
        .await
        .expect("producer still blocked after dequeue")
        .unwrap());
    assert_eq!(queue.len(), 2);
}

#[tokio::test]
async fn test_close_unblocks_a_waiting_consumer() {
    let queue = Arc::new(FrameQueue::new("close", 1, false));
    let queue_clone = queue.clone();
    let consumer =
        tokio::spawn(async move { queue_clone.try_dequeue(Duration::from_secs(5)).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.close();
    let got = tokio::time::timeout(Duration::from_millis(200), consumer)
        .await
        .expect("consumer still blocked after close")
        .unwrap();
    assert!(got.is_none());
}

#[tokio::test]
async fn test_close_unblocks_a_waiting_producer() {
    let queue = Arc::new(FrameQueue::new("close-prod", 1, false));
    assert!(queue.enqueue(frame(1)).await);
    let queue_clone = queue.clone();
    let producer = tokio::spawn(async move { queue_clone.enqueue(frame(2)).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.close();
    // Producers fail silently on close.
    let accepted = tokio::time::timeout(Duration::from_millis(200), producer)
        .await
        .expect("producer still blocked after close")
        .unwrap();
    assert!(!accepted);
    // Remaining items drain before consumers see None.
    assert!(queue.try_dequeue(Duration::from_millis(10)).await.is_some());
    assert!(queue.try_dequeue(Duration::from_millis(10)).await.is_none());
}

#[tokio::test]
async fn test_enqueue_after_close_is_a_silent_failure() {
    let queue = FrameQueue::new("closed", 2, true);
    queue.close();
    queue.close(); // idempotent
    assert!(!queue.enqueue(frame(1)).await);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_queued_duration_spans_oldest_to_newest() {
    let queue = FrameQueue::new("span", 4, false);
    assert_eq!(queue.queued_duration(), 0);
    queue.enqueue(frame(100)).await;
    assert_eq!(queue.queued_duration(), 0);
    queue.enqueue(frame(250)).await;
    assert_eq!(queue.queued_duration(), 150);
    queue.try_dequeue(Duration::from_millis(10)).await;
    assert_eq!(queue.queued_duration(), 0);
}

/// Sustained backpressure against a stalled consumer: the drop counter
/// grows monotonically and residency never exceeds capacity.
#[tokio::test]
async fn test_dropping_queue_under_sustained_backpressure() {
    let queue = FrameQueue::new("backpressure", 2, true);
    let mut last_dropped = 0;
    let mut ts = 0;
    for _burst in 0..5 {
        for _ in 0..4 {
            ts += 1;
            assert!(queue.enqueue(frame(ts)).await);
            assert!(queue.len() <= 2);
        }
        let dropped = queue.dropped();
        assert!(dropped > last_dropped);
        last_dropped = dropped;
    }
    // 20 enqueued, 2 resident: everything else was shed.
    assert_eq!(queue.dropped(), 18);
}
