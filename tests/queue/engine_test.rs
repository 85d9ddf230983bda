//! Tests for the Redis queue engine.
//!
//! These need a live Redis at `localhost:6379` (database 9 is used as
//! scratch space), so they are ignored by default; run them with
//! `cargo test -- --ignored`.

use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use postrider::queue::{Pop, RedisQueue, WorkQueue, WorkerToken};
use postrider::types::MsgPriority;

const REDIS_URL: &str = "redis://localhost:6379/9";

/// Build an engine on a unique queue name so tests never share state.
async fn setup_queue() -> RedisQueue {
    let name = format!("msgs-{}", Uuid::new_v4().simple());
    RedisQueue::connect(REDIS_URL, &name)
        .await
        .expect("redis should be reachable")
}

async fn raw_connection() -> redis::aio::MultiplexedConnection {
    redis::Client::open(REDIS_URL)
        .expect("valid redis url")
        .get_multiplexed_async_connection()
        .await
        .expect("redis should be reachable")
}

async fn zcard(key: &str) -> i64 {
    let mut conn = raw_connection().await;
    redis::cmd("ZCARD")
        .arg(key)
        .query_async::<_, i64>(&mut conn)
        .await
        .expect("zcard should succeed")
}

/// Sleep until just after the next second boundary so a whole rate
/// window fits before the following one.
async fn align_to_second_boundary() {
    let into_second = Utc::now().timestamp_millis().rem_euclid(1000) as u64;
    tokio::time::sleep(Duration::from_millis(2000 - into_second + 20)).await;
}

/// Pop, skipping Retry results, until an item or Empty arrives.
async fn pop_skipping_retries(queue: &RedisQueue) -> Pop {
    loop {
        match queue.pop().await.expect("pop should succeed") {
            Pop::Retry => continue,
            other => return other,
        }
    }
}

#[tokio::test]
#[ignore = "requires redis at localhost:6379"]
async fn fifo_within_tier_and_rate_ceiling() {
    let queue = setup_queue().await;
    let rate = 10;

    for i in 0..20 {
        queue
            .push("chan1", rate, &format!("msg:{i}"), MsgPriority::Bulk)
            .await
            .expect("push should succeed");
    }

    align_to_second_boundary().await;

    // Exactly the rate limit comes off, in push order.
    for i in 0..10 {
        match queue.pop().await.expect("pop should succeed") {
            Pop::Item { token, payload } => {
                assert_eq!(payload, format!("msg:{i}"));
                assert_eq!(token.rate(), Some(rate));
            }
            other => panic!("expected item {i}, got {other:?}"),
        }
    }

    // The 11th attempt hits the window and the destination throttles.
    match queue.pop().await.expect("pop should succeed") {
        Pop::Retry | Pop::Empty => {}
        Pop::Item { payload, .. } => panic!("should be throttled, got {payload}"),
    }
    assert_eq!(zcard(&format!("{}:throttled", queue.name())).await, 1);
    assert_eq!(zcard(&format!("{}:active", queue.name())).await, 0);

    // Pushing more work does not resurrect a throttled destination.
    queue
        .push("chan1", rate, "msg:30", MsgPriority::Bulk)
        .await
        .expect("push should succeed");
    assert_eq!(zcard(&format!("{}:throttled", queue.name())).await, 1);
    assert_eq!(zcard(&format!("{}:active", queue.name())).await, 0);

    // Once the window rolls over and the dethrottler runs, service resumes.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    queue.dethrottle().await.expect("dethrottle should succeed");
    for i in 10..20 {
        match pop_skipping_retries(&queue).await {
            Pop::Item { payload, .. } => assert_eq!(payload, format!("msg:{i}")),
            other => panic!("expected item {i}, got {other:?}"),
        }
    }
}

#[tokio::test]
#[ignore = "requires redis at localhost:6379"]
async fn default_priority_preempts_bulk_at_pop_time() {
    let queue = setup_queue().await;

    queue
        .push("chan1", 10, "bulk:0", MsgPriority::Bulk)
        .await
        .expect("push should succeed");
    queue
        .push("chan1", 10, "bulk:1", MsgPriority::Bulk)
        .await
        .expect("push should succeed");
    queue
        .push("chan1", 10, "default:0", MsgPriority::Default)
        .await
        .expect("push should succeed");

    align_to_second_boundary().await;

    let order: Vec<String> = {
        let mut seen = Vec::new();
        for _ in 0..3 {
            match pop_skipping_retries(&queue).await {
                Pop::Item { payload, .. } => seen.push(payload),
                other => panic!("expected item, got {other:?}"),
            }
        }
        seen
    };
    assert_eq!(order, vec!["default:0", "bulk:0", "bulk:1"]);
}

#[tokio::test]
#[ignore = "requires redis at localhost:6379"]
async fn compound_payload_splits_one_part_per_pop() {
    let queue = setup_queue().await;

    queue
        .push(
            "chan1",
            10,
            r#"[{"id":"msg:32"},{"id":"msg:33"}]"#,
            MsgPriority::Default,
        )
        .await
        .expect("push should succeed");

    align_to_second_boundary().await;

    match queue.pop().await.expect("pop should succeed") {
        Pop::Item { token, payload } => {
            assert_eq!(payload, r#"{"id":"msg:32"}"#);
            assert_eq!(token, WorkerToken::new(queue.name(), "chan1", 10));
        }
        other => panic!("expected first part, got {other:?}"),
    }

    match pop_skipping_retries(&queue).await {
        Pop::Item { payload, .. } => assert_eq!(payload, r#"{"id":"msg:33"}"#),
        other => panic!("expected second part, got {other:?}"),
    }

    match pop_skipping_retries(&queue).await {
        Pop::Empty => {}
        other => panic!("expected empty queue, got {other:?}"),
    }
}

#[tokio::test]
#[ignore = "requires redis at localhost:6379"]
async fn bulk_pushed_before_default_still_loses() {
    let queue = setup_queue().await;
    let rate = 10;

    // Fill a window with bulk, throttle, then race a late default push.
    for i in 0..12 {
        queue
            .push("chan1", rate, &format!("msg:{i}"), MsgPriority::Bulk)
            .await
            .expect("push should succeed");
    }

    align_to_second_boundary().await;

    for i in 0..10 {
        match queue.pop().await.expect("pop should succeed") {
            Pop::Item { payload, .. } => assert_eq!(payload, format!("msg:{i}")),
            other => panic!("expected item {i}, got {other:?}"),
        }
    }

    tokio::time::sleep(Duration::from_millis(1100)).await;
    queue
        .push("chan1", rate, "late-default", MsgPriority::Default)
        .await
        .expect("push should succeed");
    queue.dethrottle().await.expect("dethrottle should succeed");

    match pop_skipping_retries(&queue).await {
        Pop::Item { payload, .. } => assert_eq!(payload, "late-default"),
        other => panic!("expected the default item first, got {other:?}"),
    }
}

#[tokio::test]
#[ignore = "requires redis at localhost:6379"]
async fn unlimited_rate_never_throttles() {
    let queue = setup_queue().await;

    for i in 0..20 {
        queue
            .push("chan1", 0, &format!("msg:{i}"), MsgPriority::Default)
            .await
            .expect("push should succeed");
    }
    for i in 0..20 {
        match queue.pop().await.expect("pop should succeed") {
            Pop::Item { token, payload } => {
                assert_eq!(payload, format!("msg:{i}"));
                queue.complete(&token).await.expect("complete should succeed");
            }
            other => panic!("expected item {i}, got {other:?}"),
        }
    }
    assert_eq!(queue.pop().await.expect("pop should succeed"), Pop::Empty);
}

#[tokio::test]
#[ignore = "requires redis at localhost:6379"]
async fn empty_queue_reports_empty() {
    let queue = setup_queue().await;
    assert_eq!(queue.pop().await.expect("pop should succeed"), Pop::Empty);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires redis at localhost:6379"]
async fn concurrent_pops_hand_off_at_most_once() {
    let queue = std::sync::Arc::new(setup_queue().await);

    queue
        .push("chan1", 1, "the-one-payload", MsgPriority::Default)
        .await
        .expect("push should succeed");

    align_to_second_boundary().await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let queue = std::sync::Arc::clone(&queue);
        handles.push(tokio::spawn(async move {
            queue.pop().await.expect("pop should succeed")
        }));
    }

    let mut delivered = Vec::new();
    for handle in handles {
        if let Pop::Item { payload, .. } = handle.await.expect("task should join") {
            delivered.push(payload);
        }
    }
    assert_eq!(delivered, vec!["the-one-payload"]);
}
