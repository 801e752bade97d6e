use anyhow::Result;
use outboxer::{
    async_trait, ClaimStore, Message, MessageId, MessageSink, Relay, RelayBuilder, RelayError,
};
use outboxer_testing::{eventually, InMemoryClaimStore, ScriptedSink};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn fast_relay(store: &Arc<InMemoryClaimStore>, sink: &Arc<ScriptedSink>) -> RelayBuilder {
    Relay::builder(store.clone(), sink.clone())
        .poll_interval(Duration::from_millis(10))
        .resolve_flush_interval(Duration::from_millis(5))
        .shutdown_timeout(WAIT)
}

fn ids(raw: &[&str]) -> Vec<MessageId> {
    raw.iter().map(|id| MessageId::from(*id)).collect()
}

#[tokio::test]
async fn successes_are_deleted_and_failures_unlocked() {
    let store = Arc::new(InMemoryClaimStore::new());
    let sink = Arc::new(ScriptedSink::new());
    for id in ["A", "B", "C"] {
        store.insert_with_id(id, format!("body-{id}"));
    }
    sink.fail_always("B");

    // One claim only, and A and C resolved together once both are in.
    let handle = fast_relay(&store, &sink)
        .poll_interval(Duration::from_secs(3600))
        .resolve_flush_interval(Duration::from_secs(3600))
        .resolve_batch_size(2)
        .build()
        .unwrap()
        .start();

    assert!(sink.wait_for_attempts(3, WAIT).await);
    assert!(eventually(WAIT, || !store.delete_calls().is_empty()).await);

    let stats = handle.shutdown().await.unwrap();

    assert_eq!(store.delete_calls(), vec![ids(&["A", "C"])]);
    assert_eq!(store.unlock_calls(), vec![ids(&["B"])]);
    assert_eq!(stats.deleted, 2);
    assert_eq!(stats.unlocked, 1);
    assert_eq!(stats.in_flight(), 0);

    let next = store.claim_batch().await.unwrap();
    assert_eq!(next, vec![Message::new("B", "body-B")]);
    assert!(!store.contains(&"A".into()));
    assert!(!store.contains(&"C".into()));
}

#[tokio::test]
async fn failed_messages_are_retried_until_the_sink_accepts_them() {
    let store = Arc::new(InMemoryClaimStore::new());
    let sink = Arc::new(ScriptedSink::new());
    let id = store.insert("payload");
    sink.fail_times(id.clone(), 2);

    let handle = fast_relay(&store, &sink).build().unwrap().start();

    assert!(eventually(WAIT, || store.row_count() == 0).await);
    let stats = handle.shutdown().await.unwrap();

    assert_eq!(sink.attempts(&id), 3);
    assert_eq!(sink.delivered_ids(), vec![id.clone()]);
    assert_eq!(store.deleted_ids(), vec![id.clone()]);
    assert_eq!(store.unlocked_ids(), vec![id.clone(), id]);
    assert_eq!(stats.publish_failed, 2);
    assert_eq!(stats.claimed, 3);
}

#[tokio::test]
async fn store_outage_only_skips_the_failing_cycles() {
    let store = Arc::new(InMemoryClaimStore::new());
    let sink = Arc::new(ScriptedSink::new());
    store.fail_next_claims(3);
    let id = store.insert("payload");

    let handle = fast_relay(&store, &sink).build().unwrap().start();

    assert!(eventually(WAIT, || !store.contains(&id)).await);
    assert!(handle.is_running());
    let stats = handle.shutdown().await.unwrap();

    assert_eq!(stats.poll_failures, 3);
    assert_eq!(sink.delivered_ids(), vec![id]);
}

#[tokio::test]
async fn shutdown_drains_claimed_messages_before_closing_adapters() {
    let store = Arc::new(InMemoryClaimStore::new());
    let sink = Arc::new(ScriptedSink::new().with_delay(Duration::from_millis(10)));
    for i in 0..10 {
        store.insert(format!("message-{i}"));
    }

    let handle = fast_relay(&store, &sink)
        .poll_interval(Duration::from_secs(3600))
        .build()
        .unwrap()
        .start();

    // The batch is claimed and queued, but most of it is still unpublished.
    assert!(sink.wait_for_attempts(1, WAIT).await);
    assert!(sink.total_attempts() < 10);
    assert!(!store.is_closed());

    let stats = handle.shutdown().await.unwrap();

    assert_eq!(sink.delivered().len(), 10);
    assert_eq!(store.row_count(), 0);
    assert_eq!(store.deleted_ids().len(), 10);
    assert_eq!(stats.in_flight(), 0);
    assert!(store.is_closed());
    assert!(sink.is_closed());
}

#[tokio::test]
async fn resolve_failures_are_retried() {
    let store = Arc::new(InMemoryClaimStore::new());
    let sink = Arc::new(ScriptedSink::new());
    store.fail_next_deletes(2);
    let id = store.insert("payload");

    let handle = fast_relay(&store, &sink).build().unwrap().start();

    assert!(eventually(WAIT, || !store.contains(&id)).await);
    let stats = handle.shutdown().await.unwrap();

    assert_eq!(stats.resolve_failures, 2);
    assert_eq!(store.deleted_ids(), vec![id.clone()]);
    assert_eq!(sink.attempts(&id), 1);
}

#[tokio::test]
async fn unlock_failures_are_retried_until_the_row_is_released() {
    let store = Arc::new(InMemoryClaimStore::new());
    let sink = Arc::new(ScriptedSink::new());
    store.fail_next_unlocks(2);
    let id = store.insert("payload");
    sink.fail_times(id.clone(), 1);

    let handle = fast_relay(&store, &sink).build().unwrap().start();

    assert!(eventually(WAIT, || !store.contains(&id)).await);
    let stats = handle.shutdown().await.unwrap();

    assert_eq!(stats.resolve_failures, 2);
    assert_eq!(store.unlocked_ids(), vec![id.clone()]);
    assert_eq!(store.deleted_ids(), vec![id.clone()]);
    assert_eq!(sink.delivered_ids(), vec![id.clone()]);
    assert_eq!(sink.attempts(&id), 2);
    assert_eq!(stats.abandoned, 0);
}

#[tokio::test]
async fn broker_outage_keeps_rows_until_the_broker_recovers() {
    let store = Arc::new(InMemoryClaimStore::new());
    let sink = Arc::new(ScriptedSink::new());
    for i in 0..5 {
        store.insert(format!("message-{i}"));
    }
    sink.set_unavailable(true);

    let handle = fast_relay(&store, &sink).build().unwrap().start();

    // Every row has been offered several times and none was lost.
    assert!(sink.wait_for_attempts(15, WAIT).await);
    assert_eq!(store.row_count(), 5);
    assert!(sink.delivered().is_empty());
    assert!(store.delete_calls().is_empty());

    sink.set_unavailable(false);
    assert!(eventually(WAIT, || store.row_count() == 0).await);
    let stats = handle.shutdown().await.unwrap();

    assert_eq!(sink.delivered().len(), 5);
    assert_eq!(stats.deleted, 5);
    assert_eq!(stats.published, 5);
    assert_eq!(stats.unlocked, stats.publish_failed);
    assert_eq!(stats.claimed, stats.deleted + stats.unlocked);
    assert_eq!(store.locked_count(), 0);
}

#[tokio::test]
async fn shutdown_gives_up_after_the_timeout_and_still_closes_adapters() {
    let store = Arc::new(InMemoryClaimStore::new());
    let sink = Arc::new(ScriptedSink::new());
    store.fail_next_deletes(u32::MAX);
    let id = store.insert("payload");

    let handle = fast_relay(&store, &sink)
        .resolve_retry_limit(u32::MAX)
        .shutdown_timeout(Duration::from_millis(100))
        .build()
        .unwrap()
        .start();

    assert!(eventually(WAIT, || handle.stats().resolve_failures > 0).await);
    let err = handle.shutdown().await.unwrap_err();

    assert!(
        matches!(err, RelayError::ShutdownTimedOut(_)),
        "unexpected error: {err}"
    );
    assert_eq!(store.is_locked(&id), Some(true));
    assert!(store.is_closed());
    assert!(sink.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_publish_outcome_is_resolved_exactly_once() {
    let store = Arc::new(InMemoryClaimStore::new());
    let sink = Arc::new(ScriptedSink::new());

    let mut expected_attempts = HashMap::new();
    for i in 0..60 {
        let id = store.insert(format!("message-{i}"));
        let failures = fastrand::u32(0..3);
        if failures > 0 {
            sink.fail_times(id.clone(), failures);
        }
        expected_attempts.insert(id, failures + 1);
    }

    let handle = fast_relay(&store, &sink)
        .resolve_batch_size(fastrand::usize(1..8))
        .build()
        .unwrap()
        .start();

    assert!(eventually(WAIT, || store.row_count() == 0).await);
    handle.shutdown().await.unwrap();

    let deleted = store.deleted_ids();
    let unlocked = store.unlocked_ids();
    assert_eq!(deleted.len() + unlocked.len(), sink.total_attempts());

    for (id, attempts) in expected_attempts {
        assert_eq!(sink.attempts(&id), attempts, "attempts for {id}");
        assert_eq!(deleted.iter().filter(|d| **d == id).count(), 1);
        assert_eq!(
            unlocked.iter().filter(|u| **u == id).count() as u32,
            attempts - 1
        );
    }
}

#[tokio::test]
async fn idle_relay_waits_without_spinning() {
    let store = Arc::new(InMemoryClaimStore::new());
    let sink = Arc::new(ScriptedSink::new());
    store.insert("held elsewhere");
    store.lock_all();

    let handle = fast_relay(&store, &sink)
        .poll_interval(Duration::from_millis(20))
        .build()
        .unwrap()
        .start();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.total_attempts(), 0);
    let polls = store.claim_calls();
    assert!(polls >= 2, "poll stage should keep ticking, saw {polls}");
    assert!(polls <= 20, "poll stage should not spin, saw {polls}");

    let id = store.insert("fresh");
    assert!(eventually(WAIT, || sink.delivered_ids() == vec![id.clone()]).await);

    handle.shutdown().await.unwrap();
    assert_eq!(store.row_count(), 1);
}

#[tokio::test]
async fn full_publish_queue_holds_back_the_poll_stage() {
    let store = Arc::new(InMemoryClaimStore::new());
    let sink = Arc::new(ScriptedSink::new().with_delay(Duration::from_millis(5)));
    for i in 0..20 {
        store.insert(format!("message-{i}"));
    }

    let handle = fast_relay(&store, &sink)
        .poll_interval(Duration::from_millis(1))
        .queue_capacity(1)
        .build()
        .unwrap()
        .start();

    assert!(sink.wait_for_attempts(5, WAIT).await);
    assert_eq!(store.claim_calls(), 1, "poll stage must wait for the hand-off");

    assert!(eventually(WAIT, || store.row_count() == 0).await);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn stale_locks_are_swept_back_into_the_pool() {
    let store = Arc::new(InMemoryClaimStore::new());
    let sink = Arc::new(ScriptedSink::new());
    let orphan = store.insert("claimed by a relay that crashed");
    store.lock_all();
    store.age_locks(Duration::from_secs(600));

    let handle = fast_relay(&store, &sink)
        .stale_lock_after(Duration::from_secs(60))
        .build()
        .unwrap()
        .start();

    assert!(eventually(WAIT, || !store.contains(&orphan)).await);
    let stats = handle.shutdown().await.unwrap();

    assert_eq!(stats.swept, 1);
    assert_eq!(sink.delivered_ids(), vec![orphan]);
}

#[tokio::test]
async fn sweep_is_disabled_by_default() {
    let store = Arc::new(InMemoryClaimStore::new());
    let sink = Arc::new(ScriptedSink::new());
    let orphan = store.insert("claimed by a relay that crashed");
    store.lock_all();
    store.age_locks(Duration::from_secs(600));

    let handle = fast_relay(&store, &sink).build().unwrap().start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = handle.shutdown().await.unwrap();

    assert_eq!(stats.swept, 0);
    assert_eq!(store.is_locked(&orphan), Some(true));
}

struct PanickingSink;

#[async_trait]
impl MessageSink for PanickingSink {
    async fn publish(&self, _message: &Message) -> Result<()> {
        panic!("broker client bug");
    }
}

#[tokio::test]
async fn a_crashed_stage_stops_the_relay_and_is_reported() {
    let store = Arc::new(InMemoryClaimStore::new());
    store.insert("payload");

    let handle = Relay::builder(store.clone(), PanickingSink)
        .poll_interval(Duration::from_millis(10))
        .shutdown_timeout(WAIT)
        .build()
        .unwrap()
        .start();

    tokio::time::timeout(WAIT, handle.stopped())
        .await
        .expect("a panicking stage should trigger shutdown");

    let err = handle.shutdown().await.unwrap_err();
    assert!(
        matches!(err, RelayError::StagePanicked { stage: "publish" }),
        "unexpected error: {err}"
    );
    assert!(store.is_closed());
}
