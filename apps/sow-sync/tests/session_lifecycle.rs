//! Session Lifecycle Integration Tests
//!
//! Drives a full session over the loopback feed: snapshot accumulation,
//! promotion, live deltas, bounds, resnapshots and close.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::timeout;

use sow_sync::{
    BridgeReceiver, ConsumerView, Direction, Envelope, EnginePhase, Fields, LoopbackTransport,
    SessionError, SessionSettings, SpecError, SubscriptionService, SubscriptionSpec, ViewEvent,
    bridge_channel,
};

const TOPIC: &str = "orders";

fn fields(value: Value) -> Fields {
    value.as_object().cloned().unwrap()
}

fn bid(value: i64) -> Fields {
    fields(json!({ "bid": value }))
}

fn setup() -> (Arc<LoopbackTransport>, SubscriptionService) {
    let feed = Arc::new(LoopbackTransport::new());
    let service = SubscriptionService::new(feed.clone(), SessionSettings::default());
    (feed, service)
}

async fn next(rx: &mut BridgeReceiver) -> ViewEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("bridge closed")
}

async fn snapshot(feed: &LoopbackTransport, rows: &[(&str, i64)]) {
    feed.publish(TOPIC, Envelope::begin()).await;
    for (key, value) in rows {
        feed.publish(TOPIC, Envelope::row(*key, bid(*value))).await;
    }
    feed.publish(TOPIC, Envelope::end()).await;
}

#[tokio::test]
async fn nothing_is_delivered_before_snapshot_end() {
    let (feed, service) = setup();
    let (sink, mut rx) = bridge_channel(16);
    let handle = service
        .open(SubscriptionSpec::new(TOPIC), Arc::new(sink))
        .await
        .unwrap();

    feed.publish(TOPIC, Envelope::begin()).await;
    feed.publish(TOPIC, Envelope::row("A", bid(1))).await;
    feed.publish(TOPIC, Envelope::update("A", bid(2))).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(rx.try_recv().is_none());
    assert_eq!(handle.stats().phase(), EnginePhase::SnapshotAccumulating);

    service.close(handle).await.unwrap();
}

#[tokio::test]
async fn consumer_view_converges_after_deferred_updates() {
    let (feed, service) = setup();
    let (sink, mut rx) = bridge_channel(16);
    let spec = SubscriptionSpec::new(TOPIC).order_by("bid", Direction::Desc);
    let handle = service.open(spec.clone(), Arc::new(sink)).await.unwrap();

    feed.publish(TOPIC, Envelope::begin()).await;
    feed.publish(TOPIC, Envelope::row("A", bid(10))).await;
    feed.publish(TOPIC, Envelope::update("A", bid(50))).await;
    feed.publish(TOPIC, Envelope::row("B", bid(20))).await;
    feed.publish(TOPIC, Envelope::evict("C")).await;
    feed.publish(TOPIC, Envelope::end()).await;

    let mut view = ConsumerView::new(spec.order_by.clone());
    let first = next(&mut rx).await;
    assert_eq!(first.kind(), "snapshot");
    view.apply(first);
    while let Some(event) = rx.try_recv() {
        view.apply(event);
    }
    // Deferred replay may still be in flight.
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Some(event) = rx.try_recv() {
        view.apply(event);
    }

    assert_eq!(view.keys(), vec!["A", "B"]);
    assert_eq!(view.get("A").unwrap().field("bid"), Some(&json!(50)));
    assert_eq!(handle.stats().phase(), EnginePhase::Live);

    service.close(handle).await.unwrap();
}

#[tokio::test]
async fn live_updates_merge_and_evictions_remove() {
    let (feed, service) = setup();
    let (sink, mut rx) = bridge_channel(16);
    let handle = service
        .open(SubscriptionSpec::new(TOPIC), Arc::new(sink))
        .await
        .unwrap();

    snapshot(&feed, &[("A", 1), ("B", 2)]).await;
    let mut view = ConsumerView::new(None);
    view.apply(next(&mut rx).await);

    feed.publish(
        TOPIC,
        Envelope::update("A", fields(json!({ "ask": 3 }))),
    )
    .await;
    let update = next(&mut rx).await;
    assert_eq!(
        update,
        ViewEvent::Update {
            key: "A".to_string(),
            fields: fields(json!({ "ask": 3 })),
        }
    );
    view.apply(update);

    feed.publish(TOPIC, Envelope::evict("B")).await;
    view.apply(next(&mut rx).await);

    let a = view.get("A").unwrap();
    assert_eq!(a.field("bid"), Some(&json!(1)));
    assert_eq!(a.field("ask"), Some(&json!(3)));
    assert!(view.get("B").is_none());

    service.close(handle).await.unwrap();
}

#[tokio::test]
async fn bounded_view_evicts_displaced_rows() {
    let (feed, service) = setup();
    let (sink, mut rx) = bridge_channel(16);
    let spec = SubscriptionSpec::new(TOPIC)
        .order_by("bid", Direction::Desc)
        .top_n(2);
    let handle = service.open(spec.clone(), Arc::new(sink)).await.unwrap();

    snapshot(&feed, &[("A", 10), ("B", 30), ("C", 20)]).await;
    let mut view = ConsumerView::new(spec.order_by.clone());
    view.apply(next(&mut rx).await);
    assert_eq!(view.keys(), vec!["B", "C"]);

    feed.publish(TOPIC, Envelope::update("D", bid(40))).await;
    let mut kinds = Vec::new();
    for _ in 0..2 {
        let event = next(&mut rx).await;
        kinds.push(event.kind());
        view.apply(event);
    }
    kinds.sort_unstable();
    assert_eq!(kinds, vec!["evict", "update"]);
    assert_eq!(view.keys(), vec!["D", "B"]);

    service.close(handle).await.unwrap();
}

#[tokio::test]
async fn resnapshot_replaces_the_view() {
    let (feed, service) = setup();
    let (sink, mut rx) = bridge_channel(16);
    let handle = service
        .open(SubscriptionSpec::new(TOPIC), Arc::new(sink))
        .await
        .unwrap();

    snapshot(&feed, &[("A", 1), ("B", 2)]).await;
    let mut view = ConsumerView::new(None);
    view.apply(next(&mut rx).await);

    snapshot(&feed, &[("C", 3)]).await;
    view.apply(next(&mut rx).await);

    assert_eq!(view.snapshots_seen(), 2);
    assert_eq!(view.keys(), vec!["C"]);

    service.close(handle).await.unwrap();
}

#[tokio::test]
async fn conflation_coalesces_rapid_updates() {
    let (feed, service) = setup();
    let (sink, mut rx) = bridge_channel(16);
    let spec = SubscriptionSpec::new(TOPIC).conflate(Duration::from_millis(100));
    let handle = service.open(spec, Arc::new(sink)).await.unwrap();

    snapshot(&feed, &[("A", 1)]).await;
    next(&mut rx).await;

    for value in 2..=5 {
        feed.publish(TOPIC, Envelope::update("A", bid(value))).await;
    }

    let mut view = ConsumerView::new(None);
    view.apply(ViewEvent::Snapshot { rows: Vec::new() });
    let mut updates = 0;
    while let Ok(Some(event)) = timeout(Duration::from_millis(300), rx.recv()).await {
        updates += 1;
        view.apply(event);
    }

    assert!(updates < 4, "expected coalescing, got {updates} updates");
    assert_eq!(view.get("A").unwrap().field("bid"), Some(&json!(5)));

    service.close(handle).await.unwrap();
}

#[tokio::test]
async fn malformed_envelopes_are_counted_and_skipped() {
    let (feed, service) = setup();
    let (sink, mut rx) = bridge_channel(16);
    let handle = service
        .open(SubscriptionSpec::new(TOPIC), Arc::new(sink))
        .await
        .unwrap();

    let unknown = Envelope {
        phase: "checkpoint".to_string(),
        key: None,
        fields: None,
    };
    feed.publish(TOPIC, unknown).await;
    snapshot(&feed, &[("A", 1)]).await;

    assert_eq!(next(&mut rx).await.kind(), "snapshot");
    let stats = handle.stats().snapshot();
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.view_rows, 1);

    service.close(handle).await.unwrap();
}

#[tokio::test]
async fn close_unsubscribes_and_silences_the_session() {
    let (feed, service) = setup();
    let (sink, mut rx) = bridge_channel(16);
    let handle = service
        .open(SubscriptionSpec::new(TOPIC), Arc::new(sink))
        .await
        .unwrap();
    let id = handle.id().clone();

    service.close(handle).await.unwrap();

    assert!(feed.active_subscriptions().is_empty());
    assert!(!feed.publish_to(&id, Envelope::begin()).await);
    assert_eq!(feed.publish(TOPIC, Envelope::begin()).await, 0);
    assert_eq!(timeout(Duration::from_millis(200), rx.recv()).await.unwrap(), None);
}

#[tokio::test]
async fn lost_feed_ends_the_session() {
    let (feed, service) = setup();
    let (sink, _rx) = bridge_channel(16);
    let handle = service
        .open(SubscriptionSpec::new(TOPIC), Arc::new(sink))
        .await
        .unwrap();

    feed.disconnect();

    timeout(Duration::from_secs(1), async {
        while !handle.is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(handle.stats().phase(), EnginePhase::Closed);
}

#[tokio::test]
async fn invalid_spec_is_rejected_without_subscribing() {
    let (feed, service) = setup();
    let (sink, _rx) = bridge_channel(16);

    let result = service
        .open(SubscriptionSpec::new(TOPIC).top_n(0), Arc::new(sink))
        .await;

    assert!(matches!(result, Err(SessionError::Spec(SpecError::ZeroTopN))));
    assert!(feed.calls().is_empty());
}

#[tokio::test]
async fn update_swaps_the_subscription() {
    let (feed, service) = setup();
    let (sink, mut rx) = bridge_channel(16);
    let sink = Arc::new(sink);
    let first = service
        .open(SubscriptionSpec::new("old"), sink.clone())
        .await
        .unwrap();
    let old_id = first.id().clone();

    let second = service
        .update(first, SubscriptionSpec::new(TOPIC), sink)
        .await
        .unwrap();

    assert_ne!(second.id(), &old_id);
    assert_eq!(feed.publish("old", Envelope::begin()).await, 0);
    snapshot(&feed, &[("A", 1)]).await;
    assert_eq!(next(&mut rx).await.kind(), "snapshot");

    service.close(second).await.unwrap();
}
