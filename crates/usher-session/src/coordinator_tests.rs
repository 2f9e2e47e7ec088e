//! Tests for subscription coordination across the registry, buffer, and
//! consumer.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use serde_json::json;

use usher_core::EventKind;

use crate::consumer::{TurnConsumer, TurnPhase};
use crate::coordinator::SubscriptionRegistry;
use crate::handlers::{EventHandlers, NoopHandlers};
use crate::testing::{FakeTransport, Recorder};

const SESSION: &str = "session-1";

fn registry_over(transport: &Arc<FakeTransport>) -> SubscriptionRegistry {
    SubscriptionRegistry::with_defaults(Arc::clone(transport) as Arc<dyn crate::Transport>)
}

/// Yield until `predicate` holds, or panic after a bounded number of
/// scheduler turns.
async fn wait_until(predicate: impl Fn() -> bool) {
    for _ in 0..1000 {
        if predicate() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached within bounded yields");
}

#[tokio::test]
async fn subscribe_registers_every_catalog_event_once() {
    let transport = FakeTransport::new();
    let registry = registry_over(&transport);

    let guard = registry
        .subscribe(SESSION, Recorder::shared() as Arc<dyn EventHandlers>)
        .await
        .unwrap();

    assert_eq!(transport.total_listeners(), EventKind::ALL.len());
    for kind in EventKind::ALL {
        assert_eq!(transport.listener_count(kind.name()), 1, "{kind}");
    }

    guard.release().await;
}

#[tokio::test]
async fn ref_count_shares_one_registration() {
    let transport = FakeTransport::new();
    let registry = registry_over(&transport);

    let first = registry
        .subscribe(SESSION, Recorder::shared() as Arc<dyn EventHandlers>)
        .await
        .unwrap();
    let second = registry
        .subscribe(SESSION, Recorder::shared() as Arc<dyn EventHandlers>)
        .await
        .unwrap();

    // Two subscribers, still exactly one transport registration.
    assert_eq!(transport.total_listeners(), EventKind::ALL.len());
    let stats = registry.stats().await;
    assert_eq!(stats.session_count, 1);
    assert_eq!(stats.total_subscribers, 2);

    first.release().await;
    assert_eq!(
        transport.total_listeners(),
        EventKind::ALL.len(),
        "transport stays alive while a subscriber remains"
    );

    second.release().await;
    assert_eq!(transport.total_listeners(), 0);
    assert_eq!(registry.stats().await.session_count, 0);

    // A further release on an already-released guard is a no-op.
    second.release().await;
    assert_eq!(registry.stats().await.session_count, 0);
}

#[tokio::test]
async fn double_release_never_underflows() {
    let transport = FakeTransport::new();
    let registry = registry_over(&transport);

    let first = registry
        .subscribe(SESSION, Recorder::shared() as Arc<dyn EventHandlers>)
        .await
        .unwrap();
    let second = registry
        .subscribe(SESSION, Recorder::shared() as Arc<dyn EventHandlers>)
        .await
        .unwrap();

    first.release().await;
    first.release().await;

    // The double release must not have stolen the second subscriber's
    // reference.
    assert_eq!(transport.total_listeners(), EventKind::ALL.len());
    assert_eq!(registry.stats().await.total_subscribers, 1);

    second.release().await;
    assert_eq!(transport.total_listeners(), 0);
}

#[tokio::test]
async fn pre_ready_burst_is_delivered_once_in_order() {
    let transport = FakeTransport::new();
    let registry = Arc::new(registry_over(&transport));
    let recorder = Recorder::shared();

    // Hold one registration open so the combined setup step stays
    // pending while events arrive through the already-landed sinks.
    transport.hold_event(EventKind::Error.name());

    let subscribe = {
        let registry = Arc::clone(&registry);
        let handlers = Arc::clone(&recorder) as Arc<dyn EventHandlers>;
        tokio::spawn(async move { registry.subscribe(SESSION, handlers).await })
    };

    {
        let transport = Arc::clone(&transport);
        wait_until(move || transport.total_listeners() == EventKind::ALL.len() - 1).await;
    }

    let buffer = registry.session_buffer(SESSION).await.unwrap();
    let tracker = crate::RequestTracker::new(buffer);
    let generation = tracker.begin_request();

    transport.emit(
        EventKind::MessageStart.name(),
        &generation,
        json!({"messageId": "m1"}),
    );
    transport.emit(
        EventKind::MessageChunk.name(),
        &generation,
        json!({"text": "Hello"}),
    );
    transport.emit(EventKind::SessionComplete.name(), &generation, json!({}));

    assert!(
        recorder.events().is_empty(),
        "nothing may deliver before setup settles"
    );

    transport.release_holds();
    let guard = subscribe.await.unwrap().unwrap();

    assert_eq!(
        recorder.events(),
        vec!["start:m1", "chunk:Hello", "complete"],
        "buffered events flush exactly once, in arrival order"
    );

    guard.release().await;
}

#[tokio::test]
async fn late_event_after_release_is_dropped() {
    let transport = FakeTransport::new();
    let registry = registry_over(&transport);
    let recorder = Recorder::shared();

    let guard = registry
        .subscribe(SESSION, Arc::clone(&recorder) as Arc<dyn EventHandlers>)
        .await
        .unwrap();
    let tracker = guard.tracker();
    let generation = tracker.begin_request();

    transport.emit(
        EventKind::MessageStart.name(),
        &generation,
        json!({"messageId": "m1"}),
    );
    assert_eq!(recorder.events(), vec!["start:m1"]);

    guard.release().await;

    // A slow backend finishing the old request must not reach the
    // torn-down handler set.
    transport.emit(
        EventKind::MessageChunk.name(),
        &generation,
        json!({"text": "late"}),
    );
    assert_eq!(recorder.events(), vec!["start:m1"]);
}

#[tokio::test]
async fn remount_swaps_handlers_without_a_second_registration() {
    let transport = FakeTransport::new();
    let registry = registry_over(&transport);
    let old_mount = Recorder::shared();
    let new_mount = Recorder::shared();

    let first = registry
        .subscribe(SESSION, Arc::clone(&old_mount) as Arc<dyn EventHandlers>)
        .await
        .unwrap();
    let second = registry
        .subscribe(SESSION, Arc::clone(&new_mount) as Arc<dyn EventHandlers>)
        .await
        .unwrap();
    assert_eq!(transport.total_listeners(), EventKind::ALL.len());

    let tracker = second.tracker();
    let generation = tracker.begin_request();
    transport.emit(
        EventKind::MessageChunk.name(),
        &generation,
        json!({"text": "to the new mount"}),
    );

    assert!(old_mount.events().is_empty(), "old mount must see nothing");
    assert_eq!(new_mount.events(), vec!["chunk:to the new mount"]);

    // The old mount unmounting afterwards must not disturb delivery.
    first.release().await;
    transport.emit(
        EventKind::MessageChunk.name(),
        &generation,
        json!({"text": "still here"}),
    );
    assert_eq!(
        new_mount.events(),
        vec!["chunk:to the new mount", "chunk:still here"]
    );

    second.release().await;
}

#[tokio::test]
async fn failed_registration_rolls_back_completely() {
    let transport = FakeTransport::new();
    transport.fail_event(EventKind::MessageChunk.name());
    let registry = registry_over(&transport);

    let result = registry
        .subscribe(SESSION, Recorder::shared() as Arc<dyn EventHandlers>)
        .await;
    assert!(matches!(result, Err(crate::SessionError::Registration(_))));

    // No partial registration survives and the session entry is gone.
    assert_eq!(transport.total_listeners(), 0);
    let stats = registry.stats().await;
    assert_eq!(stats.session_count, 0);
    assert_eq!(stats.total_subscribers, 0);
}

#[tokio::test]
async fn release_during_pending_setup_defers_teardown() {
    let transport = FakeTransport::new();
    let registry = Arc::new(registry_over(&transport));

    transport.hold_event(EventKind::Error.name());

    let subscribe = {
        let registry = Arc::clone(&registry);
        let handlers = Recorder::shared() as Arc<dyn EventHandlers>;
        tokio::spawn(async move { registry.subscribe(SESSION, handlers).await })
    };

    {
        let transport = Arc::clone(&transport);
        wait_until(move || transport.total_listeners() == EventKind::ALL.len() - 1).await;
    }

    // Cancelling the subscriber mid-setup releases its reference; the
    // teardown must wait for setup to settle rather than leak the five
    // listeners that already landed.
    subscribe.abort();
    let _ = subscribe.await;
    assert_eq!(
        transport.total_listeners(),
        EventKind::ALL.len() - 1,
        "no teardown while setup is still pending"
    );

    transport.release_holds();
    {
        let transport = Arc::clone(&transport);
        wait_until(move || transport.total_listeners() == 0).await;
    }
}

#[tokio::test]
async fn shutdown_is_terminal_and_idempotent() {
    let transport = FakeTransport::new();
    let registry = registry_over(&transport);

    let _session_a = registry
        .subscribe("session-a", Recorder::shared() as Arc<dyn EventHandlers>)
        .await
        .unwrap();
    let _session_b = registry
        .subscribe("session-b", Recorder::shared() as Arc<dyn EventHandlers>)
        .await
        .unwrap();
    assert_eq!(transport.total_listeners(), 2 * EventKind::ALL.len());

    registry.shutdown().await;
    assert_eq!(transport.total_listeners(), 0);
    assert_eq!(registry.stats().await.session_count, 0);

    let rejected = registry
        .subscribe(SESSION, Recorder::shared() as Arc<dyn EventHandlers>)
        .await;
    assert!(matches!(rejected, Err(crate::SessionError::ShutDown)));

    registry.shutdown().await;
}

#[tokio::test]
async fn consumer_drives_a_turn_end_to_end() {
    let transport = FakeTransport::new();
    let registry = registry_over(&transport);

    let guard = registry
        .subscribe(SESSION, Arc::new(NoopHandlers) as Arc<dyn EventHandlers>)
        .await
        .unwrap();
    let consumer = Arc::new(TurnConsumer::new(
        Arc::clone(&transport) as Arc<dyn crate::Transport>,
        guard.tracker(),
    ));
    guard
        .buffer()
        .update_handlers(Arc::clone(&consumer) as Arc<dyn EventHandlers>);

    let generation = consumer.send("summarize my inbox").await.unwrap();
    assert_eq!(consumer.phase(), TurnPhase::Sending);

    transport.emit(
        EventKind::MessageStart.name(),
        &generation,
        json!({"messageId": "m1"}),
    );
    transport.emit(
        EventKind::MessageChunk.name(),
        &generation,
        json!({"text": "Three new"}),
    );
    transport.emit(
        EventKind::MessageChunk.name(),
        &generation,
        json!({"text": " messages."}),
    );
    assert_eq!(consumer.phase(), TurnPhase::Streaming);
    assert_eq!(consumer.transcript(), "Three new messages.");

    transport.emit(
        EventKind::SessionComplete.name(),
        &generation,
        json!({"stopReason": "end_turn"}),
    );
    assert_eq!(consumer.phase(), TurnPhase::Complete);

    guard.release().await;
}

#[tokio::test]
async fn superseded_turn_events_never_corrupt_the_new_turn() {
    let transport = FakeTransport::new();
    let registry = registry_over(&transport);

    let guard = registry
        .subscribe(SESSION, Arc::new(NoopHandlers) as Arc<dyn EventHandlers>)
        .await
        .unwrap();
    let consumer = Arc::new(TurnConsumer::new(
        Arc::clone(&transport) as Arc<dyn crate::Transport>,
        guard.tracker(),
    ));
    guard
        .buffer()
        .update_handlers(Arc::clone(&consumer) as Arc<dyn EventHandlers>);

    let old_generation = consumer.send("first question").await.unwrap();
    let new_generation = consumer.send("second question").await.unwrap();

    // The slow first response arrives after the second request began.
    transport.emit(
        EventKind::MessageChunk.name(),
        &old_generation,
        json!({"text": "stale answer"}),
    );
    assert!(consumer.transcript().is_empty());
    assert_eq!(consumer.phase(), TurnPhase::Sending);

    transport.emit(
        EventKind::MessageChunk.name(),
        &new_generation,
        json!({"text": "fresh answer"}),
    );
    assert_eq!(consumer.transcript(), "fresh answer");

    guard.release().await;
}

#[tokio::test]
async fn remount_preserves_consumer_turn_state() {
    let transport = FakeTransport::new();
    let registry = registry_over(&transport);

    let first_mount = registry
        .subscribe(SESSION, Arc::new(NoopHandlers) as Arc<dyn EventHandlers>)
        .await
        .unwrap();
    let consumer = Arc::new(TurnConsumer::new(
        Arc::clone(&transport) as Arc<dyn crate::Transport>,
        first_mount.tracker(),
    ));
    first_mount
        .buffer()
        .update_handlers(Arc::clone(&consumer) as Arc<dyn EventHandlers>);

    let generation = consumer.send("hello").await.unwrap();
    transport.emit(
        EventKind::MessageChunk.name(),
        &generation,
        json!({"text": "partial"}),
    );
    assert_eq!(consumer.transcript(), "partial");

    // Remount: a new subscriber re-registers the same consumer, then the
    // old mount goes away. Turn state lives in the consumer.
    let second_mount = registry
        .subscribe(SESSION, Arc::clone(&consumer) as Arc<dyn EventHandlers>)
        .await
        .unwrap();
    first_mount.release().await;

    transport.emit(
        EventKind::MessageChunk.name(),
        &generation,
        json!({"text": " answer"}),
    );
    assert_eq!(consumer.transcript(), "partial answer");
    assert_eq!(consumer.phase(), TurnPhase::Streaming);

    second_mount.release().await;
}
