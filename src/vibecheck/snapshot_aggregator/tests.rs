use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::sync::mpsc::error::TryRecvError;

use super::*;
use crate::vibecheck::clock::ManualClock;
use crate::vibecheck::snapshot_source::MemoryDatabase;

const NOW: i64 = 1_700_000_000_000;

fn story(created_at: i64, expires_at: i64) -> Value {
    json!({
        "mediaUrl": format!("https://img.example/{created_at}.jpg"),
        "mediaType": "image",
        "createdAt": created_at,
        "expiresAt": expires_at,
    })
}

fn setup(path: &str, config: AggregatorConfig) -> (Arc<MemoryDatabase>, Arc<ManualClock>, SnapshotAggregator) {
    let db = Arc::new(MemoryDatabase::new());
    let clock = Arc::new(ManualClock::new(NOW));
    let aggregator = SnapshotAggregator::new(path, db.clone(), clock.clone(), config);
    (db, clock, aggregator)
}

fn expect_view(subscription: &mut ViewSubscription<ViewModel>) -> ViewModel {
    match subscription.try_recv() {
        Ok(ViewUpdate::View(view)) => view,
        other => panic!("expected a view, got {:?}", other),
    }
}

#[tokio::test]
async fn test_initial_emission_reflects_current_tree() {
    let (db, _clock, aggregator) = setup("stories", AggregatorConfig::default());
    db.set("stories/u1/s1", story(NOW - 10, NOW + 1000));

    let mut subscription = aggregator.subscribe(Some("u2"), None);

    let view = subscription.recv().await.and_then(ViewUpdate::into_view).unwrap();
    assert_eq!(view.others.len(), 1);
    assert_eq!(view.others[0].owner_id, "u1");
    assert!(view.own.is_none());
}

#[tokio::test]
async fn test_write_produces_new_full_view() {
    let (db, _clock, aggregator) = setup("stories", AggregatorConfig::default());
    let mut subscription = aggregator.subscribe(Some("me"), Some("https://a/me"));
    assert!(expect_view(&mut subscription).is_empty());

    db.set("stories/me/s1", story(NOW - 10, NOW + 1000));
    let view = expect_view(&mut subscription);
    let own = view.own.expect("own bucket");
    assert_eq!(own.avatar_url.as_deref(), Some("https://a/me"));

    db.set("stories/u1/s1", story(NOW - 5, NOW + 1000));
    let view = expect_view(&mut subscription);
    assert!(view.own.is_some());
    assert_eq!(view.others.len(), 1);
}

#[tokio::test]
async fn test_missing_path_emits_empty_view() {
    let (_db, _clock, aggregator) = setup("stories", AggregatorConfig::default());

    let mut subscription = aggregator.subscribe(Some("me"), None);

    assert_eq!(expect_view(&mut subscription), ViewModel::empty());
}

#[tokio::test]
async fn test_no_viewer_emits_empty_and_never_listens() {
    let (db, _clock, aggregator) = setup("stories", AggregatorConfig::default());
    db.set("stories/u1/s1", story(NOW - 10, NOW + 1000));

    let mut subscription = aggregator.subscribe(None, None);

    assert_eq!(expect_view(&mut subscription), ViewModel::empty());
    assert_eq!(db.listener_count("stories"), 0);
    assert!(!aggregator.is_attached());

    db.set("stories/u2/s1", story(NOW - 5, NOW + 1000));
    assert!(subscription.try_recv().is_err());
}

#[tokio::test]
async fn test_cancel_stops_emissions() {
    let (db, _clock, aggregator) = setup("stories", AggregatorConfig::default());
    let mut subscription = aggregator.subscribe(Some("me"), None);
    expect_view(&mut subscription);

    subscription.cancel();
    db.set("stories/u1/s1", story(NOW - 10, NOW + 1000));

    assert_eq!(subscription.try_recv(), Err(TryRecvError::Disconnected));
    assert_eq!(db.listener_count("stories"), 0);
    assert_eq!(aggregator.subscriber_count(), 0);
}

#[tokio::test]
async fn test_cancel_twice_is_noop() {
    let (db, _clock, aggregator) = setup("stories", AggregatorConfig::default());
    let subscription = aggregator.subscribe(Some("me"), None);
    let handle = subscription.cancel_handle();

    handle.cancel();
    handle.cancel();
    subscription.cancel();

    assert!(subscription.is_cancelled());
    assert_eq!(db.listener_count("stories"), 0);
}

#[tokio::test]
async fn test_source_error_passes_through_and_stream_survives() {
    let (db, _clock, aggregator) = setup("stories", AggregatorConfig::default());
    let mut subscription = aggregator.subscribe(Some("me"), None);
    expect_view(&mut subscription);

    db.fail(
        "stories",
        SourceError::PermissionDenied {
            path: "stories".to_string(),
        },
    );
    assert_eq!(
        subscription.try_recv(),
        Ok(ViewUpdate::SourceError(SourceError::PermissionDenied {
            path: "stories".to_string(),
        }))
    );

    db.set("stories/u1/s1", story(NOW - 10, NOW + 1000));
    assert_eq!(expect_view(&mut subscription).others.len(), 1);
}

#[tokio::test]
async fn test_two_viewers_share_one_listener() {
    let (db, _clock, aggregator) = setup("stories", AggregatorConfig::default());
    db.set("stories/u1/s1", story(NOW - 10, NOW + 1000));

    let mut first = aggregator.subscribe(Some("u1"), None);
    let mut second = aggregator.subscribe(Some("u2"), None);
    assert_eq!(db.listener_count("stories"), 1);

    let first_view = expect_view(&mut first);
    let second_view = expect_view(&mut second);
    assert!(first_view.own.is_some() && first_view.others.is_empty());
    assert!(second_view.own.is_none() && second_view.others.len() == 1);

    first.cancel();
    assert_eq!(db.listener_count("stories"), 1);
    db.set("stories/u3/s1", story(NOW - 1, NOW + 1000));
    assert_eq!(expect_view(&mut second).others.len(), 2);

    second.cancel();
    assert_eq!(db.listener_count("stories"), 0);
}

#[tokio::test]
async fn test_late_subscriber_gets_cached_snapshot() {
    let (db, _clock, aggregator) = setup("stories", AggregatorConfig::default());
    let _first = aggregator.subscribe(Some("u9"), None);
    db.set("stories/u1/s1", story(NOW - 10, NOW + 1000));

    let mut late = aggregator.subscribe(Some("u1"), None);

    let view = expect_view(&mut late);
    assert_eq!(view.own.map(|a| a.owner_id), Some("u1".to_string()));
    assert!(late.try_recv().is_err());
}

#[tokio::test]
async fn test_expiry_evaluated_at_delivery_time() {
    let (db, clock, aggregator) = setup("stories", AggregatorConfig::default());
    db.set("stories/u1/s1", story(NOW - 10, NOW + 100));
    let mut subscription = aggregator.subscribe(Some("me"), None);
    assert_eq!(expect_view(&mut subscription).others.len(), 1);

    clock.advance(100);
    db.set("stories/u2/s1", story(NOW + 50, NOW + 10_000));

    let view = expect_view(&mut subscription);
    let owners: Vec<&str> = view.others.iter().map(|a| a.owner_id.as_str()).collect();
    assert_eq!(owners, vec!["u2"]);
}

#[tokio::test]
async fn test_dropped_receiver_is_pruned_on_next_snapshot() {
    let (db, _clock, aggregator) = setup("stories", AggregatorConfig::default());
    let subscription = aggregator.subscribe(Some("me"), None);
    drop(subscription);
    assert_eq!(aggregator.subscriber_count(), 1);

    db.set("stories/u1/s1", story(NOW - 10, NOW + 1000));

    assert_eq!(aggregator.subscriber_count(), 0);
    assert_eq!(db.listener_count("stories"), 0);
}

#[tokio::test]
async fn test_prune_closed_detaches_idle_listener() {
    let (db, _clock, aggregator) = setup("stories", AggregatorConfig::default());
    drop(aggregator.subscribe(Some("me"), None));

    aggregator.prune_closed();

    assert_eq!(aggregator.subscriber_count(), 0);
    assert!(!aggregator.is_attached());
    assert_eq!(db.listener_count("stories"), 0);
}

#[tokio::test]
async fn test_resubscribe_after_detach_reattaches() {
    let (db, _clock, aggregator) = setup("stories", AggregatorConfig::default());
    aggregator.subscribe(Some("me"), None).cancel();
    assert!(!aggregator.is_attached());

    db.set("stories/me/s1", story(NOW - 10, NOW + 1000));
    let mut subscription = aggregator.subscribe(Some("me"), None);

    assert!(aggregator.is_attached());
    assert!(expect_view(&mut subscription).own.is_some());
}

#[tokio::test]
async fn test_full_buffer_keeps_newest_view() {
    let config = AggregatorConfig {
        stream_buffer_size: 1,
        ..AggregatorConfig::default()
    };
    let (db, _clock, aggregator) = setup("stories", config);
    let mut subscription = aggregator.subscribe(Some("me"), None);

    db.set("stories/u1/s1", story(NOW - 10, NOW + 1000));
    db.set("stories/u2/s1", story(NOW - 5, NOW + 1000));

    let mut last = None;
    while let Ok(ViewUpdate::View(view)) = subscription.try_recv() {
        last = Some(view);
    }

    // The intermediate one-owner view is superseded, not the final one.
    let last = last.expect("at least one view");
    assert_eq!(last, compute_view_model(&db.read("stories"), "me", NOW, None));
    assert_eq!(last.others.len(), 2);
    assert!(!subscription.is_cancelled());

    db.set("stories/u3/s1", story(NOW - 1, NOW + 1000));
    assert_eq!(expect_view(&mut subscription).others.len(), 3);
}

#[tokio::test]
async fn test_held_back_view_arrives_through_stream_adapter() {
    use futures::StreamExt;

    let config = AggregatorConfig {
        stream_buffer_size: 1,
        ..AggregatorConfig::default()
    };
    let (db, _clock, aggregator) = setup("stories", config);
    let (mut stream, cancel) = aggregator.subscribe(Some("me"), None).into_parts();

    db.set("stories/u1/s1", story(NOW - 10, NOW + 1000));

    let first = stream.next().await.and_then(ViewUpdate::into_view).unwrap();
    assert!(first.is_empty());
    let second = stream.next().await.and_then(ViewUpdate::into_view).unwrap();
    assert_eq!(second.others.len(), 1);

    cancel.cancel();
}

#[tokio::test]
async fn test_cancel_discards_held_back_view() {
    let config = AggregatorConfig {
        stream_buffer_size: 1,
        ..AggregatorConfig::default()
    };
    let (db, _clock, aggregator) = setup("stories", config);
    let mut subscription = aggregator.subscribe(Some("me"), None);
    db.set("stories/u1/s1", story(NOW - 10, NOW + 1000));

    subscription.cancel();

    assert_eq!(subscription.try_recv(), Err(TryRecvError::Disconnected));
    assert_eq!(db.listener_count("stories"), 0);
}

#[tokio::test]
async fn test_diagnostics_receive_skipped_records() {
    let config = AggregatorConfig {
        enable_debug_logging: true,
        ..AggregatorConfig::default()
    };
    let (db, _clock, aggregator) = setup("stories", config);
    db.set("stories/u1/old", story(NOW - 10, NOW - 1));
    db.set("stories/u1/bad", json!({"createdAt": NOW, "expiresAt": NOW + 1}));
    let skipped = Arc::new(Mutex::new(Vec::new()));
    let sink = skipped.clone();

    let mut subscription = aggregator.subscribe_with_diagnostics(
        Some("me"),
        None,
        Some(Arc::new(move |record: &SkippedRecord| {
            sink.lock().unwrap().push(record.clone())
        })),
    );

    assert!(expect_view(&mut subscription).is_empty());
    let skipped = skipped.lock().unwrap();
    assert_eq!(skipped.len(), 2);
    assert!(skipped.iter().any(|s| s.reason == SkipReason::MissingPayload));
    assert!(skipped
        .iter()
        .any(|s| matches!(s.reason, SkipReason::Expired { .. })));
}

#[tokio::test]
async fn test_generic_projection_shares_listener_machinery() {
    let db = Arc::new(MemoryDatabase::new());
    let clock = Arc::new(ManualClock::new(NOW));
    let aggregator: SnapshotAggregator<usize> =
        SnapshotAggregator::new("places", db.clone(), clock, AggregatorConfig::default());

    let mut subscription = aggregator.subscribe_with(Arc::new(|tree: &Value, _now: i64| {
        tree.as_object().map_or(0, |places| places.len())
    }));
    db.set("places/p1", json!({"name": "Bar"}));
    db.set("places/p2", json!({"name": "Club"}));

    assert_eq!(subscription.try_recv(), Ok(ViewUpdate::View(0)));
    assert_eq!(subscription.try_recv(), Ok(ViewUpdate::View(1)));
    assert_eq!(subscription.try_recv(), Ok(ViewUpdate::View(2)));
}

#[tokio::test]
async fn test_stream_adapter_yields_views() {
    use futures::StreamExt;

    let (db, _clock, aggregator) = setup("stories", AggregatorConfig::default());
    let (mut stream, cancel) = aggregator.subscribe(Some("me"), None).into_parts();
    db.set("stories/me/s1", story(NOW - 10, NOW + 1000));

    assert_eq!(stream.next().await.and_then(ViewUpdate::into_view), Some(ViewModel::empty()));
    assert!(stream.next().await.and_then(ViewUpdate::into_view).unwrap().own.is_some());

    cancel.cancel();
    assert_eq!(stream.next().await, None);
}
