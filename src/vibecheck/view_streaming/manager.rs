//! Aggregator registry for per-path fan-out.
//!
//! Creates aggregators lazily on first subscribe and drops them once every
//! subscriber is gone.

use std::sync::Arc;

use dashmap::DashMap;

use crate::vibecheck::clock::Clock;
use crate::vibecheck::snapshot_aggregator::{
    AggregatorConfig, Projection, SnapshotAggregator, ViewSubscription,
};
use crate::vibecheck::snapshot_source::SnapshotSource;

pub struct AggregatorRegistry<T> {
    source: Arc<dyn SnapshotSource>,
    clock: Arc<dyn Clock>,
    config: AggregatorConfig,
    aggregators: DashMap<String, SnapshotAggregator<T>>,
}

impl<T: Send + 'static> AggregatorRegistry<T> {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        clock: Arc<dyn Clock>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            source,
            clock,
            config,
            aggregators: DashMap::new(),
        }
    }

    /// The aggregator for `path`, created if it does not exist yet.
    pub fn aggregator(&self, path: &str) -> SnapshotAggregator<T> {
        self.aggregators
            .entry(path.to_string())
            .or_insert_with(|| self.create(path))
            .clone()
    }

    fn create(&self, path: &str) -> SnapshotAggregator<T> {
        tracing::debug!(
            target: "vibecheck::view_streaming::create",
            path,
            "Creating aggregator"
        );
        SnapshotAggregator::new(
            path,
            self.source.clone(),
            self.clock.clone(),
            self.config.clone(),
        )
    }

    pub fn subscribe(&self, path: &str, project: Projection<T>) -> ViewSubscription<T> {
        self.prune_idle();
        // The entry stays locked until the subscriber is counted, so a
        // concurrent prune cannot drop this aggregator in between.
        let aggregator = self
            .aggregators
            .entry(path.to_string())
            .or_insert_with(|| self.create(path));
        aggregator.subscribe_with(project)
    }

    /// Drops aggregators whose subscribers have all cancelled or gone away.
    pub fn prune_idle(&self) {
        let paths: Vec<String> = self.aggregators.iter().map(|entry| entry.key().clone()).collect();
        for path in paths {
            let removed = self.aggregators.remove_if(&path, |_, aggregator| {
                aggregator.prune_closed();
                aggregator.subscriber_count() == 0
            });
            if removed.is_some() {
                tracing::debug!(
                    target: "vibecheck::view_streaming::prune_idle",
                    path = %path,
                    "Dropping idle aggregator"
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.aggregators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aggregators.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.aggregators.contains_key(path)
    }
}

impl<T> std::fmt::Debug for AggregatorRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatorRegistry")
            .field("paths", &self.aggregators.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::vibecheck::clock::ManualClock;
    use crate::vibecheck::snapshot_aggregator::ViewUpdate;
    use crate::vibecheck::snapshot_source::MemoryDatabase;

    fn make_registry() -> (Arc<MemoryDatabase>, AggregatorRegistry<usize>) {
        let db = Arc::new(MemoryDatabase::new());
        let registry = AggregatorRegistry::new(
            db.clone(),
            Arc::new(ManualClock::new(0)),
            AggregatorConfig::default(),
        );
        (db, registry)
    }

    fn count_children() -> Projection<usize> {
        Arc::new(|tree: &Value, _now: i64| tree.as_object().map_or(0, |map| map.len()))
    }

    #[test]
    fn subscribe_creates_new_aggregator() {
        let (_db, registry) = make_registry();

        assert!(!registry.contains("generalChat"));

        let _sub = registry.subscribe("generalChat", count_children());

        assert!(registry.contains("generalChat"));
    }

    #[test]
    fn multiple_subscribes_share_listener() {
        let (db, registry) = make_registry();

        let _sub1 = registry.subscribe("generalChat", count_children());
        let _sub2 = registry.subscribe("generalChat", count_children());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.aggregator("generalChat").subscriber_count(), 2);
        assert_eq!(db.listener_count("generalChat"), 1);
    }

    #[test]
    fn writes_reach_every_subscriber() {
        let (db, registry) = make_registry();
        let mut sub1 = registry.subscribe("generalChat", count_children());
        let mut sub2 = registry.subscribe("generalChat", count_children());

        db.set("generalChat/m1", json!({"text": "oi"}));

        for sub in [&mut sub1, &mut sub2] {
            assert_eq!(sub.try_recv(), Ok(ViewUpdate::View(0)));
            assert_eq!(sub.try_recv(), Ok(ViewUpdate::View(1)));
        }
    }

    #[test]
    fn idle_aggregators_are_pruned_on_subscribe() {
        let (db, registry) = make_registry();

        let sub = registry.subscribe("regionalChats/SP/Santos", count_children());
        sub.cancel();
        assert!(registry.contains("regionalChats/SP/Santos"));

        let _other = registry.subscribe("generalChat", count_children());

        assert!(!registry.contains("regionalChats/SP/Santos"));
        assert_eq!(db.listener_count("regionalChats/SP/Santos"), 0);
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let (db, registry) = make_registry();
        drop(registry.subscribe("generalChat", count_children()));

        registry.prune_idle();

        assert!(registry.is_empty());
        assert_eq!(db.listener_count("generalChat"), 0);
    }

    #[test]
    fn concurrent_prune_keeps_one_aggregator_per_path() {
        let (db, registry) = make_registry();
        let registry = Arc::new(registry);

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let mut kept = Vec::new();
                    for i in 0..50 {
                        let sub = registry.subscribe("generalChat", count_children());
                        if i % 2 == 0 {
                            sub.cancel();
                        } else {
                            kept.push(sub);
                        }
                        registry.prune_idle();
                    }
                    kept
                })
            })
            .collect();
        let kept: Vec<_> = workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap())
            .collect();

        assert_eq!(registry.len(), 1);
        assert_eq!(db.listener_count("generalChat"), 1);
        assert_eq!(
            registry.aggregator("generalChat").subscriber_count(),
            kept.len()
        );
    }

    #[test]
    fn different_paths_have_separate_aggregators() {
        let (_db, registry) = make_registry();

        let _sub1 = registry.subscribe("generalChat", count_children());
        let _sub2 = registry.subscribe("regionalChats/RJ/Niteroi", count_children());

        assert_eq!(registry.len(), 2);
    }
}
