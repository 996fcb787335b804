//! Snapshot Aggregation Module
//!
//! Turns raw per-owner snapshots from the realtime source into sorted,
//! self-vs-others partitioned views and keeps them live while the source
//! mutates. The view computation itself is the pure
//! [`compute_view_model`]; [`SnapshotAggregator`] is the subscription
//! wrapper that fans one source listener out to many consumers.

mod processor;
mod subscription;
mod types;

#[cfg(test)]
mod tests;

pub use processor::{compute_view_model, compute_view_model_with_diagnostics, fallback_display_name};
pub use subscription::{CancelHandle, ViewStream, ViewSubscription, ViewUpdate};
pub use types::{
    AggregatorConfig, OwnerAggregate, OwnerMetadata, RawRecord, RecordPayload, SkipReason,
    SkippedRecord, ViewModel,
};

pub(crate) use processor::{millis_from_value, parse_record};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::vibecheck::clock::Clock;
use crate::vibecheck::snapshot_source::{ListenerHandle, SnapshotSource, SourceError, SourceEvent};
use subscription::{Cancellable, Refill};

/// Maps one snapshot of the listened path, at the given evaluation time, to a view.
pub type Projection<T> = Arc<dyn Fn(&Value, i64) -> T + Send + Sync>;

/// Receives every record left out of a story view.
pub type DiagnosticsCallback = Arc<dyn Fn(&SkippedRecord) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SubscriptionId(u64);

enum Delivery {
    Delivered,
    Stale,
    Closed,
}

struct Gate<T> {
    sender: Option<mpsc::Sender<ViewUpdate<T>>>,

    /// Newest emission that did not fit in the buffer
    pending: Option<ViewUpdate<T>>,

    delivered_version: u64,
}

struct Subscriber<T> {
    id: SubscriptionId,
    project: Projection<T>,
    gate: Mutex<Gate<T>>,
}

impl<T> Subscriber<T> {
    fn lock_gate(&self) -> MutexGuard<'_, Gate<T>> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Projects and delivers `event` unless this subscriber already saw a
    /// newer version. Runs under the gate so it cannot interleave with
    /// [`Subscriber::close`].
    ///
    /// On a full buffer the emission is held as pending, replacing any older
    /// pending one, and goes out as soon as the consumer takes an item.
    fn deliver(&self, path: &str, version: u64, event: &SourceEvent, now_ms: i64) -> Delivery {
        let mut gate = self.lock_gate();
        if version <= gate.delivered_version {
            return Delivery::Stale;
        }
        let Some(sender) = gate.sender.as_ref() else {
            return Delivery::Closed;
        };

        let update = match event {
            SourceEvent::Snapshot(tree) => ViewUpdate::View((self.project)(tree, now_ms)),
            SourceEvent::Failed(error) => ViewUpdate::SourceError(error.clone()),
        };

        match sender.try_send(update) {
            Ok(()) => {
                gate.pending = None;
                gate.delivered_version = version;
                Delivery::Delivered
            }
            Err(TrySendError::Full(update)) => {
                tracing::debug!(
                    target: "vibecheck::snapshot_aggregator::deliver",
                    path,
                    version,
                    "Subscriber buffer full, holding latest emission"
                );
                gate.pending = Some(update);
                gate.delivered_version = version;
                Delivery::Delivered
            }
            Err(TrySendError::Closed(_)) => {
                gate.sender = None;
                gate.pending = None;
                Delivery::Closed
            }
        }
    }

    fn send_error(&self, error: SourceError) {
        if let Some(sender) = self.lock_gate().sender.as_ref() {
            let _ = sender.try_send(ViewUpdate::SourceError(error));
        }
    }

    /// Drops the sender. Returns `false` if it was already closed.
    fn close(&self) -> bool {
        let mut gate = self.lock_gate();
        gate.pending = None;
        gate.sender.take().is_some()
    }

    fn is_closed(&self) -> bool {
        self.lock_gate()
            .sender
            .as_ref()
            .is_none_or(|sender| sender.is_closed())
    }
}

impl<T: Send> Refill for Subscriber<T> {
    fn refill(&self) {
        let mut gate = self.lock_gate();
        let Some(update) = gate.pending.take() else {
            return;
        };
        let Some(sender) = gate.sender.as_ref() else {
            return;
        };
        match sender.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => gate.pending = Some(update),
            Err(TrySendError::Closed(_)) => gate.sender = None,
        }
    }
}

struct AggregatorInner<T> {
    path: String,
    source: Arc<dyn SnapshotSource>,
    clock: Arc<dyn Clock>,
    config: AggregatorConfig,
    subscribers: DashMap<SubscriptionId, Arc<Subscriber<T>>>,
    latest: RwLock<Option<(u64, Arc<SourceEvent>)>>,
    version: AtomicU64,
    listener: Mutex<Option<ListenerHandle>>,
    next_id: AtomicU64,
}

impl<T: Send + 'static> AggregatorInner<T> {
    fn lock_listener(&self) -> MutexGuard<'_, Option<ListenerHandle>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_event(&self, event: SourceEvent) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Arc::new(event);
        {
            let mut latest = self.latest.write().unwrap_or_else(PoisonError::into_inner);
            if latest.as_ref().is_none_or(|(seen, _)| *seen < version) {
                *latest = Some((version, event.clone()));
            }
        }

        if let SourceEvent::Failed(error) = event.as_ref() {
            tracing::warn!(
                target: "vibecheck::snapshot_aggregator::on_event",
                path = %self.path,
                "Source error: {}",
                error
            );
        }

        let now_ms = self.clock.now_ms();
        let subscribers: Vec<Arc<Subscriber<T>>> =
            self.subscribers.iter().map(|entry| entry.value().clone()).collect();

        if self.config.enable_debug_logging {
            tracing::debug!(
                target: "vibecheck::snapshot_aggregator::on_event",
                path = %self.path,
                version,
                subscribers = subscribers.len(),
                "Delivering snapshot"
            );
        }

        let mut closed = false;
        for subscriber in subscribers {
            if let Delivery::Closed = subscriber.deliver(&self.path, version, &event, now_ms) {
                self.subscribers.remove(&subscriber.id);
                closed = true;
            }
        }

        // May run inside the source's callback while `subscribe` holds the
        // listener lock on this thread, so never block on it here.
        if closed && self.subscribers.is_empty() {
            if let Ok(mut listener) = self.listener.try_lock() {
                self.detach_if_idle(&mut listener);
            }
        }
    }

    fn deliver_latest(&self, subscriber: &Subscriber<T>) {
        let latest = self
            .latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some((version, event)) = latest {
            subscriber.deliver(&self.path, version, &event, self.clock.now_ms());
        }
    }

    fn remove_subscriber(&self, id: SubscriptionId) {
        self.subscribers.remove(&id);
        let mut listener = self.lock_listener();
        self.detach_if_idle(&mut listener);
    }

    fn detach_if_idle(&self, listener: &mut Option<ListenerHandle>) {
        if !self.subscribers.is_empty() {
            return;
        }
        if let Some(handle) = listener.take() {
            self.source.unsubscribe(&self.path, handle);
            *self.latest.write().unwrap_or_else(PoisonError::into_inner) = None;
            tracing::debug!(
                target: "vibecheck::snapshot_aggregator::detach_if_idle",
                path = %self.path,
                "Detached source listener"
            );
        }
    }
}

struct SubscriptionLink<T> {
    subscriber: Arc<Subscriber<T>>,
    aggregator: Weak<AggregatorInner<T>>,
}

impl<T: Send + 'static> Cancellable for SubscriptionLink<T> {
    fn cancel(&self) {
        if !self.subscriber.close() {
            return;
        }
        if let Some(inner) = self.aggregator.upgrade() {
            inner.remove_subscriber(self.subscriber.id);
        }
    }
}

/// One aggregator per source path. Cloning shares the same listener and
/// subscriber set.
pub struct SnapshotAggregator<T = ViewModel> {
    inner: Arc<AggregatorInner<T>>,
}

impl<T> Clone for SnapshotAggregator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> SnapshotAggregator<T> {
    pub fn new(
        path: impl Into<String>,
        source: Arc<dyn SnapshotSource>,
        clock: Arc<dyn Clock>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                path: path.into(),
                source,
                clock,
                config,
                subscribers: DashMap::new(),
                latest: RwLock::new(None),
                version: AtomicU64::new(0),
                listener: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.inner.config
    }

    /// Subscribes a consumer that sees every snapshot through `project`.
    ///
    /// Attaches the source listener if this is the first subscriber;
    /// otherwise the latest cached snapshot is projected right away.
    pub fn subscribe_with(&self, project: Projection<T>) -> ViewSubscription<T> {
        let inner = &self.inner;
        let (sender, receiver) = mpsc::channel(inner.config.stream_buffer_size.max(1));
        let id = SubscriptionId(inner.next_id.fetch_add(1, Ordering::Relaxed));
        let subscriber = Arc::new(Subscriber {
            id,
            project,
            gate: Mutex::new(Gate {
                sender: Some(sender),
                pending: None,
                delivered_version: 0,
            }),
        });
        inner.subscribers.insert(id, subscriber.clone());

        {
            let mut listener = inner.lock_listener();
            if listener.is_none() {
                let target = inner.clone();
                let callback = Arc::new(move |event: SourceEvent| target.on_event(event));
                match inner.source.subscribe(&inner.path, callback) {
                    Ok(handle) => {
                        *listener = Some(handle);
                        tracing::debug!(
                            target: "vibecheck::snapshot_aggregator::subscribe_with",
                            path = %inner.path,
                            "Attached source listener"
                        );
                    }
                    Err(error) => {
                        tracing::warn!(
                            target: "vibecheck::snapshot_aggregator::subscribe_with",
                            path = %inner.path,
                            "Failed to attach listener: {}",
                            error
                        );
                        subscriber.send_error(error);
                    }
                }
            }
        }
        inner.deliver_latest(&subscriber);

        let cancelled = Arc::new(AtomicBool::new(false));
        let refill: Arc<dyn Refill> = subscriber.clone();
        let link: Arc<dyn Cancellable> = Arc::new(SubscriptionLink {
            subscriber,
            aggregator: Arc::downgrade(inner),
        });
        ViewSubscription::new(
            ViewStream::new(receiver, cancelled.clone(), Some(refill)),
            CancelHandle::new(cancelled, Some(link)),
        )
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Whether a source listener is currently attached.
    pub fn is_attached(&self) -> bool {
        self.inner.lock_listener().is_some()
    }

    /// Forgets subscribers whose receivers were dropped, detaching the
    /// listener if none remain.
    pub fn prune_closed(&self) {
        let closed: Vec<SubscriptionId> = self
            .inner
            .subscribers
            .iter()
            .filter(|entry| entry.value().is_closed())
            .map(|entry| *entry.key())
            .collect();
        if closed.is_empty() {
            return;
        }
        for id in closed {
            self.inner.subscribers.remove(&id);
        }
        let mut listener = self.inner.lock_listener();
        self.inner.detach_if_idle(&mut listener);
    }
}

impl SnapshotAggregator<ViewModel> {
    /// Story-bar entry point.
    ///
    /// Without a viewer the empty view is emitted at once and the source is
    /// never touched.
    pub fn subscribe(
        &self,
        viewer_id: Option<&str>,
        viewer_fallback_avatar: Option<&str>,
    ) -> ViewSubscription<ViewModel> {
        self.subscribe_with_diagnostics(viewer_id, viewer_fallback_avatar, None)
    }

    pub fn subscribe_with_diagnostics(
        &self,
        viewer_id: Option<&str>,
        viewer_fallback_avatar: Option<&str>,
        diagnostics: Option<DiagnosticsCallback>,
    ) -> ViewSubscription<ViewModel> {
        let Some(viewer_id) = viewer_id.filter(|id| !id.is_empty()) else {
            tracing::debug!(
                target: "vibecheck::snapshot_aggregator::subscribe",
                path = %self.path(),
                "No viewer, emitting empty view"
            );
            return ViewSubscription::detached(ViewModel::empty());
        };

        let viewer_id = viewer_id.to_string();
        let fallback = viewer_fallback_avatar.map(String::from);
        let path = self.path().to_string();
        let log_skips = self.config().enable_debug_logging;

        self.subscribe_with(Arc::new(move |tree: &Value, now_ms: i64| {
            compute_view_model_with_diagnostics(
                tree,
                &viewer_id,
                now_ms,
                fallback.as_deref(),
                &mut |skipped| {
                    if log_skips {
                        tracing::debug!(
                            target: "vibecheck::snapshot_aggregator::subscribe",
                            path = %path,
                            owner = %skipped.owner_id,
                            record = ?skipped.record_id,
                            reason = ?skipped.reason,
                            "Skipped record"
                        );
                    }
                    if let Some(diagnostics) = &diagnostics {
                        diagnostics(&skipped);
                    }
                },
            )
        }))
    }
}

impl<T> std::fmt::Debug for SnapshotAggregator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotAggregator")
            .field("path", &self.inner.path)
            .field("subscribers", &self.inner.subscribers.len())
            .finish()
    }
}
