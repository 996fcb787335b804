//! In-process realtime tree.
//!
//! Holds one JSON tree and notifies listeners whose path is an ancestor or a
//! descendant of every written path, the way the hosted realtime database
//! does. Callbacks always run after internal locks are released, so a
//! callback may subscribe, unsubscribe or read without deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};

use super::{
    ListenerHandle, RecordWriter, SnapshotCallback, SnapshotSource, SourceError, SourceEvent,
    path_segments,
};

struct Listener {
    handle: ListenerHandle,
    segments: Vec<String>,
    callback: SnapshotCallback,
}

impl Listener {
    fn is_affected_by(&self, written: &[&str]) -> bool {
        self.segments
            .iter()
            .zip(written.iter())
            .all(|(listened, written)| listened == written)
    }
}

pub struct MemoryDatabase {
    root: RwLock<Value>,
    listeners: Mutex<Vec<Listener>>,
    next_listener: AtomicU64,
    next_key: AtomicU64,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::with_data(Value::Null)
    }

    /// Creates a database pre-populated with `data` at the root.
    pub fn with_data(data: Value) -> Self {
        Self {
            root: RwLock::new(data),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            next_key: AtomicU64::new(0),
        }
    }

    /// Writes `value` at `path` and notifies affected listeners.
    ///
    /// Writing `null` (or an empty object) deletes the node and prunes empty
    /// parents.
    pub fn set(&self, path: &str, value: Value) {
        let segments = path_segments(path);
        {
            let mut root = self.root.write().unwrap_or_else(PoisonError::into_inner);
            write_at(&mut root, &segments, value);
        }
        self.notify(&[segments]);
    }

    /// Reads the current value at `path` (`null` when absent).
    pub fn read(&self, path: &str) -> Value {
        let segments = path_segments(path);
        let root = self.root.read().unwrap_or_else(PoisonError::into_inner);
        read_at(&root, &segments)
    }

    /// Delivers `error` to every listener at or below `path`.
    pub fn fail(&self, path: &str, error: SourceError) {
        let segments = path_segments(path);
        let callbacks: Vec<SnapshotCallback> = self
            .lock_listeners()
            .iter()
            .filter(|l| l.is_affected_by(&segments))
            .map(|l| l.callback.clone())
            .collect();

        for callback in callbacks {
            callback(SourceEvent::Failed(error.clone()));
        }
    }

    /// Number of live listeners registered exactly on `path`.
    pub fn listener_count(&self, path: &str) -> usize {
        let segments = path_segments(path);
        self.lock_listeners()
            .iter()
            .filter(|l| l.segments.iter().map(String::as_str).eq(segments.iter().copied()))
            .count()
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, written: &[Vec<&str>]) {
        let affected: Vec<(Vec<String>, SnapshotCallback)> = self
            .lock_listeners()
            .iter()
            .filter(|l| written.iter().any(|w| l.is_affected_by(w)))
            .map(|l| (l.segments.clone(), l.callback.clone()))
            .collect();

        for (segments, callback) in affected {
            let snapshot = {
                let root = self.root.read().unwrap_or_else(PoisonError::into_inner);
                let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
                read_at(&root, &segments)
            };
            callback(SourceEvent::Snapshot(snapshot));
        }
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("listeners", &self.lock_listeners().len())
            .finish()
    }
}

#[async_trait]
impl SnapshotSource for MemoryDatabase {
    fn subscribe(
        &self,
        path: &str,
        on_change: SnapshotCallback,
    ) -> Result<ListenerHandle, SourceError> {
        let handle = ListenerHandle(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let segments: Vec<String> = path_segments(path).into_iter().map(String::from).collect();

        self.lock_listeners().push(Listener {
            handle,
            segments,
            callback: on_change.clone(),
        });

        on_change(SourceEvent::Snapshot(self.read(path)));
        Ok(handle)
    }

    fn unsubscribe(&self, _path: &str, handle: ListenerHandle) {
        self.lock_listeners().retain(|l| l.handle != handle);
    }

    async fn get(&self, path: &str) -> Result<Value, SourceError> {
        Ok(self.read(path))
    }
}

#[async_trait]
impl RecordWriter for MemoryDatabase {
    async fn push(&self, path: &str, value: Value) -> Result<String, SourceError> {
        if path_segments(path).is_empty() {
            return Err(SourceError::InvalidPath(path.to_string()));
        }
        let key = self.generate_key();
        self.set(&format!("{}/{}", path.trim_end_matches('/'), key), value);
        Ok(key)
    }

    async fn update(&self, updates: Map<String, Value>) -> Result<(), SourceError> {
        if let Some(path) = updates.keys().find(|p| path_segments(p).is_empty()) {
            return Err(SourceError::InvalidPath(path.clone()));
        }

        let written: Vec<Vec<&str>> = updates.keys().map(|p| path_segments(p)).collect();
        {
            let mut root = self.root.write().unwrap_or_else(PoisonError::into_inner);
            for (segments, value) in written.iter().zip(updates.values()) {
                write_at(&mut root, segments, value.clone());
            }
        }
        self.notify(&written);
        Ok(())
    }

    /// Keys sort in creation order: millisecond timestamp, then a sequence number.
    fn generate_key(&self) -> String {
        let seq = self.next_key.fetch_add(1, Ordering::Relaxed);
        format!("{:013}-{:06}", Utc::now().timestamp_millis(), seq % 1_000_000)
    }
}

fn is_empty_node(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn write_at(node: &mut Value, segments: &[&str], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *node = if is_empty_node(&value) {
            Value::Null
        } else {
            value
        };
        return;
    };

    if !node.is_object() {
        if is_empty_node(&value) {
            return;
        }
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else {
        return;
    };

    let prune = {
        let child = map.entry(head.to_string()).or_insert(Value::Null);
        write_at(child, rest, value);
        is_empty_node(child)
    };
    if prune {
        map.shift_remove(*head);
    }
}

fn read_at(node: &Value, segments: &[&str]) -> Value {
    segments
        .iter()
        .try_fold(node, |current, segment| current.get(*segment))
        .cloned()
        .unwrap_or(Value::Null)
}
