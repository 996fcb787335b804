//! Realtime Snapshot Source
//!
//! Boundary with the remote tree-structured realtime database. The database
//! itself is an external collaborator; this module only names the contract
//! the aggregators consume (`SnapshotSource`) and the write path the
//! feature modules hand their drafts to (`RecordWriter`).
//!
//! `MemoryDatabase` implements both contracts in-process.

mod memory;

pub use memory::MemoryDatabase;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Errors raised by the realtime source or the write path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum SourceError {
    #[error("Permission denied reading {path}")]
    PermissionDenied { path: String },

    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Write rejected at {path}: {reason}")]
    WriteRejected { path: String, reason: String },

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// One delivery from a live listener.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// A full read of the listened path. Missing data is `Value::Null`.
    Snapshot(Value),

    /// The source could not be read.
    Failed(SourceError),
}

/// Identifies a listener registered with [`SnapshotSource::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerHandle(pub u64);

/// Callback invoked by the source for every delivery.
pub type SnapshotCallback = Arc<dyn Fn(SourceEvent) + Send + Sync>;

/// Read side of the realtime database.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Starts listening on `path`.
    ///
    /// The callback fires once with the current value and then again after
    /// every change at or below `path`. It may fire on any thread, including
    /// synchronously from inside this call.
    fn subscribe(
        &self,
        path: &str,
        on_change: SnapshotCallback,
    ) -> Result<ListenerHandle, SourceError>;

    /// Detaches a listener. Unknown handles are ignored.
    fn unsubscribe(&self, path: &str, handle: ListenerHandle);

    /// One-shot read of `path`.
    async fn get(&self, path: &str) -> Result<Value, SourceError>;
}

/// Write side of the realtime database.
#[async_trait]
pub trait RecordWriter: Send + Sync {
    /// Appends `value` under `path` with a generated key and returns the key.
    async fn push(&self, path: &str, value: Value) -> Result<String, SourceError>;

    /// Applies a multi-path update. Keys are absolute paths.
    async fn update(&self, updates: Map<String, Value>) -> Result<(), SourceError>;

    /// Generates a fresh child key without writing anything.
    fn generate_key(&self) -> String;
}

/// Splits a slash separated database path into its non-empty segments.
pub(crate) fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_segments_ignores_extra_slashes() {
        assert_eq!(path_segments("/stories//u1/"), vec!["stories", "u1"]);
        assert_eq!(path_segments("places"), vec!["places"]);
        assert!(path_segments("/").is_empty());
    }

    #[test]
    fn test_source_error_display() {
        let err = SourceError::PermissionDenied {
            path: "stories".to_string(),
        };
        assert_eq!(err.to_string(), "Permission denied reading stories");
    }
}
