//! View Streaming Module
//!
//! Keeps one [`SnapshotAggregator`](crate::vibecheck::snapshot_aggregator::SnapshotAggregator)
//! per source path so that every screen watching the same path shares one
//! listener and one ordering policy.

mod manager;

pub use manager::AggregatorRegistry;
