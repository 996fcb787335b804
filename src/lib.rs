use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

use std::path::Path;
use std::sync::Mutex;

pub mod vibecheck;

pub use crate::vibecheck::chat::{ChatAuthor, ChatMessage, ChatRoom};
pub use crate::vibecheck::clock::{Clock, ManualClock, SystemClock};
pub use crate::vibecheck::error::{Result, VibeCheckError};
pub use crate::vibecheck::media_upload::{
    CloudinaryConfig, CloudinaryUploader, MediaUploader, UploadError,
};
pub use crate::vibecheck::places::{Place, Region};
pub use crate::vibecheck::reviews::{GeoPoint, Review, ReviewSummary, VibeStats};
pub use crate::vibecheck::session::Session;
pub use crate::vibecheck::snapshot_aggregator::{
    AggregatorConfig, CancelHandle, OwnerAggregate, SnapshotAggregator, ViewModel, ViewStream,
    ViewSubscription, ViewUpdate, compute_view_model,
};
pub use crate::vibecheck::snapshot_source::{
    MemoryDatabase, RecordWriter, SnapshotSource, SourceError, SourceEvent,
};
pub use crate::vibecheck::vibes::Vibe;
pub use crate::vibecheck::{Backend, VibeCheck, VibeCheckConfig};

static TRACING_GUARDS: OnceCell<Mutex<Option<(WorkerGuard, WorkerGuard)>>> = OnceCell::new();
static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs stdout and daily-rolling file logging. Only the first call in a
/// process has any effect.
pub(crate) fn init_tracing(logs_dir: &Path) -> Result<()> {
    TRACING_INIT
        .get_or_try_init(|| {
            let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix("vibecheck")
                .filename_suffix("log")
                .build(logs_dir)
                .map_err(|e| VibeCheckError::LoggingSetup(e.to_string()))?;

            let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
            let (non_blocking_stdout, stdout_guard) =
                tracing_appender::non_blocking(std::io::stdout());

            TRACING_GUARDS
                .set(Mutex::new(Some((file_guard, stdout_guard))))
                .ok();

            let stdout_layer = Layer::new()
                .with_writer(non_blocking_stdout)
                .with_ansi(true)
                .with_target(true);

            let file_layer = Layer::new()
                .with_writer(non_blocking_file)
                .with_ansi(false)
                .with_target(true);

            // A host application may already own the global subscriber.
            let _ = Registry::default()
                .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
                .with(stdout_layer)
                .with(file_layer)
                .try_init();
            Ok::<(), VibeCheckError>(())
        })
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_tracing_is_idempotent() {
        let logs = TempDir::new().expect("Failed to create temp logs dir");

        assert!(init_tracing(logs.path()).is_ok());
        assert!(init_tracing(logs.path()).is_ok());
    }
}
