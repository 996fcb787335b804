use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};

pub mod chat;
pub mod clock;
pub mod error;
pub mod media_upload;
pub mod places;
pub mod profile;
pub mod reviews;
pub mod session;
pub mod snapshot_aggregator;
pub mod snapshot_source;
pub mod stories;
pub mod vibes;
pub mod view_streaming;

use crate::init_tracing;

use chat::ChatMessage;
use clock::{Clock, SystemClock};
use error::{Result, VibeCheckError};
use media_upload::MediaUploader;
use places::Place;
use snapshot_aggregator::{AggregatorConfig, SnapshotAggregator, ViewModel};
use snapshot_source::{MemoryDatabase, RecordWriter, SnapshotSource};
use view_streaming::AggregatorRegistry;

#[derive(Clone, Debug)]
pub struct VibeCheckConfig {
    /// Directory for application logs
    pub logs_dir: PathBuf,

    /// Configuration for the snapshot aggregators
    pub aggregator_config: Option<AggregatorConfig>,
}

impl VibeCheckConfig {
    pub fn new(logs_dir: &Path) -> Self {
        let env_suffix = if cfg!(debug_assertions) {
            "dev"
        } else {
            "release"
        };

        Self {
            logs_dir: logs_dir.join(env_suffix),
            aggregator_config: None,
        }
    }

    /// Create a new configuration with custom aggregator settings
    pub fn new_with_aggregator_config(logs_dir: &Path, aggregator_config: AggregatorConfig) -> Self {
        Self {
            aggregator_config: Some(aggregator_config),
            ..Self::new(logs_dir)
        }
    }
}

/// External collaborators the app talks to.
#[derive(Clone)]
pub struct Backend {
    pub source: Arc<dyn SnapshotSource>,
    pub writer: Arc<dyn RecordWriter>,
    pub uploader: Option<Arc<dyn MediaUploader>>,
    pub clock: Arc<dyn Clock>,
}

impl Backend {
    pub fn new(source: Arc<dyn SnapshotSource>, writer: Arc<dyn RecordWriter>) -> Self {
        Self {
            source,
            writer,
            uploader: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Reads and writes go to the same in-process tree.
    pub fn in_memory(database: Arc<MemoryDatabase>) -> Self {
        Self::new(database.clone(), database)
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn MediaUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

pub struct VibeCheck {
    pub config: VibeCheckConfig,
    backend: Backend,
    stories: SnapshotAggregator<ViewModel>,
    places: SnapshotAggregator<Vec<Place>>,
    place_details: AggregatorRegistry<Option<Place>>,
    chat_rooms: AggregatorRegistry<Vec<ChatMessage>>,
}

impl std::fmt::Debug for VibeCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VibeCheck")
            .field("config", &self.config)
            .field("backend", &"<REDACTED>")
            .field("stories", &self.stories)
            .field("places", &self.places)
            .field("place_details", &self.place_details)
            .field("chat_rooms", &self.chat_rooms)
            .finish()
    }
}

impl VibeCheck {
    /// Sets up logging and wires one aggregator per watched path.
    ///
    /// # Errors
    ///
    /// Fails if the logs directory cannot be created or logging cannot be
    /// installed.
    pub fn new(config: VibeCheckConfig, backend: Backend) -> Result<Self> {
        let logs_dir = &config.logs_dir;
        std::fs::create_dir_all(logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))
            .map_err(VibeCheckError::from)?;

        init_tracing(logs_dir)?;

        tracing::debug!(target: "vibecheck::new", "Logging initialized in directory: {:?}", logs_dir);

        let aggregator_config = config.aggregator_config.clone().unwrap_or_default();
        let Backend { source, clock, .. } = backend.clone();

        Ok(Self {
            stories: SnapshotAggregator::new(
                stories::STORIES_PATH,
                source.clone(),
                clock.clone(),
                aggregator_config.clone(),
            ),
            places: SnapshotAggregator::new(
                places::PLACES_PATH,
                source.clone(),
                clock.clone(),
                aggregator_config.clone(),
            ),
            place_details: AggregatorRegistry::new(
                source.clone(),
                clock.clone(),
                aggregator_config.clone(),
            ),
            chat_rooms: AggregatorRegistry::new(source, clock, aggregator_config),
            config,
            backend,
        })
    }

    pub(crate) fn now_ms(&self) -> i64 {
        self.backend.clock.now_ms()
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_ms())
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub(crate) fn writer(&self) -> &dyn RecordWriter {
        self.backend.writer.as_ref()
    }

    pub(crate) fn source(&self) -> &dyn SnapshotSource {
        self.backend.source.as_ref()
    }

    /// Aggregator behind [`VibeCheck::subscribe_stories`], shared by the
    /// story bar and the full-screen viewer.
    pub fn stories_aggregator(&self) -> &SnapshotAggregator<ViewModel> {
        &self.stories
    }

    pub(crate) fn uploader(&self) -> Result<&dyn MediaUploader> {
        self.backend
            .uploader
            .as_deref()
            .ok_or(VibeCheckError::UploaderNotConfigured)
    }
}
