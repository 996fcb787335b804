use serde::{Deserialize, Serialize};

/// What a posted record carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordPayload {
    /// Hosted media (stories). `media_type` defaults to an image when absent.
    Media {
        url: String,
        media_type: Option<String>,
    },

    /// Inline text (chat messages).
    Text(String),
}

/// Owner details copied into a record at write time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OwnerMetadata {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub avatar: Option<String>,
}

/// One validated record as stored remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Key of the record inside its owner bucket
    pub id: String,

    /// Key of the owner bucket (or the metadata id for flat collections)
    pub owner_id: String,

    pub payload: RecordPayload,

    /// Creation time in epoch milliseconds
    pub created_at: i64,

    /// Expiry time in epoch milliseconds, if the record is ephemeral
    pub expires_at: Option<i64>,

    pub owner: Option<OwnerMetadata>,
}

impl RawRecord {
    /// A record is active while its expiry is strictly in the future.
    pub fn is_active_at(&self, now_ms: i64) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at > now_ms)
    }

    pub fn media_url(&self) -> Option<&str> {
        match &self.payload {
            RecordPayload::Media { url, .. } => Some(url),
            RecordPayload::Text(_) => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            RecordPayload::Text(text) => Some(text),
            RecordPayload::Media { .. } => None,
        }
    }
}

/// Per-owner view over the active records of one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerAggregate {
    pub owner_id: String,

    pub display_name: String,

    pub avatar_url: Option<String>,

    /// Never empty; ascending by `created_at`
    pub active_records: Vec<RawRecord>,

    /// Largest `created_at` among `active_records`
    pub latest_activity_at: i64,
}

/// The materialized result consumers render. Each emission replaces the
/// previous one wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ViewModel {
    /// The viewer's own bucket, if it has active records
    #[serde(rename = "self")]
    pub own: Option<OwnerAggregate>,

    /// Everyone else, most recent activity first, ties by owner id
    pub others: Vec<OwnerAggregate>,
}

impl ViewModel {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.own.is_none() && self.others.is_empty()
    }

    /// All aggregates, own bucket included, in full-screen viewer order.
    pub fn viewer_sequence(&self) -> Vec<&OwnerAggregate> {
        let mut sequence: Vec<&OwnerAggregate> =
            self.own.iter().chain(self.others.iter()).collect();
        sequence.sort_by(|a, b| super::processor::by_latest_activity(a, b));
        sequence
    }

    /// Index of `owner_id` inside [`ViewModel::viewer_sequence`].
    pub fn position_of(&self, owner_id: &str) -> Option<usize> {
        self.viewer_sequence()
            .iter()
            .position(|aggregate| aggregate.owner_id == owner_id)
    }
}

/// Why a record was left out of a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// The record (or its bucket) is not a JSON object
    NotAnObject,

    /// Neither `mediaUrl` nor `text` holds a non-empty string
    MissingPayload,

    /// Neither `createdAt` nor `timestamp` holds a number
    MissingCreatedAt,

    /// The record never expires, so it cannot be active
    MissingExpiry,

    /// The owner could not be determined
    MissingOwner,

    /// A field is present but has the wrong type
    InvalidField(String),

    /// `expires_at <= now`
    Expired { expires_at: i64 },
}

impl SkipReason {
    /// Expired records are well formed; everything else is malformed.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, SkipReason::Expired { .. })
    }
}

/// Diagnostic emitted for every skipped record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub owner_id: String,

    /// `None` when a whole bucket was skipped
    pub record_id: Option<String>,

    pub reason: SkipReason,
}

/// Configuration for snapshot aggregators
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AggregatorConfig {
    /// Whether to log every skipped record at debug level
    pub enable_debug_logging: bool,

    /// Per-subscription emission buffer
    pub stream_buffer_size: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            enable_debug_logging: false,
            stream_buffer_size: 100,
        }
    }
}
