//! Vibe reports for venues.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::vibecheck::VibeCheck;
use crate::vibecheck::error::{Result, VibeCheckError};
use crate::vibecheck::places::{PLACES_PATH, place_path};
use crate::vibecheck::session::Session;
use crate::vibecheck::vibes::Vibe;

pub const REVIEWS_PATH: &str = "reviews";

/// How many of a venue's latest reviews feed its statistics.
pub const RECENT_REVIEWS_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub place_id: String,
    pub user_id: String,

    /// Stored label; see [`Review::vibe`]
    pub vibe: String,

    pub timestamp: Option<DateTime<Utc>>,
    pub location: Option<GeoPoint>,
}

impl Review {
    pub fn from_record(id: &str, value: &Value) -> Option<Self> {
        let fields = value.as_object()?;
        let text = |name: &str| fields.get(name).and_then(Value::as_str).map(String::from);

        Some(Self {
            id: id.to_string(),
            place_id: text("placeId")?,
            user_id: text("userId")?,
            vibe: text("vibe")?,
            timestamp: fields
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc)),
            location: fields
                .get("location")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
        })
    }

    pub fn vibe(&self) -> Option<Vibe> {
        self.vibe.parse().ok()
    }
}

/// Vibe distribution over a venue's recent reviews.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VibeStats {
    pub total: usize,

    /// Count per stored vibe label
    pub counts: BTreeMap<String, usize>,
}

impl VibeStats {
    pub fn count(&self, vibe: Vibe) -> usize {
        self.counts.get(vibe.label()).copied().unwrap_or(0)
    }

    /// Share of `vibe` in percent; 0 when there are no reviews.
    pub fn percentage(&self, vibe: Vibe) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.count(vibe) as f64 * 100.0 / self.total as f64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReviewSummary {
    pub count: usize,
    pub last_review: Option<Review>,
}

/// Matching reviews sorted by key, which is creation order for pushed keys.
fn reviews_by_key(tree: &Value, matches: impl Fn(&Review) -> bool) -> Vec<Review> {
    let mut reviews: Vec<Review> = tree
        .as_object()
        .into_iter()
        .flat_map(|reviews| reviews.iter())
        .filter_map(|(id, value)| Review::from_record(id, value))
        .filter(|review| matches(review))
        .collect();
    reviews.sort_by(|a, b| a.id.cmp(&b.id));
    reviews
}

/// Statistics over the last `limit` reviews of `place_id`, in key order.
pub fn recent_vibe_stats(tree: &Value, place_id: &str, limit: usize) -> VibeStats {
    let matching = reviews_by_key(tree, |r| r.place_id == place_id);
    let recent = &matching[matching.len().saturating_sub(limit)..];

    let mut stats = VibeStats::default();
    for review in recent {
        stats.total += 1;
        *stats.counts.entry(review.vibe.clone()).or_insert(0) += 1;
    }
    stats
}

/// How many reviews `user_id` wrote and which one came last.
pub fn user_review_summary(tree: &Value, user_id: &str) -> ReviewSummary {
    reviews_by_key(tree, |r| r.user_id == user_id)
        .into_iter()
        .fold(ReviewSummary::default(), |summary, review| ReviewSummary {
            count: summary.count + 1,
            last_review: Some(review),
        })
}

/// A new vibe report, ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewSubmission {
    pub place_id: String,
    pub user_id: String,
    pub vibe: Vibe,
    pub timestamp: DateTime<Utc>,
    pub location: Option<GeoPoint>,
}

impl ReviewSubmission {
    fn timestamp_iso(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn to_record(&self) -> Value {
        let mut record = json!({
            "placeId": self.place_id,
            "userId": self.user_id,
            "vibe": self.vibe.label(),
            "timestamp": self.timestamp_iso(),
        });
        if let (Some(location), Some(fields)) = (self.location, record.as_object_mut()) {
            fields.insert(
                "location".to_string(),
                json!({"latitude": location.latitude, "longitude": location.longitude}),
            );
        }
        record
    }

    /// The multi-path update storing the review under `key` and refreshing
    /// the venue's current vibe.
    pub fn fan_out(&self, key: &str) -> Map<String, Value> {
        let place = format!("/{}/{}", PLACES_PATH, self.place_id);
        let mut updates = Map::new();
        updates.insert(format!("/{}/{}", REVIEWS_PATH, key), self.to_record());
        updates.insert(format!("{place}/currentVibe"), json!(self.vibe.label()));
        updates.insert(
            format!("{place}/currentVibeLevel"),
            json!(self.vibe.intensity()),
        );
        updates.insert(
            format!("{place}/lastReviewTimestamp"),
            json!(self.timestamp_iso()),
        );
        updates
    }
}

impl VibeCheck {
    /// Reports `vibe` for `place_id` and refreshes the venue's current vibe
    /// in one multi-path write. Returns the review key.
    pub async fn submit_review(
        &self,
        session: &Session,
        place_id: &str,
        vibe: Vibe,
        location: Option<GeoPoint>,
    ) -> Result<String> {
        let user_id = session.signed_in_user()?;
        if self.source().get(&place_path(place_id)).await?.is_null() {
            return Err(VibeCheckError::PlaceNotFound(place_id.to_string()));
        }

        let submission = ReviewSubmission {
            place_id: place_id.to_string(),
            user_id: user_id.to_string(),
            vibe,
            timestamp: self.now(),
            location,
        };
        let key = self.writer().generate_key();
        self.writer().update(submission.fan_out(&key)).await?;

        tracing::info!(
            target: "vibecheck::reviews::submit_review",
            place = %place_id,
            review = %key,
            vibe = %vibe,
            "Review submitted"
        );
        Ok(key)
    }

    /// Vibe distribution over the latest reviews of `place_id`.
    pub async fn vibe_stats_for_place(&self, place_id: &str) -> Result<VibeStats> {
        let tree = self.source().get(REVIEWS_PATH).await?;
        Ok(recent_vibe_stats(&tree, place_id, RECENT_REVIEWS_LIMIT))
    }

    pub async fn review_summary_for(&self, session: &Session) -> Result<ReviewSummary> {
        let tree = self.source().get(REVIEWS_PATH).await?;
        Ok(user_review_summary(&tree, &session.user_id))
    }
}
