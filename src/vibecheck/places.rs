//! Venues and their current vibe.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::vibecheck::VibeCheck;
use crate::vibecheck::snapshot_aggregator::{ViewSubscription, millis_from_value};
use crate::vibecheck::vibes::Vibe;

pub const PLACES_PATH: &str = "places";

/// City and state a user or venue belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub city: String,
    pub state: String,
}

impl Region {
    pub fn new(city: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            city: city.into(),
            state: state.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Place {
    pub id: String,
    pub name: String,
    pub address: Option<String>,

    /// Venue category (`type` in the stored record)
    pub kind: Option<String>,

    pub city: Option<String>,
    pub state: Option<String>,

    /// Label of the latest reported vibe, as stored
    pub current_vibe: Option<String>,
    pub current_vibe_level: Option<u8>,
    pub last_review_at: Option<DateTime<Utc>>,
}

impl Place {
    /// Parses one stored venue. Returns `None` when it has no usable name.
    pub fn from_record(id: &str, value: &Value) -> Option<Self> {
        let fields = value.as_object()?;
        let name = text(fields, "name")?;

        Some(Self {
            id: id.to_string(),
            name,
            address: text(fields, "address"),
            kind: text(fields, "type"),
            city: text(fields, "city"),
            state: text(fields, "state"),
            current_vibe: text(fields, "currentVibe"),
            current_vibe_level: fields
                .get("currentVibeLevel")
                .and_then(Value::as_u64)
                .and_then(|level| u8::try_from(level).ok()),
            last_review_at: fields.get("lastReviewTimestamp").and_then(parse_instant),
        })
    }

    pub fn is_in(&self, region: &Region) -> bool {
        self.city.as_deref() == Some(region.city.as_str())
            && self.state.as_deref() == Some(region.state.as_str())
    }

    pub fn vibe(&self) -> Option<Vibe> {
        self.current_vibe.as_deref()?.parse().ok()
    }

    /// Whether the list should highlight this venue.
    pub fn has_high_vibe(&self) -> bool {
        Vibe::intensity_of(self.current_vibe.as_deref()) >= 4
    }
}

/// Venues of `region`, most recently reviewed first.
///
/// Venues never reviewed sort last; ties by id.
pub fn materialize_places(tree: &Value, region: &Region) -> Vec<Place> {
    let Some(places) = tree.as_object() else {
        return Vec::new();
    };

    let mut places: Vec<Place> = places
        .iter()
        .filter_map(|(id, value)| {
            let place = Place::from_record(id, value);
            if place.is_none() {
                tracing::debug!(
                    target: "vibecheck::places::materialize_places",
                    place = %id,
                    "Skipping malformed place"
                );
            }
            place
        })
        .filter(|place| place.is_in(region))
        .collect();

    places.sort_by(|a, b| {
        b.last_review_at
            .cmp(&a.last_review_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    places
}

/// The venue stored at `places/{id}`, where `node` is that node's value.
pub fn place_detail(id: &str, node: &Value) -> Option<Place> {
    Place::from_record(id, node)
}

pub fn place_path(id: &str) -> String {
    format!("{}/{}", PLACES_PATH, id)
}

impl VibeCheck {
    /// Live venue list for `region`.
    ///
    /// Users without a known region get an empty list and no listener.
    pub fn subscribe_places(&self, region: Option<&Region>) -> ViewSubscription<Vec<Place>> {
        let Some(region) = region.cloned() else {
            tracing::warn!(
                target: "vibecheck::places::subscribe_places",
                "User location not set, cannot fetch places for region"
            );
            return ViewSubscription::detached(Vec::new());
        };
        self.places
            .subscribe_with(Arc::new(move |tree: &Value, _now: i64| {
                materialize_places(tree, &region)
            }))
    }

    /// Live detail of one venue; `None` while it does not exist.
    pub fn subscribe_place(&self, place_id: &str) -> ViewSubscription<Option<Place>> {
        let id = place_id.to_string();
        self.place_details.subscribe(
            &place_path(place_id),
            Arc::new(move |node: &Value, _now: i64| place_detail(&id, node)),
        )
    }
}

fn text(fields: &Map<String, Value>, name: &str) -> Option<String> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// RFC 3339 string or epoch milliseconds.
fn parse_instant(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|instant| instant.with_timezone(&Utc)),
        other => millis_from_value(other).and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
    }
}
