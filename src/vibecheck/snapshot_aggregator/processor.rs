//! Core aggregation logic
//!
//! Turns one raw snapshot (`ownerId -> recordId -> record`) into a
//! [`ViewModel`]. Pure: no I/O, no clock, no shared state. Bad records are
//! skipped and reported through the diagnostics callback, never raised.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use super::types::{
    OwnerAggregate, OwnerMetadata, RawRecord, RecordPayload, SkipReason, SkippedRecord, ViewModel,
};

/// Computes the view for `viewer_id` at `now_ms`.
pub fn compute_view_model(
    tree: &Value,
    viewer_id: &str,
    now_ms: i64,
    viewer_fallback_avatar: Option<&str>,
) -> ViewModel {
    compute_view_model_with_diagnostics(tree, viewer_id, now_ms, viewer_fallback_avatar, &mut |_| {})
}

/// Same as [`compute_view_model`], reporting every skipped record.
pub fn compute_view_model_with_diagnostics(
    tree: &Value,
    viewer_id: &str,
    now_ms: i64,
    viewer_fallback_avatar: Option<&str>,
    diagnostics: &mut dyn FnMut(SkippedRecord),
) -> ViewModel {
    let Some(buckets) = tree.as_object() else {
        return ViewModel::empty();
    };

    let mut own = None;
    let mut others = Vec::new();

    for (owner_id, bucket) in buckets {
        let is_viewer = owner_id == viewer_id;
        let fallback_avatar = if is_viewer { viewer_fallback_avatar } else { None };

        let Some(aggregate) = aggregate_owner(owner_id, bucket, now_ms, fallback_avatar, diagnostics)
        else {
            continue;
        };

        if is_viewer {
            own = Some(aggregate);
        } else {
            others.push(aggregate);
        }
    }

    others.sort_by(by_latest_activity);

    ViewModel { own, others }
}

/// Most recent activity first, then owner id ascending.
pub(crate) fn by_latest_activity(a: &OwnerAggregate, b: &OwnerAggregate) -> Ordering {
    b.latest_activity_at
        .cmp(&a.latest_activity_at)
        .then_with(|| a.owner_id.cmp(&b.owner_id))
}

/// Fallback display name for owners without metadata.
pub fn fallback_display_name(owner_id: &str) -> String {
    format!("User {}", owner_id.chars().take(4).collect::<String>())
}

fn aggregate_owner(
    owner_id: &str,
    bucket: &Value,
    now_ms: i64,
    fallback_avatar: Option<&str>,
    diagnostics: &mut dyn FnMut(SkippedRecord),
) -> Option<OwnerAggregate> {
    let Some(records) = bucket.as_object() else {
        diagnostics(SkippedRecord {
            owner_id: owner_id.to_string(),
            record_id: None,
            reason: SkipReason::NotAnObject,
        });
        return None;
    };

    let mut active_records = Vec::with_capacity(records.len());
    for (record_id, value) in records {
        let checked = parse_record(record_id, Some(owner_id), value).and_then(|record| {
            match record.expires_at {
                None => Err(SkipReason::MissingExpiry),
                Some(expires_at) if expires_at <= now_ms => Err(SkipReason::Expired { expires_at }),
                Some(_) => Ok(record),
            }
        });

        match checked {
            Ok(record) => active_records.push(record),
            Err(reason) => diagnostics(SkippedRecord {
                owner_id: owner_id.to_string(),
                record_id: Some(record_id.clone()),
                reason,
            }),
        }
    }

    if active_records.is_empty() {
        return None;
    }

    // Metadata comes from the first kept record (encounter order) that has any.
    let metadata = active_records.iter().find_map(|r| r.owner.clone());

    active_records.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    let latest_activity_at = active_records.last().map(|r| r.created_at)?;

    let display_name = metadata
        .as_ref()
        .and_then(|m| non_empty(m.name.as_deref()))
        .map(String::from)
        .unwrap_or_else(|| fallback_display_name(owner_id));
    let avatar_url = metadata
        .as_ref()
        .and_then(|m| non_empty(m.avatar.as_deref()))
        .or_else(|| non_empty(fallback_avatar))
        .map(String::from);

    Some(OwnerAggregate {
        owner_id: owner_id.to_string(),
        display_name,
        avatar_url,
        active_records,
        latest_activity_at,
    })
}

/// Validates one raw record.
///
/// When `owner_id` is `None` the owner is taken from the record's own
/// `user` metadata; flat collections such as chat rooms rely on this.
/// Expiry is parsed but not enforced here.
pub(crate) fn parse_record(
    record_id: &str,
    owner_id: Option<&str>,
    value: &Value,
) -> Result<RawRecord, SkipReason> {
    let fields = value.as_object().ok_or(SkipReason::NotAnObject)?;

    let payload = parse_payload(fields)?;

    let created_at = match millis_field(fields, "createdAt")? {
        Some(created_at) => created_at,
        None => millis_field(fields, "timestamp")?.ok_or(SkipReason::MissingCreatedAt)?,
    };
    let expires_at = millis_field(fields, "expiresAt")?;

    // A metadata field of the wrong type is treated as absent.
    let owner = fields
        .get("user")
        .and_then(Value::as_object)
        .map(owner_metadata);

    let owner_id = match owner_id {
        Some(owner_id) => owner_id.to_string(),
        None => owner
            .as_ref()
            .and_then(|m| non_empty(m.id.as_deref()))
            .map(String::from)
            .ok_or(SkipReason::MissingOwner)?,
    };

    Ok(RawRecord {
        id: record_id.to_string(),
        owner_id,
        payload,
        created_at,
        expires_at,
        owner,
    })
}

/// `_id` wins over `id`; each field of the wrong type is dropped on its own.
fn owner_metadata(user: &Map<String, Value>) -> OwnerMetadata {
    let text = |name: &str| user.get(name).and_then(Value::as_str).map(String::from);
    OwnerMetadata {
        id: text("_id")
            .filter(|id| !id.is_empty())
            .or_else(|| text("id")),
        name: text("name"),
        avatar: text("avatar"),
    }
}

fn parse_payload(fields: &Map<String, Value>) -> Result<RecordPayload, SkipReason> {
    if let Some(url) = string_field(fields, "mediaUrl")? {
        let media_type = string_field(fields, "mediaType")
            .ok()
            .flatten()
            .map(String::from);
        return Ok(RecordPayload::Media {
            url: url.to_string(),
            media_type,
        });
    }
    if let Some(text) = string_field(fields, "text")? {
        return Ok(RecordPayload::Text(text.to_string()));
    }
    Err(SkipReason::MissingPayload)
}

/// `Ok(None)` for absent, null or empty strings; `Err` for other types.
fn string_field<'a>(
    fields: &'a Map<String, Value>,
    name: &str,
) -> Result<Option<&'a str>, SkipReason> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(non_empty(Some(s.as_str()))),
        Some(_) => Err(SkipReason::InvalidField(name.to_string())),
    }
}

/// Epoch milliseconds; integral or floating point numbers are accepted.
fn millis_field(fields: &Map<String, Value>, name: &str) -> Result<Option<i64>, SkipReason> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => millis_from_value(value)
            .map(Some)
            .ok_or_else(|| SkipReason::InvalidField(name.to_string())),
    }
}

pub(crate) fn millis_from_value(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
            .map(|f| f as i64)
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.is_empty())
}
