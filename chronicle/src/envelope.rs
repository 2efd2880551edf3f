//! Event envelopes are the persisted representation of domain events.
//!
//! An [`EventEnvelope`] carries everything the store writes for one event: a
//! globally unique id, a short type tag, a JSON payload, a JSON metadata
//! object, and a microsecond-precision creation instant. A
//! [`PersistedEvent`] wraps an envelope read back from a stream together with
//! the position the store assigned to it.
use chrono::{NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ops::Deref;
use uuid::Uuid;

/// Textual layout of the `created_at` column: `YYYY-MM-DDTHH:MM:SS.uuuuuu`.
pub const CREATED_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Metadata key holding the aggregate version an event belongs to.
pub(crate) const AGGREGATE_VERSION_KEY: &str = "_aggregate_version";
pub(crate) const AGGREGATE_ID_KEY: &str = "_aggregate_id";
pub(crate) const AGGREGATE_TYPE_KEY: &str = "_aggregate_type";

/// An immutable domain event ready to be persisted.
///
/// # Examples
///
/// ```
/// use chronicle::EventEnvelope;
/// use serde_json::json;
///
/// let event = EventEnvelope::new("UserCreated", json!({ "name": "Sasha" }))
///     .with_metadata_entry("_aggregate_version", json!(1));
/// assert_eq!(event.event_name(), "UserCreated");
/// assert_eq!(event.aggregate_version(), Some(1));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    event_id: Uuid,
    event_name: String,
    payload: Value,
    metadata: Map<String, Value>,
    created_at: NaiveDateTime,
}

impl EventEnvelope {
    /// Creates an envelope with a fresh v4 id, empty metadata, and the
    /// current instant truncated to microsecond precision.
    pub fn new(event_name: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_name: event_name.into(),
            payload,
            metadata: Map::new(),
            created_at: truncate_to_micros(Utc::now().naive_utc()),
        }
    }

    /// Replaces the event id.
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    /// Replaces the creation instant, truncating it to microsecond precision.
    pub fn with_created_at(mut self, created_at: NaiveDateTime) -> Self {
        self.created_at = truncate_to_micros(created_at);
        self
    }

    /// Replaces the whole metadata object.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Inserts a single metadata entry.
    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The globally unique id of the event.
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    /// The short type tag of the event.
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// The JSON payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// The JSON metadata object.
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// A single metadata entry, when present.
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// The creation instant (microsecond precision).
    pub fn created_at(&self) -> NaiveDateTime {
        self.created_at
    }

    /// The creation instant formatted as [`CREATED_AT_FORMAT`].
    pub fn format_created_at(&self) -> String {
        self.created_at.format(CREATED_AT_FORMAT).to_string()
    }

    /// The `_aggregate_version` metadata entry, when present and integral.
    pub fn aggregate_version(&self) -> Option<i64> {
        self.metadata.get(AGGREGATE_VERSION_KEY).and_then(Value::as_i64)
    }
}

fn truncate_to_micros(instant: NaiveDateTime) -> NaiveDateTime {
    instant
        .with_nanosecond(instant.nanosecond() / 1_000 * 1_000)
        .unwrap_or(instant)
}

/// An envelope that has been committed to a stream, carrying the position the
/// store assigned to it.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEvent {
    no: i64,
    event: EventEnvelope,
}

impl PersistedEvent {
    /// Creates a new `PersistedEvent` with the given position and envelope.
    pub fn new(no: i64, event: EventEnvelope) -> Self {
        Self { no, event }
    }

    /// The per-stream position assigned by the store.
    pub fn no(&self) -> i64 {
        self.no
    }

    /// Returns the inner envelope.
    pub fn into_inner(self) -> EventEnvelope {
        self.event
    }
}

impl Deref for PersistedEvent {
    type Target = EventEnvelope;

    fn deref(&self) -> &Self::Target {
        &self.event
    }
}
