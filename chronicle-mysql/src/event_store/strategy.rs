//! Dialect and table-layout policies.
//!
//! A [`PersistenceStrategy`] decides how a logical stream maps onto a
//! physical MySQL table. MySQL cannot index JSON paths directly, so both
//! layouts expose the aggregate metadata keys through generated STORED
//! columns and put their unique keys on those.
use crate::Error;
use chronicle::{EventEnvelope, StreamName};
use serde_json::Value;
use sha1::{Digest, Sha1};

/// A flattened event, one row of the multi-row insert.
///
/// MySQL stores event ids as `CHAR(36)` text, so the id is already rendered.
#[derive(Debug, Clone)]
pub struct EventRow {
    /// Explicit position, set only by layouts that assign `no` themselves.
    pub no: Option<i64>,
    pub event_id: String,
    pub event_name: String,
    pub payload: Value,
    pub metadata: Value,
    pub created_at: String,
}

impl EventRow {
    fn from_envelope(event: &EventEnvelope, no: Option<i64>) -> Self {
        Self {
            no,
            event_id: event.event_id().to_string(),
            event_name: event.event_name().to_string(),
            payload: event.payload().clone(),
            metadata: Value::Object(event.metadata().clone()),
            created_at: event.format_created_at(),
        }
    }
}

/// Table layout policy of a stream.
pub trait PersistenceStrategy: Send + Sync {
    /// Ordered DDL statements creating the physical stream table.
    fn create_schema(&self, table_name: &str) -> Vec<String>;

    /// Column identifiers of the insert statement, in binding order.
    fn column_names(&self) -> &'static [&'static str];

    /// Flattens envelopes into rows matching `column_names`.
    fn prepare_data(&self, events: &[EventEnvelope]) -> Result<Vec<EventRow>, Error>;

    /// SQLSTATE codes reported for unique-constraint violations.
    fn unique_violation_codes(&self) -> &'static [&'static str];

    /// Derives the physical table name of a stream: `"_" + sha1(name)`.
    fn table_name(&self, stream_name: &StreamName) -> String {
        format!("_{:x}", Sha1::digest(stream_name.as_str().as_bytes()))
    }
}

const SINGLE_STREAM_COLUMNS: &[&str] =
    &["event_id", "event_name", "payload", "metadata", "created_at"];
const AGGREGATE_STREAM_COLUMNS: &[&str] =
    &["no", "event_id", "event_name", "payload", "metadata", "created_at"];
const UNIQUE_VIOLATION_CODES: &[&str] = &["23000"];

/// One physical table per logical stream; `no` is assigned by the database.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleStreamStrategy;

impl PersistenceStrategy for SingleStreamStrategy {
    fn create_schema(&self, table_name: &str) -> Vec<String> {
        vec![format!(
            r#"CREATE TABLE {table_name} (
    no BIGINT NOT NULL AUTO_INCREMENT,
    event_id CHAR(36) COLLATE utf8mb4_bin NOT NULL,
    event_name VARCHAR(100) NOT NULL,
    payload JSON NOT NULL,
    metadata JSON NOT NULL,
    created_at CHAR(26) NOT NULL,
    aggregate_version INT UNSIGNED GENERATED ALWAYS AS (JSON_EXTRACT(metadata, '$._aggregate_version')) STORED,
    aggregate_id CHAR(36) GENERATED ALWAYS AS (JSON_UNQUOTE(JSON_EXTRACT(metadata, '$._aggregate_id'))) STORED,
    aggregate_type VARCHAR(150) GENERATED ALWAYS AS (JSON_UNQUOTE(JSON_EXTRACT(metadata, '$._aggregate_type'))) STORED,
    PRIMARY KEY (no),
    UNIQUE KEY ix_event_id (event_id),
    UNIQUE KEY ix_unique_event (aggregate_type, aggregate_id, aggregate_version)
) ENGINE = InnoDB DEFAULT CHARSET = utf8mb4 COLLATE = utf8mb4_general_ci"#
        )]
    }

    fn column_names(&self) -> &'static [&'static str] {
        SINGLE_STREAM_COLUMNS
    }

    fn prepare_data(&self, events: &[EventEnvelope]) -> Result<Vec<EventRow>, Error> {
        Ok(events
            .iter()
            .map(|event| EventRow::from_envelope(event, None))
            .collect())
    }

    fn unique_violation_codes(&self) -> &'static [&'static str] {
        UNIQUE_VIOLATION_CODES
    }
}

/// Layout for a stream holding exactly one aggregate instance; `no` mirrors
/// `_aggregate_version`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateStreamStrategy;

impl PersistenceStrategy for AggregateStreamStrategy {
    fn create_schema(&self, table_name: &str) -> Vec<String> {
        vec![format!(
            r#"CREATE TABLE {table_name} (
    no BIGINT NOT NULL,
    event_id CHAR(36) COLLATE utf8mb4_bin NOT NULL,
    event_name VARCHAR(100) NOT NULL,
    payload JSON NOT NULL,
    metadata JSON NOT NULL,
    created_at CHAR(26) NOT NULL,
    aggregate_version INT UNSIGNED GENERATED ALWAYS AS (JSON_EXTRACT(metadata, '$._aggregate_version')) STORED,
    PRIMARY KEY (no),
    UNIQUE KEY ix_event_id (event_id),
    UNIQUE KEY ix_aggregate_version (aggregate_version)
) ENGINE = InnoDB DEFAULT CHARSET = utf8mb4 COLLATE = utf8mb4_general_ci"#
        )]
    }

    fn column_names(&self) -> &'static [&'static str] {
        AGGREGATE_STREAM_COLUMNS
    }

    fn prepare_data(&self, events: &[EventEnvelope]) -> Result<Vec<EventRow>, Error> {
        events
            .iter()
            .map(|event| {
                let no = event
                    .aggregate_version()
                    .ok_or(Error::MissingAggregateVersion)?;
                Ok(EventRow::from_envelope(event, Some(no)))
            })
            .collect()
    }

    fn unique_violation_codes(&self) -> &'static [&'static str] {
        UNIQUE_VIOLATION_CODES
    }
}
