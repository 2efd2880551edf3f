//! MySQL Event Store
//!
//! This module provides an implementation of the `EventStore` trait using
//! MySQL as the underlying storage. Each logical stream lives in its own
//! physical table whose layout is decided by the persistence strategy; a
//! registry table maps stream names to physical tables and holds the stream
//! metadata.
mod criteria;
mod insert;
pub(crate) mod strategy;
#[cfg(test)]
mod tests;

use async_stream::stream;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use chronicle::{
    EventEnvelope, EventStore, EventStream, MetadataMatcher, PersistedEvent, Stream, StreamName,
    CREATED_AT_FORMAT,
};
use criteria::CriteriaBuilder;
use futures::StreamExt;
use insert::InsertEventsBuilder;
use serde_json::{Map, Value};
use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::Row;
use uuid::Uuid;

use crate::event_store::strategy::PersistenceStrategy;
use crate::{Error, Migrator};

pub(crate) const DEFAULT_LOAD_BATCH_SIZE: u64 = 10_000;
pub(crate) const DEFAULT_STREAMS_TABLE: &str = "event_streams";

/// SQLSTATE reported by MySQL for a statement addressing a missing table.
const UNDEFINED_TABLE: &str = "42S02";
/// SQLSTATE reported for constraint violations, unique keys included.
const CONSTRAINT_VIOLATION: &str = "23000";

/// MySQL event store implementation.
#[derive(Debug, Clone)]
pub struct MySqlEventStore<PS> {
    pub(crate) pool: MySqlPool,
    strategy: PS,
    streams_table: String,
    load_batch_size: u64,
}

impl<PS> MySqlEventStore<PS>
where
    PS: PersistenceStrategy + Clone,
{
    /// Initializes the stream registry table and returns a new instance of
    /// `MySqlEventStore`.
    ///
    /// # Arguments
    ///
    /// * `pool` - The MySQL connection pool.
    /// * `strategy` - The table layout policy for streams.
    pub async fn try_new(pool: MySqlPool, strategy: PS) -> Result<Self, Error> {
        let event_store = Self::new_uninitialized(pool, strategy);
        Migrator::new(event_store.clone()).init_event_store().await?;
        Ok(event_store)
    }
}

impl<PS> MySqlEventStore<PS>
where
    PS: PersistenceStrategy,
{
    /// Creates a new instance of `MySqlEventStore` without touching the
    /// database.
    ///
    /// The stream registry table must already exist; use
    /// [`MySqlEventStore::try_new`] or run a [`Migrator`] to create it.
    pub fn new_uninitialized(pool: MySqlPool, strategy: PS) -> Self {
        Self {
            pool,
            strategy,
            streams_table: DEFAULT_STREAMS_TABLE.to_string(),
            load_batch_size: DEFAULT_LOAD_BATCH_SIZE,
        }
    }

    /// Overrides the number of rows fetched per page by load iterators.
    pub fn with_load_batch_size(mut self, load_batch_size: u64) -> Self {
        self.load_batch_size = load_batch_size.max(1);
        self
    }

    /// Overrides the name of the stream registry table.
    ///
    /// # Errors
    ///
    /// Fails when the name is not a plain `[A-Za-z0-9_]+` identifier.
    pub fn with_event_streams_table(mut self, table: impl Into<String>) -> Result<Self, Error> {
        let table = table.into();
        if !is_safe_identifier(&table) {
            return Err(Error::InvalidTableName(table));
        }
        self.streams_table = table;
        Ok(self)
    }

    pub(crate) fn streams_table(&self) -> &str {
        &self.streams_table
    }

    /// Appends `events` as a single multi-row insert on the given executor,
    /// participating in the caller's transaction when one is active.
    pub async fn append_to_with<'a, EX>(
        &self,
        executor: EX,
        stream_name: &StreamName,
        events: Vec<EventEnvelope>,
    ) -> Result<(), Error>
    where
        EX: sqlx::MySqlExecutor<'a>,
    {
        if events.is_empty() {
            return Ok(());
        }
        let table = self.strategy.table_name(stream_name);
        let rows = self.strategy.prepare_data(&events)?;
        let mut insert = InsertEventsBuilder::new(&table, self.strategy.column_names(), rows);
        insert
            .build()
            .execute(executor)
            .await
            .map_err(|err| self.map_append_err(stream_name, err))?;
        Ok(())
    }

    fn map_append_err(&self, stream_name: &StreamName, err: sqlx::Error) -> Error {
        if let sqlx::Error::Database(ref description) = err {
            if let Some(code) = description.code() {
                if self
                    .strategy
                    .unique_violation_codes()
                    .contains(&code.as_ref())
                {
                    return Error::Concurrency;
                }
                if code == UNDEFINED_TABLE {
                    return Error::StreamNotFound(stream_name.clone());
                }
            }
        }
        Error::Database(err)
    }

    async fn lookup_physical_table(&self, stream_name: &StreamName) -> Result<String, Error> {
        let table: Option<String> = sqlx::query_scalar(&format!(
            "SELECT stream_name FROM {} WHERE real_stream_name = ?",
            self.streams_table
        ))
        .bind(stream_name.as_str())
        .fetch_optional(&self.pool)
        .await?;
        table.ok_or_else(|| Error::StreamNotFound(stream_name.clone()))
    }

    async fn create_physical(
        &self,
        table: &str,
        stream_name: &StreamName,
        events: Vec<EventEnvelope>,
    ) -> Result<(), Error> {
        for statement in self.strategy.create_schema(table) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        self.append_to_with(&self.pool, stream_name, events).await
    }

    /// Opens the paged cursor over a stream table.
    ///
    /// Each page re-issues the SELECT with the position bound adjusted past
    /// the last row seen, until the requested count is produced or a page
    /// comes back empty.
    fn stream_rows(
        &self,
        table: String,
        from_no: i64,
        count: Option<u64>,
        criteria: Option<String>,
        order: Order,
    ) -> EventStream<Error> {
        let pool = self.pool.clone();
        let batch = self.load_batch_size;
        stream! {
            let filter = criteria.map(|criteria| format!(" AND {criteria}")).unwrap_or_default();
            let (comparison, direction) = match order {
                Order::Asc => (">=", "ASC"),
                Order::Desc => ("<=", "DESC"),
            };
            let sql = format!(
                "SELECT no, event_id, event_name, payload, metadata, created_at \
                 FROM {table} WHERE no {comparison} ?{filter} ORDER BY no {direction} LIMIT ?"
            );
            let mut from_no = from_no;
            let mut remaining = count;
            loop {
                if remaining == Some(0) || (order == Order::Desc && from_no < 1) {
                    break;
                }
                let limit = remaining.map_or(batch, |remaining| remaining.min(batch));
                let page = sqlx::query(&sql)
                    .bind(from_no)
                    .bind(limit as i64)
                    .fetch_all(&pool)
                    .await;
                let page = match page {
                    Ok(page) => page,
                    Err(err) => {
                        yield Err(Error::Database(err));
                        return;
                    }
                };
                if page.is_empty() {
                    break;
                }
                for row in page {
                    let event = match decode_row(&row) {
                        Ok(event) => event,
                        Err(err) => {
                            yield Err(err);
                            return;
                        }
                    };
                    from_no = match order {
                        Order::Asc => event.no() + 1,
                        Order::Desc => event.no() - 1,
                    };
                    if let Some(remaining) = remaining.as_mut() {
                        *remaining -= 1;
                    }
                    yield Ok(event);
                }
            }
        }
        .boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Order {
    Asc,
    Desc,
}

fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'_')
}

fn map_registry_insert_err(stream_name: &StreamName, err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(ref description) = err {
        if description.code().as_deref() == Some(CONSTRAINT_VIOLATION) {
            return Error::StreamExists(stream_name.clone());
        }
    }
    Error::Database(err)
}

fn decode_row(row: &MySqlRow) -> Result<PersistedEvent, Error> {
    let no: i64 = row.try_get("no")?;
    let event_id: String = row.try_get("event_id")?;
    let event_name: String = row.try_get("event_name")?;
    let payload: Value = row.try_get("payload")?;
    let metadata: Value = row.try_get("metadata")?;
    let created_at: String = row.try_get("created_at")?;

    let event_id = Uuid::parse_str(&event_id).map_err(|err| Error::Decode(Box::new(err)))?;
    let metadata = match metadata {
        Value::Object(map) => map,
        other => {
            return Err(Error::Decode(
                format!("metadata is not a JSON object: {other}").into(),
            ))
        }
    };
    let created_at = NaiveDateTime::parse_from_str(created_at.trim_end(), CREATED_AT_FORMAT)
        .map_err(|err| Error::Decode(Box::new(err)))?;

    let envelope = EventEnvelope::new(event_name, payload)
        .with_event_id(event_id)
        .with_metadata(metadata)
        .with_created_at(created_at);
    Ok(PersistedEvent::new(no, envelope))
}

/// Implementation of the event store using MySQL.
///
/// MySQL commits DDL implicitly, so `create` and `delete` cannot run fully
/// inside a transaction; failures after the DDL point are compensated by
/// dropping what was created, which preserves the absent-or-fully-present
/// invariant observationally.
#[async_trait]
impl<PS> EventStore for MySqlEventStore<PS>
where
    PS: PersistenceStrategy,
{
    type Error = Error;

    /// Creates the stream: registry row, physical table, and initial batch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamExists`] when the registry already holds the
    /// stream. Later failures drop the physical table and the registry row
    /// before surfacing.
    async fn create(&self, stream: Stream) -> Result<(), Error> {
        let (name, metadata, events) = stream.into_parts();
        let table = self.strategy.table_name(&name);
        sqlx::query(&format!(
            "INSERT INTO {} (real_stream_name, stream_name, metadata) VALUES (?, ?, ?)",
            self.streams_table
        ))
        .bind(name.as_str())
        .bind(&table)
        .bind(Value::Object(metadata))
        .execute(&self.pool)
        .await
        .map_err(|err| map_registry_insert_err(&name, err))?;

        if let Err(err) = self.create_physical(&table, &name, events).await {
            let _ = sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                .execute(&self.pool)
                .await;
            let _ = sqlx::query(&format!(
                "DELETE FROM {} WHERE real_stream_name = ?",
                self.streams_table
            ))
            .bind(name.as_str())
            .execute(&self.pool)
            .await;
            return Err(err);
        }
        Ok(())
    }

    /// Appends a batch of events to an existing stream.
    ///
    /// The batch is one `INSERT … VALUES (…),(…)` statement. A unique key
    /// rejecting any row maps to [`Error::Concurrency`] and no row of the
    /// batch becomes visible.
    async fn append_to(
        &self,
        stream_name: &StreamName,
        events: Vec<EventEnvelope>,
    ) -> Result<(), Error> {
        self.append_to_with(&self.pool, stream_name, events).await
    }

    /// Opens a lazy forward iterator over the stream.
    async fn load(
        &self,
        stream_name: &StreamName,
        from_no: i64,
        count: Option<u64>,
        matcher: Option<&MetadataMatcher>,
    ) -> Result<EventStream<Error>, Error> {
        let table = self.lookup_physical_table(stream_name).await?;
        let criteria = matcher
            .filter(|matcher| !matcher.is_empty())
            .map(|matcher| CriteriaBuilder::new(matcher).build());
        Ok(self.stream_rows(table, from_no, count, criteria, Order::Asc))
    }

    /// Opens a lazy reverse iterator over the stream.
    async fn load_reverse(
        &self,
        stream_name: &StreamName,
        from_no: i64,
        count: Option<u64>,
        matcher: Option<&MetadataMatcher>,
    ) -> Result<EventStream<Error>, Error> {
        let table = self.lookup_physical_table(stream_name).await?;
        let criteria = matcher
            .filter(|matcher| !matcher.is_empty())
            .map(|matcher| CriteriaBuilder::new(matcher).build());
        Ok(self.stream_rows(table, from_no, count, criteria, Order::Desc))
    }

    /// Deletes the stream: registry row, then the physical table.
    async fn delete(&self, stream_name: &StreamName) -> Result<(), Error> {
        let deleted = sqlx::query(&format!(
            "DELETE FROM {} WHERE real_stream_name = ?",
            self.streams_table
        ))
        .bind(stream_name.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if deleted == 0 {
            return Err(Error::StreamNotFound(stream_name.clone()));
        }
        let table = self.strategy.table_name(stream_name);
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn has_stream(&self, stream_name: &StreamName) -> Result<bool, Error> {
        // MySQL reports EXISTS as an integer.
        let exists: i64 = sqlx::query_scalar(&format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE real_stream_name = ?)",
            self.streams_table
        ))
        .bind(stream_name.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists != 0)
    }

    async fn fetch_stream_metadata(
        &self,
        stream_name: &StreamName,
    ) -> Result<Option<Map<String, Value>>, Error> {
        let metadata: Option<Value> = sqlx::query_scalar(&format!(
            "SELECT metadata FROM {} WHERE real_stream_name = ?",
            self.streams_table
        ))
        .bind(stream_name.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match metadata {
            None => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(other) => Err(Error::Decode(
                format!("stream metadata is not a JSON object: {other}").into(),
            )),
        }
    }

    async fn update_stream_metadata(
        &self,
        stream_name: &StreamName,
        metadata: Map<String, Value>,
    ) -> Result<(), Error> {
        // rows_affected is 0 for a no-change UPDATE on MySQL, so existence
        // has to be checked separately.
        if !self.has_stream(stream_name).await? {
            return Err(Error::StreamNotFound(stream_name.clone()));
        }
        sqlx::query(&format!(
            "UPDATE {} SET metadata = ? WHERE real_stream_name = ?",
            self.streams_table
        ))
        .bind(Value::Object(metadata))
        .bind(stream_name.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_stream_names(&self) -> Result<Vec<StreamName>, Error> {
        let names: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT real_stream_name FROM {} ORDER BY real_stream_name",
            self.streams_table
        ))
        .fetch_all(&self.pool)
        .await?;
        names
            .into_iter()
            .map(|name| StreamName::new(name).map_err(|err| Error::Decode(Box::new(err))))
            .collect()
    }
}
