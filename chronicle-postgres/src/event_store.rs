//! PostgreSQL Event Store
//!
//! This module provides an implementation of the `EventStore` trait using
//! PostgreSQL as the underlying storage. Each logical stream lives in its own
//! physical table whose layout is decided by the persistence strategy; a
//! registry table maps stream names to physical tables and holds the stream
//! metadata.
mod criteria;
mod insert;
pub(crate) mod strategy;

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
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::event_store::strategy::PersistenceStrategy;
use crate::{Error, Migrator};

pub(crate) const DEFAULT_LOAD_BATCH_SIZE: u64 = 10_000;
pub(crate) const DEFAULT_STREAMS_TABLE: &str = "event_streams";

/// SQLSTATE reported by PostgreSQL for a statement addressing a missing table.
const UNDEFINED_TABLE: &str = "42P01";
/// SQLSTATE reported for a unique-constraint violation.
const UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL event store implementation.
#[derive(Debug, Clone)]
pub struct PgEventStore<PS> {
    pub(crate) pool: PgPool,
    strategy: PS,
    streams_table: String,
    load_batch_size: u64,
}

impl<PS> PgEventStore<PS>
where
    PS: PersistenceStrategy + Clone,
{
    /// Initializes the stream registry table and returns a new instance of
    /// `PgEventStore`.
    ///
    /// # Arguments
    ///
    /// * `pool` - The PostgreSQL connection pool.
    /// * `strategy` - The table layout policy for streams.
    pub async fn try_new(pool: PgPool, strategy: PS) -> Result<Self, Error> {
        let event_store = Self::new_uninitialized(pool, strategy);
        Migrator::new(event_store.clone()).init_event_store().await?;
        Ok(event_store)
    }
}

impl<PS> PgEventStore<PS>
where
    PS: PersistenceStrategy,
{
    /// Creates a new instance of `PgEventStore` without touching the
    /// database.
    ///
    /// The stream registry table must already exist; use
    /// [`PgEventStore::try_new`] or run a [`Migrator`] to create it.
    pub fn new_uninitialized(pool: PgPool, strategy: PS) -> Self {
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
    ///
    /// # Arguments
    ///
    /// * `executor` - The sqlx executor to use for the insert.
    /// * `stream_name` - The stream to extend.
    /// * `events` - The events to append; an empty batch is a no-op.
    pub async fn append_to_with<'a, EX>(
        &self,
        executor: EX,
        stream_name: &StreamName,
        events: Vec<EventEnvelope>,
    ) -> Result<(), Error>
    where
        EX: sqlx::PgExecutor<'a>,
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

    /// Creates the registry row, the physical table, and the initial batch on
    /// the given connection; the caller owns the surrounding transaction.
    pub async fn create_with(&self, conn: &mut PgConnection, stream: Stream) -> Result<(), Error> {
        let (name, metadata, events) = stream.into_parts();
        let table = self.strategy.table_name(&name);
        sqlx::query(&format!(
            "INSERT INTO {} (real_stream_name, stream_name, metadata) VALUES ($1, $2, $3)",
            self.streams_table
        ))
        .bind(name.as_str())
        .bind(&table)
        .bind(Value::Object(metadata))
        .execute(&mut *conn)
        .await
        .map_err(|err| map_registry_insert_err(&name, err))?;

        for statement in self.strategy.create_schema(&table) {
            sqlx::query(&statement).execute(&mut *conn).await?;
        }
        self.append_to_with(&mut *conn, &name, events).await
    }

    /// Removes the registry row and drops the physical table on the given
    /// connection; the caller owns the surrounding transaction.
    pub async fn delete_with(
        &self,
        conn: &mut PgConnection,
        stream_name: &StreamName,
    ) -> Result<(), Error> {
        let deleted = sqlx::query(&format!(
            "DELETE FROM {} WHERE real_stream_name = $1",
            self.streams_table
        ))
        .bind(stream_name.as_str())
        .execute(&mut *conn)
        .await?
        .rows_affected();
        if deleted == 0 {
            return Err(Error::StreamNotFound(stream_name.clone()));
        }
        let table = self.strategy.table_name(stream_name);
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&mut *conn)
            .await?;
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
            "SELECT stream_name FROM {} WHERE real_stream_name = $1",
            self.streams_table
        ))
        .bind(stream_name.as_str())
        .fetch_optional(&self.pool)
        .await?;
        table.ok_or_else(|| Error::StreamNotFound(stream_name.clone()))
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
                 FROM {table} WHERE no {comparison} $1{filter} ORDER BY no {direction} LIMIT $2"
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
        if description.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return Error::StreamExists(stream_name.clone());
        }
    }
    Error::Database(err)
}

fn decode_row(row: &PgRow) -> Result<PersistedEvent, Error> {
    let no: i64 = row.try_get("no")?;
    let event_id: Uuid = row.try_get("event_id")?;
    let event_name: String = row.try_get("event_name")?;
    let payload: Value = row.try_get("payload")?;
    let metadata: Value = row.try_get("metadata")?;
    let created_at: String = row.try_get("created_at")?;

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

/// Implementation of the event store using PostgreSQL.
///
/// `create` and `delete` run in their own transaction; `append_to` is a
/// single prepared statement. Use the `*_with` variants to participate in a
/// caller-managed transaction instead.
#[async_trait]
impl<PS> EventStore for PgEventStore<PS>
where
    PS: PersistenceStrategy,
{
    type Error = Error;

    /// Creates the stream: registry row, physical table, and initial batch,
    /// all in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamExists`] when the registry already holds the
    /// stream; nothing is left behind in that case.
    async fn create(&self, stream: Stream) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        self.create_with(&mut tx, stream).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Appends a batch of events to an existing stream.
    ///
    /// The batch is one `INSERT … VALUES (…),(…)` statement. A unique
    /// constraint rejecting any row maps to [`Error::Concurrency`] and no row
    /// of the batch becomes visible.
    async fn append_to(
        &self,
        stream_name: &StreamName,
        events: Vec<EventEnvelope>,
    ) -> Result<(), Error> {
        self.append_to_with(&self.pool, stream_name, events).await
    }

    /// Opens a lazy forward iterator over the stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamNotFound`] when the stream has no registry
    /// entry. An exhausted position range is not an error: the iterator just
    /// yields nothing.
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

    /// Deletes the stream: registry row and physical table, in one
    /// transaction.
    async fn delete(&self, stream_name: &StreamName) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        self.delete_with(&mut tx, stream_name).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn has_stream(&self, stream_name: &StreamName) -> Result<bool, Error> {
        let exists: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE real_stream_name = $1)",
            self.streams_table
        ))
        .bind(stream_name.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn fetch_stream_metadata(
        &self,
        stream_name: &StreamName,
    ) -> Result<Option<Map<String, Value>>, Error> {
        let metadata: Option<Value> = sqlx::query_scalar(&format!(
            "SELECT metadata FROM {} WHERE real_stream_name = $1",
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
        let updated = sqlx::query(&format!(
            "UPDATE {} SET metadata = $2 WHERE real_stream_name = $1",
            self.streams_table
        ))
        .bind(stream_name.as_str())
        .bind(Value::Object(metadata))
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(Error::StreamNotFound(stream_name.clone()));
        }
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
