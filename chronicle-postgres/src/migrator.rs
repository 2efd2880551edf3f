//! Database initialization utilities for the `PgEventStore`.
//!
//! The only schema the store needs up front is the stream registry table;
//! physical stream tables are created by `create` as streams come into
//! existence. The migrator is typically executed during application startup
//! or via dedicated administrative tooling.
use crate::event_store::strategy::PersistenceStrategy;
use crate::{Error, PgEventStore};

/// Helper for initializing the `PgEventStore` database schema.
pub struct Migrator<PS>
where
    PS: PersistenceStrategy,
{
    event_store: PgEventStore<PS>,
}

impl<PS> Migrator<PS>
where
    PS: PersistenceStrategy,
{
    pub fn new(event_store: PgEventStore<PS>) -> Self {
        Self { event_store }
    }

    /// Creates the stream registry table when absent.
    pub async fn init_event_store(&self) -> Result<(), Error> {
        let statement = format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
    no BIGSERIAL,
    real_stream_name VARCHAR(150) NOT NULL,
    stream_name CHAR(41) NOT NULL,
    metadata JSONB,
    PRIMARY KEY (no),
    UNIQUE (stream_name),
    UNIQUE (real_stream_name)
)"#,
            self.event_store.streams_table()
        );
        sqlx::query(&statement)
            .execute(&self.event_store.pool)
            .await?;
        Ok(())
    }
}
