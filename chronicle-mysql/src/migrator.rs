//! Database initialization utilities for the `MySqlEventStore`.
//!
//! The only schema the store needs up front is the stream registry table;
//! physical stream tables are created by `create` as streams come into
//! existence.
use crate::event_store::strategy::PersistenceStrategy;
use crate::{Error, MySqlEventStore};

/// Helper for initializing the `MySqlEventStore` database schema.
pub struct Migrator<PS>
where
    PS: PersistenceStrategy,
{
    event_store: MySqlEventStore<PS>,
}

impl<PS> Migrator<PS>
where
    PS: PersistenceStrategy,
{
    pub fn new(event_store: MySqlEventStore<PS>) -> Self {
        Self { event_store }
    }

    /// Creates the stream registry table when absent.
    pub async fn init_event_store(&self) -> Result<(), Error> {
        let statement = format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
    no BIGINT NOT NULL AUTO_INCREMENT,
    real_stream_name VARCHAR(150) NOT NULL,
    stream_name CHAR(41) NOT NULL,
    metadata JSON,
    PRIMARY KEY (no),
    UNIQUE KEY ix_rsn (real_stream_name),
    UNIQUE KEY ix_sn (stream_name)
) ENGINE = InnoDB DEFAULT CHARSET = utf8mb4 COLLATE = utf8mb4_general_ci"#,
            self.event_store.streams_table()
        );
        sqlx::query(&statement)
            .execute(&self.event_store.pool)
            .await?;
        Ok(())
    }
}
