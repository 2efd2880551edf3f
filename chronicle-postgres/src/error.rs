use chronicle::{BoxDynError, StreamName};
use thiserror::Error;

/// Represents all the ways a method can fail within Chronicle Postgres.
#[derive(Error, Debug)]
pub enum Error {
    /// Error returned from the database.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    /// A stream creation hit an existing stream.
    #[error("stream {0} already exists")]
    StreamExists(StreamName),
    /// The addressed stream has no registry entry.
    #[error("stream {0} not found")]
    StreamNotFound(StreamName),
    /// A unique constraint rejected an append: an event id collision or an
    /// aggregate version written twice.
    #[error("concurrent append conflict")]
    Concurrency,
    /// A stored row could not be decoded into an event envelope.
    #[error("event decoding error: {0}")]
    Decode(#[source] BoxDynError),
    /// The aggregate stream layout derives positions from the
    /// `_aggregate_version` metadata entry, which the event lacks.
    #[error("missing or non-integral _aggregate_version metadata entry")]
    MissingAggregateVersion,
    /// The configured registry table name is not a safe SQL identifier.
    #[error("invalid table name {0:?}")]
    InvalidTableName(String),
}
