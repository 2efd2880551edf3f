//! # PostgreSQL Chronicle Backend Library
mod error;
mod event_store;
mod migrator;

pub use crate::event_store::strategy::{
    AggregateStreamStrategy, EventRow, PersistenceStrategy, SingleStreamStrategy,
};
pub use crate::event_store::PgEventStore;
pub use crate::migrator::Migrator;
pub use error::Error;
