#![doc = include_str!("../README.md")]

mod envelope;
mod event_store;
mod matcher;
mod middleware;
mod projection;
mod stream_name;
pub mod testing;

#[doc(inline)]
pub use crate::envelope::{EventEnvelope, PersistedEvent, CREATED_AT_FORMAT};
#[doc(inline)]
pub use crate::event_store::{EventStore, EventStream, Stream};
#[doc(inline)]
pub use crate::matcher::{Constraint, FieldKind, MatcherError, MetadataMatcher, Operator};
#[doc(inline)]
pub use crate::middleware::TracingEventStore;
#[doc(inline)]
pub use crate::projection::{Handler, ProjectionError, Query, QueryBuilder, QueryControl};
#[doc(inline)]
pub use crate::stream_name::{StreamName, StreamNameError};

pub type BoxDynError = Box<dyn std::error::Error + 'static + Send + Sync>;
