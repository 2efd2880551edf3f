//! Middleware decorators over the event store.
//!
//! Interception points (logging, metrics, transaction bookkeeping) are plain
//! decorators: implement [`EventStore`] for a wrapper type and delegate.
//! Decorators compose, so a chain is just nested wrappers.
use crate::envelope::EventEnvelope;
use crate::event_store::{EventStore, EventStream, Stream};
use crate::matcher::MetadataMatcher;
use crate::stream_name::StreamName;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Decorator that emits a `tracing` record around every store operation.
///
/// Reads are logged when they are opened; mutations also log their outcome.
#[derive(Debug, Clone)]
pub struct TracingEventStore<ES> {
    inner: ES,
}

impl<ES> TracingEventStore<ES> {
    pub fn new(inner: ES) -> Self {
        Self { inner }
    }

    /// Returns the wrapped store.
    pub fn into_inner(self) -> ES {
        self.inner
    }
}

#[async_trait]
impl<ES> EventStore for TracingEventStore<ES>
where
    ES: EventStore,
{
    type Error = ES::Error;

    async fn create(&self, stream: Stream) -> Result<(), Self::Error> {
        debug!(stream = %stream.name(), events = stream.events().len(), "creating stream");
        self.inner.create(stream).await.inspect_err(|err| {
            warn!(error = %err, "stream creation failed");
        })
    }

    async fn append_to(
        &self,
        stream_name: &StreamName,
        events: Vec<EventEnvelope>,
    ) -> Result<(), Self::Error> {
        debug!(stream = %stream_name, events = events.len(), "appending events");
        self.inner
            .append_to(stream_name, events)
            .await
            .inspect_err(|err| {
                warn!(stream = %stream_name, error = %err, "append failed");
            })
    }

    async fn load(
        &self,
        stream_name: &StreamName,
        from_no: i64,
        count: Option<u64>,
        matcher: Option<&MetadataMatcher>,
    ) -> Result<EventStream<Self::Error>, Self::Error> {
        debug!(stream = %stream_name, from_no, "loading stream");
        self.inner.load(stream_name, from_no, count, matcher).await
    }

    async fn load_reverse(
        &self,
        stream_name: &StreamName,
        from_no: i64,
        count: Option<u64>,
        matcher: Option<&MetadataMatcher>,
    ) -> Result<EventStream<Self::Error>, Self::Error> {
        debug!(stream = %stream_name, from_no, "loading stream in reverse");
        self.inner
            .load_reverse(stream_name, from_no, count, matcher)
            .await
    }

    async fn delete(&self, stream_name: &StreamName) -> Result<(), Self::Error> {
        debug!(stream = %stream_name, "deleting stream");
        self.inner.delete(stream_name).await.inspect_err(|err| {
            warn!(stream = %stream_name, error = %err, "stream deletion failed");
        })
    }

    async fn has_stream(&self, stream_name: &StreamName) -> Result<bool, Self::Error> {
        self.inner.has_stream(stream_name).await
    }

    async fn fetch_stream_metadata(
        &self,
        stream_name: &StreamName,
    ) -> Result<Option<Map<String, Value>>, Self::Error> {
        self.inner.fetch_stream_metadata(stream_name).await
    }

    async fn update_stream_metadata(
        &self,
        stream_name: &StreamName,
        metadata: Map<String, Value>,
    ) -> Result<(), Self::Error> {
        debug!(stream = %stream_name, "updating stream metadata");
        self.inner.update_stream_metadata(stream_name, metadata).await
    }

    async fn fetch_stream_names(&self) -> Result<Vec<StreamName>, Self::Error> {
        self.inner.fetch_stream_names().await
    }
}
