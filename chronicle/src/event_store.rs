//! Event store contract shared by the storage backends.
//!
//! The store persists immutable events into named streams and reads them back
//! as lazy, ordered sequences. Implementations handle stream lifecycle,
//! transactional appends with concurrency detection, and paged forward and
//! reverse reads.
use crate::envelope::{EventEnvelope, PersistedEvent};
use crate::matcher::MetadataMatcher;
use crate::stream_name::StreamName;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{Map, Value};

/// A lazy, fallible sequence of persisted events.
pub type EventStream<E> = BoxStream<'static, Result<PersistedEvent, E>>;

/// Creation payload of a stream: its name, opaque metadata persisted once at
/// creation, and the initial batch of events.
#[derive(Debug, Clone, PartialEq)]
pub struct Stream {
    name: StreamName,
    metadata: Map<String, Value>,
    events: Vec<EventEnvelope>,
}

impl Stream {
    /// Creates an empty stream payload with the given name.
    pub fn new(name: StreamName) -> Self {
        Self {
            name,
            metadata: Map::new(),
            events: Vec::new(),
        }
    }

    /// Sets the stream metadata.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Sets the initial batch of events.
    pub fn with_events(mut self, events: Vec<EventEnvelope>) -> Self {
        self.events = events;
        self
    }

    pub fn name(&self) -> &StreamName {
        &self.name
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn events(&self) -> &[EventEnvelope] {
        &self.events
    }

    /// Decomposes the payload into name, metadata, and events.
    pub fn into_parts(self) -> (StreamName, Map<String, Value>, Vec<EventEnvelope>) {
        (self.name, self.metadata, self.events)
    }
}

/// An append-only event store.
///
/// This trait provides methods for creating, extending, reading, and
/// destroying event streams. Implementations should make `create` atomic
/// (registry entry, physical storage, and initial batch all-or-nothing) and
/// report conflicting appends as their concurrency error.
#[async_trait]
pub trait EventStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates the stream and persists its initial batch atomically.
    ///
    /// # Errors
    ///
    /// Fails when a stream with the same name already exists.
    async fn create(&self, stream: Stream) -> Result<(), Self::Error>;

    /// Appends a batch of events to an existing stream.
    ///
    /// An empty batch is a no-op success. The whole batch becomes visible
    /// atomically; a unique-constraint conflict surfaces as the
    /// implementation's concurrency error and leaves nothing behind.
    async fn append_to(
        &self,
        stream_name: &StreamName,
        events: Vec<EventEnvelope>,
    ) -> Result<(), Self::Error>;

    /// Opens a lazy forward iterator over a stream.
    ///
    /// Yields events with position `>= from_no` in ascending order, at most
    /// `count` of them (`None` means unbounded), skipping events rejected by
    /// the `matcher`. A stream without matching events yields nothing; a
    /// missing stream is an error.
    async fn load(
        &self,
        stream_name: &StreamName,
        from_no: i64,
        count: Option<u64>,
        matcher: Option<&MetadataMatcher>,
    ) -> Result<EventStream<Self::Error>, Self::Error>;

    /// Opens a lazy reverse iterator over a stream.
    ///
    /// Yields events with position `<= from_no` in descending order. Pass
    /// `i64::MAX` to start at the newest event.
    async fn load_reverse(
        &self,
        stream_name: &StreamName,
        from_no: i64,
        count: Option<u64>,
        matcher: Option<&MetadataMatcher>,
    ) -> Result<EventStream<Self::Error>, Self::Error>;

    /// Deletes the stream: registry entry and physical storage.
    async fn delete(&self, stream_name: &StreamName) -> Result<(), Self::Error>;

    /// Whether the stream exists.
    async fn has_stream(&self, stream_name: &StreamName) -> Result<bool, Self::Error>;

    /// The metadata persisted at stream creation, or `None` for an absent
    /// stream.
    async fn fetch_stream_metadata(
        &self,
        stream_name: &StreamName,
    ) -> Result<Option<Map<String, Value>>, Self::Error>;

    /// Replaces the stream metadata.
    async fn update_stream_metadata(
        &self,
        stream_name: &StreamName,
        metadata: Map<String, Value>,
    ) -> Result<(), Self::Error>;

    /// The names of all streams known to the registry, sorted, internal
    /// streams included.
    async fn fetch_stream_names(&self) -> Result<Vec<StreamName>, Self::Error>;
}
