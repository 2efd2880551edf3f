//! In-memory event store for tests.
//!
//! [`InMemoryEventStore`] implements the full [`EventStore`] contract with
//! the same observable behavior as the database backends: dense positions
//! starting at 1, unique event ids and aggregate keys per stream, matcher
//! filtering, bounded and reverse loads. It backs the projection-engine tests
//! of this crate and is exported so downstream crates can test their folds
//! without a database.
use crate::envelope::{
    EventEnvelope, PersistedEvent, AGGREGATE_ID_KEY, AGGREGATE_TYPE_KEY, AGGREGATE_VERSION_KEY,
};
use crate::event_store::{EventStore, EventStream, Stream};
use crate::matcher::MetadataMatcher;
use crate::stream_name::StreamName;
use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Errors raised by the in-memory store, mirroring the backend error kinds.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InMemoryError {
    /// A stream creation hit an existing stream.
    #[error("stream {0} already exists")]
    StreamExists(StreamName),
    /// The addressed stream does not exist.
    #[error("stream {0} not found")]
    StreamNotFound(StreamName),
    /// An append collided on an event id or an aggregate key.
    #[error("concurrent append conflict")]
    Concurrency,
}

#[derive(Debug, Default)]
struct StoredStream {
    metadata: Map<String, Value>,
    events: Vec<PersistedEvent>,
    next_no: i64,
}

impl StoredStream {
    fn new(metadata: Map<String, Value>) -> Self {
        Self {
            metadata,
            events: Vec::new(),
            next_no: 1,
        }
    }

    fn append(&mut self, events: Vec<EventEnvelope>) -> Result<(), InMemoryError> {
        for (index, event) in events.iter().enumerate() {
            let conflicted = self
                .events
                .iter()
                .map(|persisted| &**persisted)
                .chain(events[..index].iter())
                .any(|existing| conflicts(existing, event));
            if conflicted {
                return Err(InMemoryError::Concurrency);
            }
        }
        for event in events {
            let no = self.next_no;
            self.next_no += 1;
            self.events.push(PersistedEvent::new(no, event));
        }
        Ok(())
    }
}

fn conflicts(existing: &EventEnvelope, incoming: &EventEnvelope) -> bool {
    if existing.event_id() == incoming.event_id() {
        return true;
    }
    [AGGREGATE_VERSION_KEY, AGGREGATE_ID_KEY, AGGREGATE_TYPE_KEY]
        .iter()
        .all(|key| {
            matches!(
                (existing.metadata_value(key), incoming.metadata_value(key)),
                (Some(a), Some(b)) if a == b
            )
        })
}

/// A fully in-process [`EventStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventStore {
    streams: Arc<Mutex<HashMap<StreamName, StoredStream>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<StreamName, StoredStream>> {
        self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    type Error = InMemoryError;

    async fn create(&self, stream: Stream) -> Result<(), InMemoryError> {
        let (name, metadata, events) = stream.into_parts();
        let mut streams = self.lock();
        match streams.entry(name) {
            Entry::Occupied(occupied) => Err(InMemoryError::StreamExists(occupied.key().clone())),
            Entry::Vacant(vacant) => {
                let mut stored = StoredStream::new(metadata);
                stored.append(events)?;
                vacant.insert(stored);
                Ok(())
            }
        }
    }

    async fn append_to(
        &self,
        stream_name: &StreamName,
        events: Vec<EventEnvelope>,
    ) -> Result<(), InMemoryError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut streams = self.lock();
        let stored = streams
            .get_mut(stream_name)
            .ok_or_else(|| InMemoryError::StreamNotFound(stream_name.clone()))?;
        stored.append(events)
    }

    async fn load(
        &self,
        stream_name: &StreamName,
        from_no: i64,
        count: Option<u64>,
        matcher: Option<&MetadataMatcher>,
    ) -> Result<EventStream<InMemoryError>, InMemoryError> {
        let streams = self.lock();
        let stored = streams
            .get(stream_name)
            .ok_or_else(|| InMemoryError::StreamNotFound(stream_name.clone()))?;
        let mut selected: Vec<PersistedEvent> = stored
            .events
            .iter()
            .filter(|event| event.no() >= from_no)
            .filter(|event| matcher.map_or(true, |matcher| matcher.matches(event)))
            .cloned()
            .collect();
        if let Some(count) = count {
            selected.truncate(count as usize);
        }
        Ok(stream::iter(selected.into_iter().map(Ok)).boxed())
    }

    async fn load_reverse(
        &self,
        stream_name: &StreamName,
        from_no: i64,
        count: Option<u64>,
        matcher: Option<&MetadataMatcher>,
    ) -> Result<EventStream<InMemoryError>, InMemoryError> {
        let streams = self.lock();
        let stored = streams
            .get(stream_name)
            .ok_or_else(|| InMemoryError::StreamNotFound(stream_name.clone()))?;
        let mut selected: Vec<PersistedEvent> = stored
            .events
            .iter()
            .rev()
            .filter(|event| event.no() <= from_no)
            .filter(|event| matcher.map_or(true, |matcher| matcher.matches(event)))
            .cloned()
            .collect();
        if let Some(count) = count {
            selected.truncate(count as usize);
        }
        Ok(stream::iter(selected.into_iter().map(Ok)).boxed())
    }

    async fn delete(&self, stream_name: &StreamName) -> Result<(), InMemoryError> {
        self.lock()
            .remove(stream_name)
            .map(|_| ())
            .ok_or_else(|| InMemoryError::StreamNotFound(stream_name.clone()))
    }

    async fn has_stream(&self, stream_name: &StreamName) -> Result<bool, InMemoryError> {
        Ok(self.lock().contains_key(stream_name))
    }

    async fn fetch_stream_metadata(
        &self,
        stream_name: &StreamName,
    ) -> Result<Option<Map<String, Value>>, InMemoryError> {
        Ok(self.lock().get(stream_name).map(|stored| stored.metadata.clone()))
    }

    async fn update_stream_metadata(
        &self,
        stream_name: &StreamName,
        metadata: Map<String, Value>,
    ) -> Result<(), InMemoryError> {
        let mut streams = self.lock();
        let stored = streams
            .get_mut(stream_name)
            .ok_or_else(|| InMemoryError::StreamNotFound(stream_name.clone()))?;
        stored.metadata = metadata;
        Ok(())
    }

    async fn fetch_stream_names(&self) -> Result<Vec<StreamName>, InMemoryError> {
        let mut names: Vec<StreamName> = self.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
