//! Stateful queries folded over one or more event streams.
//!
//! A [`Query`] composes an initial-state factory, exactly one stream
//! selector, and a set of event handlers, then drives the fold to completion:
//! it opens a forward iterator per selected stream, interleaves them fairly,
//! and hands every event to the matching handler together with the mutable
//! state. Cursors are kept in memory, so a later [`Query::run`] resumes where
//! the previous one stopped, and [`Query::reset`] starts over from scratch.
//!
//! Handlers stop the fold cooperatively through [`QueryControl::stop`]: the
//! current handler finishes, the loop exits before the next event.
use crate::envelope::PersistedEvent;
use crate::event_store::{EventStore, EventStream};
use crate::stream_name::StreamName;
use crate::BoxDynError;
use futures::StreamExt;
use std::collections::HashMap;
use thiserror::Error;

/// Represents all the ways defining or running a query can fail.
#[derive(Debug, Error)]
pub enum ProjectionError<E> {
    /// Failure raised by the underlying event store.
    #[error(transparent)]
    Store(E),
    /// Failure raised by a user-provided event handler.
    #[error("event handler failed: {0}")]
    Handler(#[source] BoxDynError),
    /// The query definition is incomplete or contradictory.
    #[error("invalid query definition: {0}")]
    Definition(&'static str),
}

/// Cooperative run control handed to event handlers.
#[derive(Debug, Default)]
pub struct QueryControl {
    stopped: bool,
}

impl QueryControl {
    /// Requests the run loop to exit after the current handler returns.
    ///
    /// Handlers for later events are not invoked during this run; the next
    /// run resumes right after the event being handled.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

/// An event handler: mutates the state from one persisted event.
pub type Handler<S> =
    Box<dyn FnMut(&mut S, PersistedEvent, &mut QueryControl) -> Result<(), BoxDynError> + Send>;

#[derive(Debug, Clone)]
enum Selector {
    Stream(StreamName),
    Streams(Vec<StreamName>),
    Category(String),
    Categories(Vec<String>),
    All,
}

enum Handlers<S> {
    ByName(HashMap<String, Handler<S>>),
    Any(Handler<S>),
}

/// Builder composing the parts of a [`Query`].
///
/// Exactly one `from_*` selector must be chosen, and handlers must be
/// registered either per event name with [`QueryBuilder::when`] or for every
/// event with [`QueryBuilder::when_any`]; `build` reports violations as
/// [`ProjectionError::Definition`].
pub struct QueryBuilder<S, ES> {
    store: ES,
    init: Box<dyn Fn() -> S + Send>,
    selector: Option<Selector>,
    by_name: HashMap<String, Handler<S>>,
    any: Option<Handler<S>>,
    defect: Option<&'static str>,
}

impl<S, ES> QueryBuilder<S, ES>
where
    ES: EventStore,
{
    /// Starts a query definition over the given store with an initial-state
    /// factory.
    pub fn new(store: ES, init: impl Fn() -> S + Send + 'static) -> Self {
        Self {
            store,
            init: Box::new(init),
            selector: None,
            by_name: HashMap::new(),
            any: None,
            defect: None,
        }
    }

    fn select(mut self, selector: Selector) -> Self {
        if self.selector.is_some() {
            self.defect.get_or_insert("a stream selector was already chosen");
        } else {
            self.selector = Some(selector);
        }
        self
    }

    /// Selects the events of a single stream, in order.
    pub fn from_stream(self, name: StreamName) -> Self {
        self.select(Selector::Stream(name))
    }

    /// Selects the listed streams, interleaved fairly: one event per
    /// non-exhausted stream per round.
    pub fn from_streams(self, names: impl IntoIterator<Item = StreamName>) -> Self {
        self.select(Selector::Streams(names.into_iter().collect()))
    }

    /// Selects every non-internal stream whose name starts with
    /// `"<category>-"`. The selection set is computed when `run` starts.
    pub fn from_category(self, category: impl Into<String>) -> Self {
        self.select(Selector::Category(category.into()))
    }

    /// Selects every non-internal stream belonging to any of the categories.
    pub fn from_categories(
        self,
        categories: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.select(Selector::Categories(
            categories.into_iter().map(Into::into).collect(),
        ))
    }

    /// Selects every stream whose name does not start with `$`.
    pub fn from_all(self) -> Self {
        self.select(Selector::All)
    }

    /// Registers a handler for events whose name equals `event_name`.
    ///
    /// Selected events with no registered handler are skipped but still
    /// advance the cursor.
    pub fn when(
        mut self,
        event_name: impl Into<String>,
        handler: impl FnMut(&mut S, PersistedEvent, &mut QueryControl) -> Result<(), BoxDynError>
            + Send
            + 'static,
    ) -> Self {
        if self.any.is_some() {
            self.defect.get_or_insert("when cannot be combined with when_any");
            return self;
        }
        let event_name = event_name.into();
        if self.by_name.contains_key(&event_name) {
            self.defect.get_or_insert("an event name was registered twice");
            return self;
        }
        self.by_name.insert(event_name, Box::new(handler));
        self
    }

    /// Registers a single handler applied to every selected event.
    pub fn when_any(
        mut self,
        handler: impl FnMut(&mut S, PersistedEvent, &mut QueryControl) -> Result<(), BoxDynError>
            + Send
            + 'static,
    ) -> Self {
        if self.any.is_some() || !self.by_name.is_empty() {
            self.defect.get_or_insert("when_any cannot be combined with other handlers");
            return self;
        }
        self.any = Some(Box::new(handler));
        self
    }

    /// Finalizes the definition.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Definition`] when no selector was chosen,
    /// no handler was registered, or conflicting calls were made.
    pub fn build(self) -> Result<Query<S, ES>, ProjectionError<ES::Error>> {
        if let Some(defect) = self.defect {
            return Err(ProjectionError::Definition(defect));
        }
        let selector = self
            .selector
            .ok_or(ProjectionError::Definition("no stream selector was chosen"))?;
        let handlers = match self.any {
            Some(any) => Handlers::Any(any),
            None if !self.by_name.is_empty() => Handlers::ByName(self.by_name),
            None => return Err(ProjectionError::Definition("no event handlers were registered")),
        };
        let state = (self.init)();
        Ok(Query {
            store: self.store,
            selector,
            handlers,
            init: self.init,
            state,
            positions: HashMap::new(),
        })
    }
}

/// A runnable stateful fold over the selected streams.
pub struct Query<S, ES> {
    store: ES,
    selector: Selector,
    handlers: Handlers<S>,
    init: Box<dyn Fn() -> S + Send>,
    state: S,
    positions: HashMap<StreamName, i64>,
}

impl<S, ES> Query<S, ES>
where
    ES: EventStore,
{
    /// The current folded state.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// The remembered cursor of a stream: the position of the last event it
    /// successfully processed.
    pub fn position(&self, stream_name: &StreamName) -> Option<i64> {
        self.positions.get(stream_name).copied()
    }

    /// Drops state and cursors; the next `run` re-reads every stream from the
    /// start.
    pub fn reset(&mut self) {
        self.state = (self.init)();
        self.positions.clear();
    }

    /// Runs the fold until every selected stream is exhausted or a handler
    /// stops it.
    ///
    /// # Errors
    ///
    /// Store failures and handler faults end the run immediately; cursors
    /// keep the last successfully processed position, so the next `run`
    /// reprocesses the failing event.
    pub async fn run(&mut self) -> Result<(), ProjectionError<ES::Error>> {
        let selection = self.selection().await.map_err(ProjectionError::Store)?;
        let mut active: Vec<(StreamName, EventStream<ES::Error>)> =
            Vec::with_capacity(selection.len());
        for name in selection {
            let from = self.positions.get(&name).copied().unwrap_or(0) + 1;
            let events = self
                .store
                .load(&name, from, None, None)
                .await
                .map_err(ProjectionError::Store)?;
            active.push((name, events));
        }

        let mut control = QueryControl::default();
        while !active.is_empty() && !control.is_stopped() {
            let mut index = 0;
            while index < active.len() {
                match active[index].1.next().await {
                    None => {
                        active.remove(index);
                    }
                    Some(Err(err)) => return Err(ProjectionError::Store(err)),
                    Some(Ok(event)) => {
                        let no = event.no();
                        Self::apply(&mut self.handlers, &mut self.state, event, &mut control)?;
                        self.positions.insert(active[index].0.clone(), no);
                        index += 1;
                    }
                }
                if control.is_stopped() {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn selection(&self) -> Result<Vec<StreamName>, ES::Error> {
        match &self.selector {
            Selector::Stream(name) => Ok(vec![name.clone()]),
            Selector::Streams(names) => Ok(names.clone()),
            Selector::Category(category) => {
                let names = self.store.fetch_stream_names().await?;
                Ok(names
                    .into_iter()
                    .filter(|name| !name.is_internal() && name.in_category(category))
                    .collect())
            }
            Selector::Categories(categories) => {
                let names = self.store.fetch_stream_names().await?;
                Ok(names
                    .into_iter()
                    .filter(|name| {
                        !name.is_internal()
                            && categories.iter().any(|category| name.in_category(category))
                    })
                    .collect())
            }
            Selector::All => {
                let names = self.store.fetch_stream_names().await?;
                Ok(names.into_iter().filter(|name| !name.is_internal()).collect())
            }
        }
    }

    fn apply(
        handlers: &mut Handlers<S>,
        state: &mut S,
        event: PersistedEvent,
        control: &mut QueryControl,
    ) -> Result<(), ProjectionError<ES::Error>> {
        match handlers {
            Handlers::Any(handler) => {
                handler(state, event, control).map_err(ProjectionError::Handler)
            }
            Handlers::ByName(handlers) => match handlers.get_mut(event.event_name()) {
                Some(handler) => handler(state, event, control).map_err(ProjectionError::Handler),
                None => Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventEnvelope;
    use crate::event_store::Stream;
    use crate::testing::InMemoryEventStore;
    use assert2::let_assert;
    use serde_json::json;

    fn stream(name: &str) -> StreamName {
        StreamName::new(name).unwrap()
    }

    fn events(name: &str, count: usize) -> Vec<EventEnvelope> {
        (0..count)
            .map(|seq| EventEnvelope::new(name, json!({ "seq": seq })))
            .collect()
    }

    async fn seed(store: &InMemoryEventStore, name: &str, events: Vec<EventEnvelope>) {
        store
            .create(Stream::new(stream(name)).with_events(events))
            .await
            .unwrap();
    }

    fn count_any(store: InMemoryEventStore) -> QueryBuilder<u64, InMemoryEventStore> {
        QueryBuilder::new(store, || 0u64)
    }

    #[tokio::test]
    async fn it_counts_matching_events_of_a_single_stream() {
        let store = InMemoryEventStore::new();
        let mut seeded = events("UserCreated", 50);
        seeded.extend(events("UsernameChanged", 49));
        seed(&store, "user-123", seeded).await;

        let mut query = count_any(store)
            .from_stream(stream("user-123"))
            .when("UsernameChanged", |count, _event, _control| {
                *count += 1;
                Ok(())
            })
            .build()
            .unwrap();

        query.run().await.unwrap();
        assert_eq!(*query.state(), 49);

        query.reset();
        assert_eq!(*query.state(), 0);
        query.run().await.unwrap();
        assert_eq!(*query.state(), 49);
    }

    #[tokio::test]
    async fn it_interleaves_multiple_streams() {
        let store = InMemoryEventStore::new();
        seed(&store, "user-123", events("UserCreated", 99)).await;
        seed(&store, "user-234", events("UserCreated", 1)).await;

        let mut query = count_any(store)
            .from_streams([stream("user-123"), stream("user-234")])
            .when_any(|count, _event, _control| {
                *count += 1;
                Ok(())
            })
            .build()
            .unwrap();

        query.run().await.unwrap();
        assert_eq!(*query.state(), 100);
    }

    #[tokio::test]
    async fn it_excludes_internal_streams_from_all() {
        let store = InMemoryEventStore::new();
        seed(&store, "user-123", events("UserCreated", 99)).await;
        seed(&store, "user-234", events("UserCreated", 1)).await;
        seed(&store, "$internal-345", events("UserCreated", 10)).await;

        let mut query = count_any(store)
            .from_all()
            .when_any(|count, _event, _control| {
                *count += 1;
                Ok(())
            })
            .build()
            .unwrap();

        query.run().await.unwrap();
        assert_eq!(*query.state(), 100);
    }

    #[tokio::test]
    async fn it_selects_streams_by_category() {
        let store = InMemoryEventStore::new();
        for name in ["user-123", "user-234", "guest-345", "guest-456"] {
            let mut seeded = events("UserCreated", 1);
            seeded.extend(events("UsernameChanged", 2));
            seed(&store, name, seeded).await;
        }
        seed(&store, "order-1", events("UserCreated", 1)).await;

        let mut query = count_any(store)
            .from_categories(["user", "guest"])
            .when("UserCreated", |count, _event, _control| {
                *count += 1;
                Ok(())
            })
            .build()
            .unwrap();

        query.run().await.unwrap();
        assert_eq!(*query.state(), 4);
    }

    #[tokio::test]
    async fn it_resumes_from_the_remembered_positions() {
        let store = InMemoryEventStore::new();
        seed(&store, "user-123", events("UsernameChanged", 49)).await;

        let mut query = count_any(store.clone())
            .from_stream(stream("user-123"))
            .when("UsernameChanged", |count, _event, _control| {
                *count += 1;
                Ok(())
            })
            .build()
            .unwrap();

        query.run().await.unwrap();
        assert_eq!(*query.state(), 49);

        store
            .append_to(&stream("user-123"), events("UsernameChanged", 50))
            .await
            .unwrap();

        query.run().await.unwrap();
        assert_eq!(*query.state(), 99);
    }

    #[tokio::test]
    async fn it_stops_cooperatively() {
        let store = InMemoryEventStore::new();
        seed(&store, "user-123", events("UserCreated", 99)).await;

        let mut query = count_any(store)
            .from_stream(stream("user-123"))
            .when_any(|count, _event, control| {
                *count += 1;
                if *count == 10 {
                    control.stop();
                }
                Ok(())
            })
            .build()
            .unwrap();

        query.run().await.unwrap();
        assert_eq!(*query.state(), 10);
        assert_eq!(query.position(&stream("user-123")), Some(10));

        // The next run picks up right after the stopping event.
        query.run().await.unwrap();
        assert_eq!(*query.state(), 99);
    }

    #[tokio::test]
    async fn it_keeps_the_cursor_at_the_last_success_when_a_handler_fails() {
        let store = InMemoryEventStore::new();
        seed(&store, "user-123", events("UserCreated", 5)).await;

        let mut query = count_any(store)
            .from_stream(stream("user-123"))
            .when_any(|count, _event, _control| {
                if *count == 3 {
                    return Err("boom".into());
                }
                *count += 1;
                Ok(())
            })
            .build()
            .unwrap();

        let_assert!(Err(ProjectionError::Handler(_)) = query.run().await);
        assert_eq!(*query.state(), 3);
        assert_eq!(query.position(&stream("user-123")), Some(3));
    }

    #[tokio::test]
    async fn it_requires_a_selector_and_handlers() {
        let store = InMemoryEventStore::new();
        let err = count_any(store.clone())
            .when_any(|_state, _event, _control| Ok(()))
            .build()
            .err()
            .expect("building without a selector succeeded");
        assert!(matches!(
            err,
            ProjectionError::Definition("no stream selector was chosen")
        ));

        let err = count_any(store)
            .from_all()
            .build()
            .err()
            .expect("building without handlers succeeded");
        assert!(matches!(
            err,
            ProjectionError::Definition("no event handlers were registered")
        ));
    }

    #[tokio::test]
    async fn it_rejects_conflicting_definitions() {
        let store = InMemoryEventStore::new();
        let err = count_any(store.clone())
            .from_all()
            .from_stream(stream("user-123"))
            .when_any(|_state, _event, _control| Ok(()))
            .build()
            .err()
            .expect("building with two selectors succeeded");
        assert!(matches!(err, ProjectionError::Definition(_)));

        let err = count_any(store)
            .from_all()
            .when_any(|_state, _event, _control| Ok(()))
            .when("UserCreated", |_state, _event, _control| Ok(()))
            .build()
            .err()
            .expect("building with conflicting handlers succeeded");
        assert!(matches!(err, ProjectionError::Definition(_)));
    }

    #[tokio::test]
    async fn it_propagates_store_failures() {
        let store = InMemoryEventStore::new();
        let mut query = count_any(store)
            .from_stream(stream("missing"))
            .when_any(|_state, _event, _control| Ok(()))
            .build()
            .unwrap();
        let_assert!(Err(ProjectionError::Store(_)) = query.run().await);
    }
}
