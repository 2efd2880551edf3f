use crate::{AggregateStreamStrategy, Error, MySqlEventStore, SingleStreamStrategy};
use chronicle::{
    EventEnvelope, EventStore, MetadataMatcher, Operator, PersistedEvent, Stream, StreamName,
};
use futures::TryStreamExt;
use serde_json::{json, Map};
use sqlx::MySqlPool;
use uuid::Uuid;

fn stream_name(name: &str) -> StreamName {
    StreamName::new(name).unwrap()
}

fn user_created(name: &str) -> EventEnvelope {
    EventEnvelope::new("UserCreated", json!({ "name": name }))
}

fn versioned(version: i64) -> EventEnvelope {
    user_created("Sasha")
        .with_metadata_entry("_aggregate_version", json!(version))
        .with_metadata_entry("_aggregate_id", json!(Uuid::new_v4().to_string()))
        .with_metadata_entry("_aggregate_type", json!("user"))
}

async fn single_stream_store(pool: MySqlPool) -> MySqlEventStore<SingleStreamStrategy> {
    MySqlEventStore::try_new(pool, SingleStreamStrategy)
        .await
        .unwrap()
}

async fn collect(events: chronicle::EventStream<Error>) -> Vec<PersistedEvent> {
    events.try_collect().await.unwrap()
}

#[sqlx::test]
async fn it_creates_a_stream_and_loads_it_back(pool: MySqlPool) {
    let event_store = single_stream_store(pool).await;
    let name = stream_name("user-123");
    let mut metadata = Map::new();
    metadata.insert("owner".to_string(), json!("accounts"));

    let events = vec![user_created("Sasha"), user_created("Alex")];
    event_store
        .create(
            Stream::new(name.clone())
                .with_metadata(metadata.clone())
                .with_events(events.clone()),
        )
        .await
        .unwrap();

    assert!(event_store.has_stream(&name).await.unwrap());
    assert_eq!(
        event_store.fetch_stream_metadata(&name).await.unwrap(),
        Some(metadata)
    );

    let loaded = collect(event_store.load(&name, 1, None, None).await.unwrap()).await;
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0].no(), 1);
    assert_eq!(loaded[0].event_id(), events[0].event_id());
    assert_eq!(loaded[0].payload(), events[0].payload());
    assert_eq!(loaded[0].created_at(), events[0].created_at());
}

#[sqlx::test]
async fn it_rejects_creating_an_existing_stream(pool: MySqlPool) {
    let event_store = single_stream_store(pool).await;
    let name = stream_name("user-123");
    event_store
        .create(Stream::new(name.clone()).with_events(vec![user_created("Sasha")]))
        .await
        .unwrap();

    let result = event_store.create(Stream::new(name.clone())).await;
    assert!(matches!(result, Err(Error::StreamExists(_))));

    // The losing creation left the winner untouched.
    let loaded = collect(event_store.load(&name, 1, None, None).await.unwrap()).await;
    assert_eq!(loaded.len(), 1);
}

#[sqlx::test]
async fn it_rejects_appending_to_a_missing_stream(pool: MySqlPool) {
    let event_store = single_stream_store(pool).await;
    let result = event_store
        .append_to(&stream_name("missing"), vec![user_created("Sasha")])
        .await;
    assert!(matches!(result, Err(Error::StreamNotFound(_))));
}

#[sqlx::test]
async fn it_raises_a_concurrency_error_on_duplicate_event_ids(pool: MySqlPool) {
    let event_store = single_stream_store(pool).await;
    let name = stream_name("user-123");
    let duplicated = user_created("Sasha");
    event_store
        .create(Stream::new(name.clone()).with_events(vec![duplicated.clone()]))
        .await
        .unwrap();

    let result = event_store
        .append_to(&name, vec![user_created("Alex"), duplicated])
        .await;
    assert!(matches!(result, Err(Error::Concurrency)));

    let loaded = collect(event_store.load(&name, 1, None, None).await.unwrap()).await;
    assert_eq!(loaded.len(), 1);
}

#[sqlx::test]
async fn it_raises_a_concurrency_error_on_aggregate_version_conflicts(pool: MySqlPool) {
    let event_store = MySqlEventStore::try_new(pool, AggregateStreamStrategy)
        .await
        .unwrap();
    let name = stream_name("user-123");
    event_store
        .create(Stream::new(name.clone()).with_events(vec![versioned(1), versioned(2)]))
        .await
        .unwrap();

    let result = event_store.append_to(&name, vec![versioned(2)]).await;
    assert!(matches!(result, Err(Error::Concurrency)));
}

#[sqlx::test]
async fn it_loads_forward_and_reverse_as_mirror_images(pool: MySqlPool) {
    let event_store = single_stream_store(pool).await.with_load_batch_size(2);
    let name = stream_name("user-123");
    let events: Vec<_> = (0..5).map(|seq| user_created(&format!("user-{seq}"))).collect();
    event_store
        .create(Stream::new(name.clone()).with_events(events))
        .await
        .unwrap();

    let forward = collect(event_store.load(&name, 1, None, None).await.unwrap()).await;
    assert_eq!(
        forward.iter().map(PersistedEvent::no).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5]
    );
    let mut reverse = collect(
        event_store
            .load_reverse(&name, i64::MAX, None, None)
            .await
            .unwrap(),
    )
    .await;
    reverse.reverse();
    assert_eq!(forward, reverse);
}

#[sqlx::test]
async fn it_filters_loads_with_a_metadata_matcher(pool: MySqlPool) {
    let event_store = single_stream_store(pool).await;
    let name = stream_name("user-123");
    event_store
        .create(Stream::new(name.clone()).with_events(vec![
            user_created("Sasha").with_metadata_entry("admin", json!(true)),
            user_created("Alex").with_metadata_entry("admin", json!(false)),
            user_created("Kim").with_metadata_entry("admin", json!(true)),
        ]))
        .await
        .unwrap();

    let matcher = MetadataMatcher::new()
        .with("admin", Operator::Equals, json!(true))
        .unwrap();
    let loaded = collect(
        event_store
            .load(&name, 1, None, Some(&matcher))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(
        loaded.iter().map(PersistedEvent::no).collect::<Vec<_>>(),
        vec![1, 3]
    );
}

#[sqlx::test]
async fn it_deletes_streams(pool: MySqlPool) {
    let event_store = single_stream_store(pool).await;
    let name = stream_name("user-123");
    event_store
        .create(Stream::new(name.clone()).with_events(vec![user_created("Sasha")]))
        .await
        .unwrap();

    event_store.delete(&name).await.unwrap();
    assert!(!event_store.has_stream(&name).await.unwrap());
    assert!(matches!(
        event_store.delete(&name).await,
        Err(Error::StreamNotFound(_))
    ));

    // The name is free again.
    event_store.create(Stream::new(name)).await.unwrap();
}

#[sqlx::test]
async fn it_updates_stream_metadata(pool: MySqlPool) {
    let event_store = single_stream_store(pool).await;
    let name = stream_name("user-123");
    event_store.create(Stream::new(name.clone())).await.unwrap();

    let mut metadata = Map::new();
    metadata.insert("owner".to_string(), json!("billing"));
    event_store
        .update_stream_metadata(&name, metadata.clone())
        .await
        .unwrap();
    // Updating to the same value still succeeds.
    event_store
        .update_stream_metadata(&name, metadata.clone())
        .await
        .unwrap();
    assert_eq!(
        event_store.fetch_stream_metadata(&name).await.unwrap(),
        Some(metadata.clone())
    );

    assert!(matches!(
        event_store
            .update_stream_metadata(&stream_name("missing"), metadata)
            .await,
        Err(Error::StreamNotFound(_))
    ));
}

#[sqlx::test]
async fn it_lists_stream_names_sorted(pool: MySqlPool) {
    let event_store = single_stream_store(pool).await;
    for name in ["user-234", "$internal-345", "user-123"] {
        event_store
            .create(Stream::new(stream_name(name)))
            .await
            .unwrap();
    }
    let names = event_store.fetch_stream_names().await.unwrap();
    assert_eq!(
        names.iter().map(StreamName::as_str).collect::<Vec<_>>(),
        vec!["$internal-345", "user-123", "user-234"]
    );
}
