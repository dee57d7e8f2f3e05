//! Integration tests for the `PostgreSQL` stores.
//!
//! Each test gets a fresh database from `sqlx::test`; run them with
//! `DATABASE_URL` set and `--ignored`.

use chrono::{Duration, TimeZone, Utc};
use narwhal_core::aggregate::AggregateRoot;
use narwhal_core::clock::SystemClock;
use narwhal_core::context::Context;
use narwhal_core::error::DomainError;
use narwhal_core::ports::MediaStatus;
use narwhal_core::repository::{AggregateStore, EventStore, StoredEvent, UnitOfWork, stored_events_of};
use narwhal_media::Movie;
use narwhal_saga::{Saga, SagaState, SagaStore};
use narwhal_store::PgDatabase;
use sqlx::PgPool;
use uuid::Uuid;

fn make_stored_event(aggregate_id: Uuid, sequence_number: i64) -> StoredEvent {
    StoredEvent {
        event_id: Uuid::new_v4(),
        aggregate_id,
        aggregate_type: "Movie".to_owned(),
        event_type: "TestEvent".to_owned(),
        schema_version: 1,
        payload: serde_json::json!({ "key": "value" }),
        sequence_number,
        correlation_id: "corr-1".to_owned(),
        causation_id: None,
        occurred_at: Utc.with_ymd_and_hms(2026, 4, 2, 8, 0, 0).unwrap() + Duration::seconds(sequence_number),
        published_at: None,
        metadata: std::iter::once(("bounded_context".to_owned(), serde_json::json!("media"))).collect(),
    }
}

fn movie(title: &str) -> Movie {
    Movie::create(&Context::background(), &SystemClock, title, Some(1995), Some(170), None).unwrap()
}

fn saga_at(minute: i64, media_id: &str) -> Saga {
    let mut data = serde_json::Map::new();
    data.insert("media_id".into(), serde_json::json!(media_id));
    let at = Utc.with_ymd_and_hms(2026, 4, 2, 8, 0, 0).unwrap() + Duration::minutes(minute);
    Saga::new("MediaProcessing", data, at)
}

// --- event store ---

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_load_returns_empty_vec_for_unknown_aggregate(pool: PgPool) {
    let events = PgDatabase::new(pool).event_store();

    let loaded = events.load(&Context::background(), Uuid::new_v4()).await.unwrap();

    assert!(loaded.is_empty());
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_saved_events_load_in_sequence_order(pool: PgPool) {
    // Arrange
    let events = PgDatabase::new(pool).event_store();
    let ctx = Context::background();
    let aggregate_id = Uuid::new_v4();
    let batch = vec![make_stored_event(aggregate_id, 2), make_stored_event(aggregate_id, 1)];

    // Act
    events.save(&ctx, &batch).await.unwrap();
    let loaded = events.load(&ctx, aggregate_id).await.unwrap();

    // Assert
    assert_eq!(loaded.iter().map(|e| e.sequence_number).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(loaded[0], batch[1]);
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_reused_sequence_number_is_a_concurrent_modification(pool: PgPool) {
    // Arrange
    let events = PgDatabase::new(pool).event_store();
    let ctx = Context::background();
    let aggregate_id = Uuid::new_v4();
    events.save(&ctx, &[make_stored_event(aggregate_id, 1)]).await.unwrap();

    // Act
    let err = events.save(&ctx, &[make_stored_event(aggregate_id, 1)]).await.unwrap_err();

    // Assert
    assert!(matches!(err, DomainError::ConcurrentModification { expected: 0, actual: 1, .. }));
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_duplicate_event_id_is_a_conflict(pool: PgPool) {
    let events = PgDatabase::new(pool).event_store();
    let ctx = Context::background();
    let first = make_stored_event(Uuid::new_v4(), 1);
    let mut copy = make_stored_event(Uuid::new_v4(), 1);
    copy.event_id = first.event_id;
    events.save(&ctx, &[first]).await.unwrap();

    let err = events.save(&ctx, &[copy]).await.unwrap_err();

    assert!(matches!(err, DomainError::Conflict(_)));
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_mark_published_removes_event_from_outbox(pool: PgPool) {
    // Arrange
    let events = PgDatabase::new(pool).event_store();
    let ctx = Context::background();
    let aggregate_id = Uuid::new_v4();
    let batch = vec![make_stored_event(aggregate_id, 1), make_stored_event(aggregate_id, 2)];
    events.save(&ctx, &batch).await.unwrap();

    // Act
    events.mark_published(&ctx, batch[0].event_id, Utc::now()).await.unwrap();
    let pending = events.unpublished(&ctx, 10).await.unwrap();
    let missing = events.mark_published(&ctx, Uuid::new_v4(), Utc::now()).await;

    // Assert
    assert_eq!(pending.iter().map(|e| e.event_id).collect::<Vec<_>>(), vec![batch[1].event_id]);
    assert!(matches!(missing, Err(DomainError::NotFound { entity: "event", .. })));
}

// --- aggregate store ---

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_aggregate_round_trips_and_is_found_by_field(pool: PgPool) {
    // Arrange
    let movies = PgDatabase::new(pool).aggregates::<Movie>();
    let ctx = Context::background();
    let mut heat = movie("Heat");
    let mut other = movie("Ronin");

    // Act
    movies.save(&ctx, &mut heat).await.unwrap();
    movies.save(&ctx, &mut other).await.unwrap();
    let loaded = movies.find_by_id(&ctx, heat.aggregate_id()).await.unwrap().unwrap();
    let by_title = movies.find_by_field(&ctx, "title", &serde_json::json!("Heat")).await.unwrap();

    // Assert
    assert_eq!(loaded.title(), "Heat");
    assert_eq!(loaded.version(), heat.version());
    assert_eq!(loaded.state().persisted_version(), heat.version());
    assert_eq!(by_title.len(), 1);
    assert_eq!(movies.find_all(&ctx).await.unwrap().len(), 2);
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_stale_aggregate_save_fails_with_concurrent_modification(pool: PgPool) {
    // Arrange
    let movies = PgDatabase::new(pool).aggregates::<Movie>();
    let ctx = Context::background();
    let mut heat = movie("Heat");
    movies.save(&ctx, &mut heat).await.unwrap();
    let mut first = movies.find_by_id(&ctx, heat.aggregate_id()).await.unwrap().unwrap();
    let mut second = first.clone();
    first.change_status(&ctx, &SystemClock, MediaStatus::Downloading).unwrap();
    second.change_status(&ctx, &SystemClock, MediaStatus::Downloading).unwrap();

    // Act
    movies.save(&ctx, &mut first).await.unwrap();
    let err = movies.save(&ctx, &mut second).await.unwrap_err();

    // Assert
    let DomainError::ConcurrentModification { expected, actual, .. } = err else {
        panic!("expected a concurrent modification, got {err:?}");
    };
    assert_eq!(expected, heat.version());
    assert_eq!(actual, first.version());
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_delete_removes_aggregate_and_rejects_unknown_id(pool: PgPool) {
    let movies = PgDatabase::new(pool).aggregates::<Movie>();
    let ctx = Context::background();
    let mut heat = movie("Heat");
    movies.save(&ctx, &mut heat).await.unwrap();

    movies.delete(&ctx, heat.aggregate_id()).await.unwrap();

    assert!(movies.find_by_id(&ctx, heat.aggregate_id()).await.unwrap().is_none());
    assert!(matches!(
        movies.delete(&ctx, heat.aggregate_id()).await,
        Err(DomainError::NotFound { entity: "Movie", .. })
    ));
}

// --- unit of work ---

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_transaction_writes_are_visible_only_after_commit(pool: PgPool) {
    // Arrange
    let db = PgDatabase::new(pool);
    let (uow, movies, events) = (db.unit_of_work(), db.aggregates::<Movie>(), db.event_store());
    let ctx = Context::background();
    let mut heat = movie("Heat");
    let pending = stored_events_of(&heat);
    let tx = uow.begin(&ctx).await.unwrap();

    // Act
    movies.save(tx.context(), &mut heat).await.unwrap();
    events.save(tx.context(), &pending).await.unwrap();
    let inside = movies.find_by_id(tx.context(), heat.aggregate_id()).await.unwrap();
    let outside = movies.find_by_id(&ctx, heat.aggregate_id()).await.unwrap();
    tx.commit().await.unwrap();

    // Assert
    assert!(inside.is_some());
    assert!(outside.is_none());
    assert!(movies.find_by_id(&ctx, heat.aggregate_id()).await.unwrap().is_some());
    assert_eq!(events.unpublished(&ctx, 10).await.unwrap().len(), pending.len());
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_rollback_and_drop_discard_writes(pool: PgPool) {
    // Arrange
    let db = PgDatabase::new(pool);
    let (uow, movies) = (db.unit_of_work(), db.aggregates::<Movie>());
    let ctx = Context::background();
    let mut rolled_back = movie("Heat");
    let mut dropped = movie("Ronin");

    // Act
    let tx = uow.begin(&ctx).await.unwrap();
    movies.save(tx.context(), &mut rolled_back).await.unwrap();
    tx.rollback().await.unwrap();
    let tx = uow.begin(&ctx).await.unwrap();
    movies.save(tx.context(), &mut dropped).await.unwrap();
    let stale = tx.context().clone();
    drop(tx);

    // Assert
    assert!(movies.find_all(&ctx).await.unwrap().is_empty());
    assert!(matches!(
        movies.find_all(&stale).await,
        Err(DomainError::Infrastructure(_))
    ));
}

// --- saga store ---

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_saga_save_get_and_update_state(pool: PgPool) {
    // Arrange
    let sagas = PgDatabase::new(pool).sagas();
    let ctx = Context::background();
    let mut saga = saga_at(0, "m-1");
    saga.completed_steps.push("UpdateStatus_downloading".into());
    saga.current_step = 1;

    // Act
    sagas.save(&ctx, &saga).await.unwrap();
    sagas.update_state(&ctx, saga.id, SagaState::Running).await.unwrap();
    let loaded = sagas.get(&ctx, saga.id).await.unwrap();

    // Assert
    assert_eq!(loaded.state, SagaState::Running);
    assert_eq!(loaded.data, saga.data);
    assert_eq!(loaded.completed_steps, saga.completed_steps);
    assert_eq!(loaded.current_step, 1);
    assert!(matches!(
        sagas.get(&ctx, Uuid::new_v4()).await,
        Err(DomainError::NotFound { entity: "Saga", .. })
    ));
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_saga_queries_filter_and_order(pool: PgPool) {
    // Arrange
    let sagas = PgDatabase::new(pool).sagas();
    let ctx = Context::background();
    let first = saga_at(0, "m-1");
    let mut second = saga_at(1, "m-2");
    second.state = SagaState::Running;
    let mut done = saga_at(2, "m-1");
    done.state = SagaState::Completed;
    for saga in [&done, &second, &first] {
        sagas.save(&ctx, saga).await.unwrap();
    }

    // Act
    let incomplete = sagas.find_incomplete(&ctx).await.unwrap();
    let for_media = sagas.find_by_data(&ctx, "media_id", "m-1").await.unwrap();
    let newest = sagas.list(&ctx, None, 2).await.unwrap();
    let completed = sagas.list(&ctx, Some(SagaState::Completed), 10).await.unwrap();

    // Assert
    assert_eq!(incomplete.iter().map(|s| s.id).collect::<Vec<_>>(), vec![first.id, second.id]);
    assert_eq!(for_media.iter().map(|s| s.id).collect::<Vec<_>>(), vec![first.id, done.id]);
    assert_eq!(newest.iter().map(|s| s.id).collect::<Vec<_>>(), vec![done.id, second.id]);
    assert_eq!(completed.len(), 1);
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_saga_timestamps_round_trip(pool: PgPool) {
    // Arrange
    let sagas = PgDatabase::new(pool).sagas();
    let ctx = Context::background();
    let mut saga = saga_at(0, "m-3");
    saga.mark_started(Utc.with_ymd_and_hms(2026, 4, 2, 8, 1, 0).unwrap());
    saga.finish(SagaState::Compensated, Utc.with_ymd_and_hms(2026, 4, 2, 8, 5, 0).unwrap());

    // Act
    sagas.save(&ctx, &saga).await.unwrap();
    let loaded = sagas.get(&ctx, saga.id).await.unwrap();

    // Assert
    assert_eq!(loaded.started_at, saga.started_at);
    assert_eq!(loaded.compensated_at, saga.compensated_at);
    assert_eq!(loaded.completed_at, None);
    assert_eq!(loaded, saga);
}
