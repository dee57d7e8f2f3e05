//! `PostgreSQL` implementation of the `EventStore` trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use narwhal_core::context::Context;
use narwhal_core::error::DomainError;
use narwhal_core::event::EventAttributes;
use narwhal_core::repository::{EventStore, StoredEvent};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::database::PgDatabase;
use crate::error::{StoreError, violates};
use crate::schema::{EVENT_ID_CONSTRAINT, EVENT_SEQUENCE_CONSTRAINT};

const EVENT_COLUMNS: &str = "event_id, aggregate_id, aggregate_type, event_type, schema_version, payload, \
     sequence_number, correlation_id, causation_id, occurred_at, published_at, metadata";

/// PostgreSQL-backed domain event log.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    db: PgDatabase,
}

impl PgEventStore {
    /// Creates a new `PgEventStore`.
    #[must_use]
    pub fn new(db: PgDatabase) -> Self {
        Self { db }
    }
}

fn decode(row: &PgRow) -> Result<StoredEvent, StoreError> {
    let Json(metadata): Json<EventAttributes> = row.try_get("metadata")?;
    Ok(StoredEvent {
        event_id: row.try_get("event_id")?,
        aggregate_id: row.try_get("aggregate_id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        event_type: row.try_get("event_type")?,
        schema_version: row.try_get("schema_version")?,
        payload: row.try_get("payload")?,
        sequence_number: row.try_get("sequence_number")?,
        correlation_id: row.try_get("correlation_id")?,
        causation_id: row.try_get("causation_id")?,
        occurred_at: row.try_get("occurred_at")?,
        published_at: row.try_get("published_at")?,
        metadata,
    })
}

fn decode_all(rows: &[PgRow]) -> Result<Vec<StoredEvent>, DomainError> {
    rows.iter()
        .map(|row| decode(row).map_err(DomainError::from))
        .collect()
}

fn insert_error(err: sqlx::Error, events: &[StoredEvent]) -> DomainError {
    if violates(&err, EVENT_ID_CONSTRAINT) {
        return DomainError::Conflict(format!("event already stored: {err}"));
    }
    if violates(&err, EVENT_SEQUENCE_CONSTRAINT) {
        let first = &events[0];
        return DomainError::ConcurrentModification {
            aggregate_id: first.aggregate_id,
            expected: first.sequence_number - 1,
            actual: first.sequence_number,
        };
    }
    StoreError::from(err).into()
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn save(&self, ctx: &Context, events: &[StoredEvent]) -> Result<(), DomainError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut conn = self.db.connection(ctx).await?;

        // One statement, so a batch is all-or-nothing even outside a transaction.
        let mut insert = QueryBuilder::<Postgres>::new(format!("INSERT INTO domain_events ({EVENT_COLUMNS}) "));
        insert.push_values(events, |mut row, event| {
            row.push_bind(event.event_id)
                .push_bind(event.aggregate_id)
                .push_bind(event.aggregate_type.clone())
                .push_bind(event.event_type.clone())
                .push_bind(event.schema_version)
                .push_bind(event.payload.clone())
                .push_bind(event.sequence_number)
                .push_bind(event.correlation_id.clone())
                .push_bind(event.causation_id.clone())
                .push_bind(event.occurred_at)
                .push_bind(event.published_at)
                .push_bind(Json(event.metadata.clone()));
        });
        insert
            .build()
            .execute(conn.get())
            .await
            .map_err(|err| insert_error(err, events))?;
        Ok(())
    }

    async fn load(&self, ctx: &Context, aggregate_id: Uuid) -> Result<Vec<StoredEvent>, DomainError> {
        let mut conn = self.db.connection(ctx).await?;
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM domain_events WHERE aggregate_id = $1 ORDER BY sequence_number"
        ))
        .bind(aggregate_id)
        .fetch_all(conn.get())
        .await
        .map_err(StoreError::from)?;
        decode_all(&rows)
    }

    async fn unpublished(&self, ctx: &Context, limit: usize) -> Result<Vec<StoredEvent>, DomainError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut conn = self.db.connection(ctx).await?;
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM domain_events WHERE published_at IS NULL ORDER BY position LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(conn.get())
        .await
        .map_err(StoreError::from)?;
        decode_all(&rows)
    }

    async fn mark_published(
        &self,
        ctx: &Context,
        event_id: Uuid,
        published_at: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let mut conn = self.db.connection(ctx).await?;
        let result = sqlx::query("UPDATE domain_events SET published_at = $2 WHERE event_id = $1")
            .bind(event_id)
            .bind(published_at)
            .execute(conn.get())
            .await
            .map_err(StoreError::from)?;
        if result.rows_affected() == 0 {
            return Err(DomainError::not_found("event", event_id));
        }
        Ok(())
    }
}
