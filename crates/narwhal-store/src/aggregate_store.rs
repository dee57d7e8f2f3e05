//! Aggregate documents stored as JSONB with a version column for
//! optimistic concurrency.

use std::marker::PhantomData;

use async_trait::async_trait;
use narwhal_core::aggregate::AggregateRoot;
use narwhal_core::context::Context;
use narwhal_core::error::DomainError;
use narwhal_core::repository::AggregateStore;
use sqlx::PgConnection;
use tracing::debug;
use uuid::Uuid;

use crate::database::PgDatabase;
use crate::error::StoreError;

/// PostgreSQL-backed store of `A` documents.
pub struct PgAggregateStore<A> {
    db: PgDatabase,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> std::fmt::Debug for PgAggregateStore<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgAggregateStore").finish_non_exhaustive()
    }
}

impl<A: AggregateRoot> PgAggregateStore<A> {
    /// Creates a new `PgAggregateStore`.
    #[must_use]
    pub fn new(db: PgDatabase) -> Self {
        Self {
            db,
            _aggregate: PhantomData,
        }
    }

    fn decode(document: serde_json::Value) -> Result<A, DomainError> {
        let mut aggregate: A = serde_json::from_value(document)?;
        aggregate.state_mut().mark_persisted();
        Ok(aggregate)
    }

    fn decode_all(documents: Vec<serde_json::Value>) -> Result<Vec<A>, DomainError> {
        documents.into_iter().map(Self::decode).collect()
    }

    async fn stored_version(conn: &mut PgConnection, id: Uuid) -> Result<i64, DomainError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM aggregates WHERE aggregate_type = $1 AND aggregate_id = $2")
                .bind(A::AGGREGATE_TYPE)
                .bind(id)
                .fetch_optional(conn)
                .await
                .map_err(StoreError::from)?;
        Ok(version.unwrap_or(0))
    }
}

#[async_trait]
impl<A: AggregateRoot> AggregateStore<A> for PgAggregateStore<A> {
    async fn save(&self, ctx: &Context, aggregate: &mut A) -> Result<(), DomainError> {
        aggregate.validate()?;
        let id = aggregate.aggregate_id();
        let expected = aggregate.state().persisted_version();
        let version = aggregate.version();
        let document = serde_json::to_value(&*aggregate)?;

        let mut conn = self.db.connection(ctx).await?;
        let written = if expected == 0 {
            sqlx::query(
                "INSERT INTO aggregates (aggregate_id, aggregate_type, version, document) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT (aggregate_id) DO NOTHING",
            )
            .bind(id)
            .bind(A::AGGREGATE_TYPE)
            .bind(version)
            .bind(document)
            .execute(conn.get())
            .await
        } else {
            sqlx::query(
                "UPDATE aggregates SET version = $3, document = $4, updated_at = NOW() \
                 WHERE aggregate_type = $2 AND aggregate_id = $1 AND version = $5",
            )
            .bind(id)
            .bind(A::AGGREGATE_TYPE)
            .bind(version)
            .bind(document)
            .bind(expected)
            .execute(conn.get())
            .await
        }
        .map_err(StoreError::from)?;

        if written.rows_affected() == 0 {
            let actual = Self::stored_version(conn.get(), id).await?;
            debug!(aggregate_type = A::AGGREGATE_TYPE, aggregate_id = %id, expected, actual, "stale aggregate write");
            return Err(DomainError::ConcurrentModification {
                aggregate_id: id,
                expected,
                actual,
            });
        }
        drop(conn);

        aggregate.state_mut().mark_persisted();
        Ok(())
    }

    async fn find_by_id(&self, ctx: &Context, id: Uuid) -> Result<Option<A>, DomainError> {
        let mut conn = self.db.connection(ctx).await?;
        let document: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT document FROM aggregates WHERE aggregate_type = $1 AND aggregate_id = $2")
                .bind(A::AGGREGATE_TYPE)
                .bind(id)
                .fetch_optional(conn.get())
                .await
                .map_err(StoreError::from)?;
        document.map(Self::decode).transpose()
    }

    async fn delete(&self, ctx: &Context, id: Uuid) -> Result<(), DomainError> {
        let mut conn = self.db.connection(ctx).await?;
        let deleted = sqlx::query("DELETE FROM aggregates WHERE aggregate_type = $1 AND aggregate_id = $2")
            .bind(A::AGGREGATE_TYPE)
            .bind(id)
            .execute(conn.get())
            .await
            .map_err(StoreError::from)?;
        if deleted.rows_affected() == 0 {
            return Err(DomainError::not_found(A::AGGREGATE_TYPE, id));
        }
        Ok(())
    }

    async fn find_by_field(
        &self,
        ctx: &Context,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<Vec<A>, DomainError> {
        let mut conn = self.db.connection(ctx).await?;
        let documents: Vec<serde_json::Value> = sqlx::query_scalar(
            "SELECT document FROM aggregates WHERE aggregate_type = $1 AND document -> $2 = $3 \
             ORDER BY aggregate_id",
        )
        .bind(A::AGGREGATE_TYPE)
        .bind(field)
        .bind(value)
        .fetch_all(conn.get())
        .await
        .map_err(StoreError::from)?;
        Self::decode_all(documents)
    }

    async fn find_all(&self, ctx: &Context) -> Result<Vec<A>, DomainError> {
        let mut conn = self.db.connection(ctx).await?;
        let documents: Vec<serde_json::Value> =
            sqlx::query_scalar("SELECT document FROM aggregates WHERE aggregate_type = $1 ORDER BY aggregate_id")
                .bind(A::AGGREGATE_TYPE)
                .fetch_all(conn.get())
                .await
                .map_err(StoreError::from)?;
        Self::decode_all(documents)
    }
}
