//! `PostgreSQL` implementation of the `SagaStore` trait.

use async_trait::async_trait;
use narwhal_core::context::Context;
use narwhal_core::error::DomainError;
use narwhal_saga::{Saga, SagaData, SagaState, SagaStore};
use sqlx::Row;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use tracing::debug;
use uuid::Uuid;

use crate::database::PgDatabase;
use crate::error::StoreError;

const SAGA_COLUMNS: &str =
    "id, saga_type, state, current_step, data, completed_steps, error, created_at, updated_at, completed_at, \
     started_at, compensated_at";

/// PostgreSQL-backed saga store.
///
/// Each write is a single statement, so writes for one saga land in call
/// order under the row lock.
#[derive(Debug, Clone)]
pub struct PgSagaStore {
    db: PgDatabase,
}

impl PgSagaStore {
    /// Creates a new `PgSagaStore`.
    #[must_use]
    pub fn new(db: PgDatabase) -> Self {
        Self { db }
    }

    async fn select(
        &self,
        ctx: &Context,
        filter: &str,
        binds: &[&str],
        limit: Option<usize>,
    ) -> Result<Vec<Saga>, DomainError> {
        let mut sql = format!("SELECT {SAGA_COLUMNS} FROM sagas {filter}");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let mut query = sqlx::query(&sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        let mut conn = self.db.connection(ctx).await?;
        let rows = query.fetch_all(conn.get()).await.map_err(StoreError::from)?;
        rows.iter().map(|row| decode(row).map_err(DomainError::from)).collect()
    }
}

fn decode(row: &PgRow) -> Result<Saga, StoreError> {
    let state: String = row.try_get("state")?;
    let current_step: i32 = row.try_get("current_step")?;
    let Json(data): Json<SagaData> = row.try_get("data")?;
    let Json(completed_steps): Json<Vec<String>> = row.try_get("completed_steps")?;
    Ok(Saga {
        id: row.try_get("id")?,
        saga_type: row.try_get("saga_type")?,
        state: state
            .parse()
            .map_err(|err: DomainError| StoreError::invalid_column("state", err))?,
        current_step: usize::try_from(current_step).map_err(|err| StoreError::invalid_column("current_step", err))?,
        data,
        completed_steps,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
        started_at: row.try_get("started_at")?,
        compensated_at: row.try_get("compensated_at")?,
    })
}

#[async_trait]
impl SagaStore for PgSagaStore {
    async fn save(&self, ctx: &Context, saga: &Saga) -> Result<(), DomainError> {
        let current_step =
            i32::try_from(saga.current_step).map_err(|err| StoreError::invalid_column("current_step", err))?;
        let mut conn = self.db.connection(ctx).await?;
        sqlx::query(&format!(
            "INSERT INTO sagas ({SAGA_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (id) DO UPDATE SET state = EXCLUDED.state, current_step = EXCLUDED.current_step, \
             data = EXCLUDED.data, completed_steps = EXCLUDED.completed_steps, error = EXCLUDED.error, \
             updated_at = EXCLUDED.updated_at, completed_at = EXCLUDED.completed_at, \
             started_at = EXCLUDED.started_at, compensated_at = EXCLUDED.compensated_at"
        ))
        .bind(saga.id)
        .bind(&saga.saga_type)
        .bind(saga.state.as_str())
        .bind(current_step)
        .bind(Json(&saga.data))
        .bind(Json(&saga.completed_steps))
        .bind(&saga.error)
        .bind(saga.created_at)
        .bind(saga.updated_at)
        .bind(saga.completed_at)
        .bind(saga.started_at)
        .bind(saga.compensated_at)
        .execute(conn.get())
        .await
        .map_err(StoreError::from)?;
        debug!(saga_id = %saga.id, state = %saga.state, step = saga.current_step, "saga saved");
        Ok(())
    }

    async fn get(&self, ctx: &Context, id: Uuid) -> Result<Saga, DomainError> {
        let mut conn = self.db.connection(ctx).await?;
        let row = sqlx::query(&format!("SELECT {SAGA_COLUMNS} FROM sagas WHERE id = $1"))
            .bind(id)
            .fetch_optional(conn.get())
            .await
            .map_err(StoreError::from)?
            .ok_or_else(|| DomainError::not_found("Saga", id))?;
        Ok(decode(&row)?)
    }

    async fn update_state(&self, ctx: &Context, id: Uuid, state: SagaState) -> Result<(), DomainError> {
        let mut conn = self.db.connection(ctx).await?;
        let updated = sqlx::query("UPDATE sagas SET state = $2 WHERE id = $1")
            .bind(id)
            .bind(state.as_str())
            .execute(conn.get())
            .await
            .map_err(StoreError::from)?;
        if updated.rows_affected() == 0 {
            return Err(DomainError::not_found("Saga", id));
        }
        Ok(())
    }

    async fn find_incomplete(&self, ctx: &Context) -> Result<Vec<Saga>, DomainError> {
        let states = SagaState::INCOMPLETE.map(SagaState::as_str);
        self.select(
            ctx,
            "WHERE state IN ($1, $2, $3) ORDER BY created_at, id",
            &states,
            None,
        )
        .await
    }

    async fn find_by_data(&self, ctx: &Context, key: &str, value: &str) -> Result<Vec<Saga>, DomainError> {
        self.select(ctx, "WHERE data ->> $1 = $2 ORDER BY created_at, id", &[key, value], None)
            .await
    }

    async fn list(&self, ctx: &Context, state: Option<SagaState>, limit: usize) -> Result<Vec<Saga>, DomainError> {
        match state {
            Some(state) => {
                self.select(
                    ctx,
                    "WHERE state = $1 ORDER BY created_at DESC, id DESC",
                    &[state.as_str()],
                    Some(limit),
                )
                .await
            }
            None => self.select(ctx, "ORDER BY created_at DESC, id DESC", &[], Some(limit)).await,
        }
    }
}
