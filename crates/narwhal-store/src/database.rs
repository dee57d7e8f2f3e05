//! Shared pool and registry of open unit-of-work transactions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use narwhal_core::aggregate::AggregateRoot;
use narwhal_core::context::{Context, TransactionId};
use narwhal_core::error::DomainError;
use parking_lot::RwLock;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::aggregate_store::PgAggregateStore;
use crate::error::StoreError;
use crate::event_store::PgEventStore;
use crate::saga_store::PgSagaStore;
use crate::unit_of_work::PgUnitOfWork;

pub(crate) type SharedTransaction = Arc<Mutex<sqlx::Transaction<'static, Postgres>>>;

/// Handle to a `PostgreSQL` database shared by every store built from it.
///
/// Stores run on the transaction named by the context when it has one and
/// on a pooled autocommit connection otherwise.
#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
    open: Arc<RwLock<HashMap<TransactionId, SharedTransaction>>>,
}

impl std::fmt::Debug for PgDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgDatabase")
            .field("open_transactions", &self.open.read().len())
            .finish_non_exhaustive()
    }
}

impl PgDatabase {
    /// Wraps an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            open: Arc::default(),
        }
    }

    /// Connects a pool of at most `max_connections` to `url`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if no connection can be established.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies pending schema migrations.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Migration` if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        crate::schema::migrate(&self.pool).await
    }

    /// Unit of work whose transactions every store of this database joins.
    #[must_use]
    pub fn unit_of_work(&self) -> Arc<PgUnitOfWork> {
        Arc::new(PgUnitOfWork::new(self.clone()))
    }

    /// The event log.
    #[must_use]
    pub fn event_store(&self) -> Arc<PgEventStore> {
        Arc::new(PgEventStore::new(self.clone()))
    }

    /// Document store for `A`.
    #[must_use]
    pub fn aggregates<A: AggregateRoot>(&self) -> Arc<PgAggregateStore<A>> {
        Arc::new(PgAggregateStore::new(self.clone()))
    }

    /// Saga store.
    #[must_use]
    pub fn sagas(&self) -> Arc<PgSagaStore> {
        Arc::new(PgSagaStore::new(self.clone()))
    }

    pub(crate) fn register(&self, id: TransactionId, tx: sqlx::Transaction<'static, Postgres>) {
        self.open.write().insert(id, Arc::new(Mutex::new(tx)));
    }

    /// Removes a transaction from the registry; dropping it rolls back.
    pub(crate) fn forget(&self, id: TransactionId) -> Option<SharedTransaction> {
        self.open.write().remove(&id)
    }

    /// Takes sole ownership of a registered transaction to finish it.
    pub(crate) fn take(&self, id: TransactionId) -> Result<sqlx::Transaction<'static, Postgres>, StoreError> {
        let shared = self.forget(id).ok_or(StoreError::TransactionClosed(id))?;
        Arc::try_unwrap(shared)
            .map(Mutex::into_inner)
            .map_err(|_| StoreError::TransactionBusy(id))
    }

    /// The connection an operation under `ctx` runs on.
    pub(crate) async fn connection(&self, ctx: &Context) -> Result<Connection, DomainError> {
        ctx.check()?;
        let Some(id) = ctx.transaction() else {
            let conn = self.pool.acquire().await.map_err(StoreError::from)?;
            return Ok(Connection::Pooled(conn));
        };
        let shared = self
            .open
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::TransactionClosed(id))?;
        Ok(Connection::Enlisted(shared.lock_owned().await))
    }
}

/// A pooled connection or exclusive access to an open transaction.
pub(crate) enum Connection {
    Pooled(PoolConnection<Postgres>),
    Enlisted(OwnedMutexGuard<sqlx::Transaction<'static, Postgres>>),
}

impl Connection {
    pub(crate) fn get(&mut self) -> &mut PgConnection {
        match self {
            Self::Pooled(conn) => &mut **conn,
            Self::Enlisted(tx) => &mut ***tx,
        }
    }
}
