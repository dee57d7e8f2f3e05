//! `PostgreSQL` unit of work.

use async_trait::async_trait;
use narwhal_core::context::{Context, TransactionId};
use narwhal_core::error::DomainError;
use narwhal_core::repository::{Transaction, UnitOfWork};
use tracing::debug;

use crate::database::PgDatabase;
use crate::error::StoreError;

/// Opens database transactions that the stores of one [`PgDatabase`] join
/// through the transaction id carried by the returned context.
#[derive(Debug, Clone)]
pub struct PgUnitOfWork {
    db: PgDatabase,
}

impl PgUnitOfWork {
    /// A unit of work over `db`.
    #[must_use]
    pub fn new(db: PgDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction>, DomainError> {
        ctx.check()?;
        let tx = self.db.pool().begin().await.map_err(StoreError::from)?;
        let id = TransactionId::new();
        self.db.register(id, tx);
        debug!(transaction_id = %id, "transaction opened");
        Ok(Box::new(PgTransaction {
            id,
            ctx: ctx.clone().with_transaction(id),
            db: self.db.clone(),
            finished: false,
        }))
    }
}

struct PgTransaction {
    id: TransactionId,
    ctx: Context,
    db: PgDatabase,
    finished: bool,
}

#[async_trait]
impl Transaction for PgTransaction {
    fn context(&self) -> &Context {
        &self.ctx
    }

    async fn commit(mut self: Box<Self>) -> Result<(), DomainError> {
        self.finished = true;
        let tx = self.db.take(self.id)?;
        tx.commit().await.map_err(StoreError::from)?;
        debug!(transaction_id = %self.id, "transaction committed");
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), DomainError> {
        self.finished = true;
        let tx = self.db.take(self.id)?;
        tx.rollback().await.map_err(StoreError::from)?;
        debug!(transaction_id = %self.id, "transaction rolled back");
        Ok(())
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if !self.finished && self.db.forget(self.id).is_some() {
            debug!(transaction_id = %self.id, "transaction dropped without commit");
        }
    }
}
