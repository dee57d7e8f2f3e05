//! Saga persistence contract and its in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use narwhal_core::context::Context;
use narwhal_core::error::DomainError;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::domain::saga::{Saga, SagaState};

/// Authoritative storage of saga instances.
///
/// Writes for distinct sagas may run concurrently; writes for one saga are
/// applied in call order.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Inserts or replaces a saga.
    async fn save(&self, ctx: &Context, saga: &Saga) -> Result<(), DomainError>;

    /// Loads a saga.
    ///
    /// Fails with `DomainError::NotFound` for an unknown id.
    async fn get(&self, ctx: &Context, id: Uuid) -> Result<Saga, DomainError>;

    /// Overwrites only the state of a saga.
    async fn update_state(&self, ctx: &Context, id: Uuid, state: SagaState) -> Result<(), DomainError>;

    /// Sagas in `pending`, `running` or `compensating`, oldest first.
    async fn find_incomplete(&self, ctx: &Context) -> Result<Vec<Saga>, DomainError>;

    /// Sagas whose data carries `value` as a string under `key`, oldest first.
    async fn find_by_data(&self, ctx: &Context, key: &str, value: &str) -> Result<Vec<Saga>, DomainError>;

    /// Sagas, newest first, optionally restricted to one state.
    async fn list(&self, ctx: &Context, state: Option<SagaState>, limit: usize) -> Result<Vec<Saga>, DomainError>;
}

/// Process-local saga store.
#[derive(Debug, Default)]
pub struct InMemorySagaStore {
    sagas: RwLock<HashMap<Uuid, Saga>>,
}

impl InMemorySagaStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn collect(&self, keep: impl Fn(&Saga) -> bool) -> Vec<Saga> {
        let mut sagas: Vec<Saga> = self.sagas.read().values().filter(|s| keep(s)).cloned().collect();
        sagas.sort_by_key(|s| s.created_at);
        sagas
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn save(&self, ctx: &Context, saga: &Saga) -> Result<(), DomainError> {
        ctx.check()?;
        self.sagas.write().insert(saga.id, saga.clone());
        Ok(())
    }

    async fn get(&self, _ctx: &Context, id: Uuid) -> Result<Saga, DomainError> {
        self.sagas
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| DomainError::not_found("Saga", id))
    }

    async fn update_state(&self, ctx: &Context, id: Uuid, state: SagaState) -> Result<(), DomainError> {
        ctx.check()?;
        let mut sagas = self.sagas.write();
        let saga = sagas.get_mut(&id).ok_or_else(|| DomainError::not_found("Saga", id))?;
        saga.state = state;
        Ok(())
    }

    async fn find_incomplete(&self, _ctx: &Context) -> Result<Vec<Saga>, DomainError> {
        Ok(self.collect(|s| SagaState::INCOMPLETE.contains(&s.state)))
    }

    async fn find_by_data(&self, _ctx: &Context, key: &str, value: &str) -> Result<Vec<Saga>, DomainError> {
        Ok(self.collect(|s| s.data.get(key).and_then(serde_json::Value::as_str) == Some(value)))
    }

    async fn list(&self, _ctx: &Context, state: Option<SagaState>, limit: usize) -> Result<Vec<Saga>, DomainError> {
        let mut sagas = self.collect(|s| state.is_none_or(|wanted| s.state == wanted));
        sagas.reverse();
        sagas.truncate(limit);
        Ok(sagas)
    }
}
