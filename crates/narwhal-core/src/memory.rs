//! In-memory persistence for tests and single-node development.
//!
//! Writes made with a transaction-scoped [`Context`] are staged per
//! transaction and become visible to other readers only on commit.
//! Version checks run both when a write is staged and again at commit.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::aggregate::AggregateRoot;
use crate::context::{Context, TransactionId};
use crate::error::DomainError;
use crate::repository::{AggregateStore, EventStore, StoredEvent, Transaction, UnitOfWork};

/// A store whose staged writes are committed or discarded by the unit of work.
pub trait TransactionParticipant: Send + Sync {
    /// Verifies staged writes of `tx` still apply against committed state.
    ///
    /// # Errors
    ///
    /// Returns the conflict that would make the commit unsafe.
    fn prepare(&self, tx: TransactionId) -> Result<(), DomainError>;

    /// Applies the staged writes of `tx`.
    fn apply(&self, tx: TransactionId);

    /// Drops the staged writes of `tx`.
    fn discard(&self, tx: TransactionId);
}

#[derive(Default)]
struct UnitOfWorkShared {
    participants: RwLock<Vec<Arc<dyn TransactionParticipant>>>,
    commit_lock: Mutex<()>,
}

impl UnitOfWorkShared {
    fn discard_all(&self, tx: TransactionId) {
        for participant in self.participants.read().iter() {
            participant.discard(tx);
        }
    }
}

/// In-memory unit of work coordinating every enlisted store.
#[derive(Clone, Default)]
pub struct InMemoryUnitOfWork {
    shared: Arc<UnitOfWorkShared>,
}

impl std::fmt::Debug for InMemoryUnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryUnitOfWork")
            .field("participants", &self.shared.participants.read().len())
            .finish()
    }
}

impl InMemoryUnitOfWork {
    /// Creates a unit of work with no participants.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a store to every future commit and rollback.
    pub fn enlist(&self, participant: Arc<dyn TransactionParticipant>) {
        self.shared.participants.write().push(participant);
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction>, DomainError> {
        ctx.check()?;
        let id = TransactionId::new();
        debug!(transaction_id = %id, "transaction opened");
        Ok(Box::new(InMemoryTransaction {
            id,
            ctx: ctx.clone().with_transaction(id),
            shared: Arc::clone(&self.shared),
            finished: false,
        }))
    }
}

struct InMemoryTransaction {
    id: TransactionId,
    ctx: Context,
    shared: Arc<UnitOfWorkShared>,
    finished: bool,
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    fn context(&self) -> &Context {
        &self.ctx
    }

    async fn commit(mut self: Box<Self>) -> Result<(), DomainError> {
        self.finished = true;
        let _guard = self.shared.commit_lock.lock();
        let participants = self.shared.participants.read().clone();
        for participant in &participants {
            if let Err(err) = participant.prepare(self.id) {
                for p in &participants {
                    p.discard(self.id);
                }
                debug!(transaction_id = %self.id, error = %err, "transaction aborted at commit");
                return Err(err);
            }
        }
        for participant in &participants {
            participant.apply(self.id);
        }
        debug!(transaction_id = %self.id, "transaction committed");
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), DomainError> {
        self.finished = true;
        self.shared.discard_all(self.id);
        debug!(transaction_id = %self.id, "transaction rolled back");
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.discard_all(self.id);
        }
    }
}

#[derive(Debug, Clone)]
struct Row {
    version: i64,
    document: serde_json::Value,
}

#[derive(Debug, Clone)]
enum StagedWrite {
    Upsert { id: Uuid, expected: i64, row: Row },
    Delete { id: Uuid, expected: i64 },
}

impl StagedWrite {
    fn id(&self) -> Uuid {
        match self {
            Self::Upsert { id, .. } | Self::Delete { id, .. } => *id,
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    committed: HashMap<Uuid, Row>,
    staged: HashMap<TransactionId, Vec<StagedWrite>>,
}

impl Tables {
    /// Row visible to `tx`: its own staged writes over committed state.
    fn visible(&self, tx: Option<TransactionId>, id: Uuid) -> Option<Row> {
        let mut row = self.committed.get(&id).cloned();
        if let Some(writes) = tx.and_then(|tx| self.staged.get(&tx)) {
            for write in writes.iter().filter(|w| w.id() == id) {
                row = match write {
                    StagedWrite::Upsert { row, .. } => Some(row.clone()),
                    StagedWrite::Delete { .. } => None,
                };
            }
        }
        row
    }

    fn visible_ids(&self, tx: Option<TransactionId>) -> Vec<Uuid> {
        let mut ids: HashSet<Uuid> = self.committed.keys().copied().collect();
        if let Some(writes) = tx.and_then(|tx| self.staged.get(&tx)) {
            ids.extend(writes.iter().map(StagedWrite::id));
        }
        let mut ids: Vec<Uuid> = ids.into_iter().collect();
        ids.sort();
        ids
    }
}

fn check_version(id: Uuid, current: Option<&Row>, expected: i64) -> Result<(), DomainError> {
    let actual = current.map_or(0, |row| row.version);
    if actual == expected {
        Ok(())
    } else {
        Err(DomainError::ConcurrentModification {
            aggregate_id: id,
            expected,
            actual,
        })
    }
}

/// In-memory aggregate document store.
pub struct MemoryAggregateStore<A> {
    tables: RwLock<Tables>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> std::fmt::Debug for MemoryAggregateStore<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAggregateStore")
            .field("rows", &self.tables.read().committed.len())
            .finish()
    }
}

impl<A: AggregateRoot> MemoryAggregateStore<A> {
    /// A store not enlisted in any unit of work.
    #[must_use]
    pub fn standalone() -> Arc<Self> {
        Arc::new(Self {
            tables: RwLock::new(Tables::default()),
            _aggregate: PhantomData,
        })
    }

    /// A store enlisted in `uow`.
    #[must_use]
    pub fn new(uow: &InMemoryUnitOfWork) -> Arc<Self> {
        let store = Self::standalone();
        uow.enlist(Arc::clone(&store) as Arc<dyn TransactionParticipant>);
        store
    }

    fn decode(row: &Row) -> Result<A, DomainError> {
        let mut aggregate: A = serde_json::from_value(row.document.clone()).map_err(|e| {
            DomainError::Infrastructure(format!("{} document corrupt: {e}", A::AGGREGATE_TYPE))
        })?;
        aggregate.state_mut().mark_persisted();
        Ok(aggregate)
    }
}

impl<A: AggregateRoot> TransactionParticipant for MemoryAggregateStore<A> {
    fn prepare(&self, tx: TransactionId) -> Result<(), DomainError> {
        let tables = self.tables.read();
        let Some(writes) = tables.staged.get(&tx) else {
            return Ok(());
        };
        let mut versions: HashMap<Uuid, Option<Row>> = HashMap::new();
        for write in writes {
            let id = write.id();
            let current = versions
                .entry(id)
                .or_insert_with(|| tables.committed.get(&id).cloned());
            match write {
                StagedWrite::Upsert { expected, row, .. } => {
                    check_version(id, current.as_ref(), *expected)?;
                    *current = Some(row.clone());
                }
                StagedWrite::Delete { expected, .. } => {
                    check_version(id, current.as_ref(), *expected)?;
                    *current = None;
                }
            }
        }
        Ok(())
    }

    fn apply(&self, tx: TransactionId) {
        let mut tables = self.tables.write();
        for write in tables.staged.remove(&tx).unwrap_or_default() {
            match write {
                StagedWrite::Upsert { id, row, .. } => {
                    tables.committed.insert(id, row);
                }
                StagedWrite::Delete { id, .. } => {
                    tables.committed.remove(&id);
                }
            }
        }
    }

    fn discard(&self, tx: TransactionId) {
        self.tables.write().staged.remove(&tx);
    }
}

#[async_trait]
impl<A: AggregateRoot> AggregateStore<A> for MemoryAggregateStore<A> {
    async fn save(&self, ctx: &Context, aggregate: &mut A) -> Result<(), DomainError> {
        ctx.check()?;
        aggregate.validate()?;
        let id = aggregate.aggregate_id();
        let expected = aggregate.state().persisted_version();
        let row = Row {
            version: aggregate.version(),
            document: serde_json::to_value(&*aggregate)?,
        };

        let mut tables = self.tables.write();
        let current = tables.visible(ctx.transaction(), id);
        check_version(id, current.as_ref(), expected)?;
        match ctx.transaction() {
            Some(tx) => tables
                .staged
                .entry(tx)
                .or_default()
                .push(StagedWrite::Upsert { id, expected, row }),
            None => {
                tables.committed.insert(id, row);
            }
        }
        drop(tables);

        aggregate.state_mut().mark_persisted();
        Ok(())
    }

    async fn find_by_id(&self, ctx: &Context, id: Uuid) -> Result<Option<A>, DomainError> {
        ctx.check()?;
        let row = self.tables.read().visible(ctx.transaction(), id);
        row.as_ref().map(Self::decode).transpose()
    }

    async fn delete(&self, ctx: &Context, id: Uuid) -> Result<(), DomainError> {
        ctx.check()?;
        let mut tables = self.tables.write();
        let current = tables
            .visible(ctx.transaction(), id)
            .ok_or_else(|| DomainError::not_found(A::AGGREGATE_TYPE, id))?;
        match ctx.transaction() {
            Some(tx) => tables.staged.entry(tx).or_default().push(StagedWrite::Delete {
                id,
                expected: current.version,
            }),
            None => {
                tables.committed.remove(&id);
            }
        }
        Ok(())
    }

    async fn find_by_field(
        &self,
        ctx: &Context,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<Vec<A>, DomainError> {
        ctx.check()?;
        let tx = ctx.transaction();
        let tables = self.tables.read();
        tables
            .visible_ids(tx)
            .into_iter()
            .filter_map(|id| tables.visible(tx, id))
            .filter(|row| row.document.get(field) == Some(value))
            .map(|row| Self::decode(&row))
            .collect()
    }

    async fn find_all(&self, ctx: &Context) -> Result<Vec<A>, DomainError> {
        ctx.check()?;
        let tx = ctx.transaction();
        let tables = self.tables.read();
        tables
            .visible_ids(tx)
            .into_iter()
            .filter_map(|id| tables.visible(tx, id))
            .map(|row| Self::decode(&row))
            .collect()
    }
}

#[derive(Debug, Default)]
struct EventTables {
    committed: Vec<StoredEvent>,
    staged: HashMap<TransactionId, Vec<StoredEvent>>,
}

impl EventTables {
    fn check_unique(&self, tx: Option<TransactionId>, event: &StoredEvent) -> Result<(), DomainError> {
        let staged = tx.and_then(|tx| self.staged.get(&tx)).into_iter().flatten();
        for existing in self.committed.iter().chain(staged) {
            if existing.event_id == event.event_id {
                return Err(DomainError::Conflict(format!(
                    "event {} already stored",
                    event.event_id
                )));
            }
            if existing.aggregate_id == event.aggregate_id
                && existing.sequence_number == event.sequence_number
            {
                return Err(DomainError::ConcurrentModification {
                    aggregate_id: event.aggregate_id,
                    expected: event.sequence_number - 1,
                    actual: event.sequence_number,
                });
            }
        }
        Ok(())
    }
}

/// In-memory event store.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    tables: RwLock<EventTables>,
}

impl MemoryEventStore {
    /// A store not enlisted in any unit of work.
    #[must_use]
    pub fn standalone() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A store enlisted in `uow`.
    #[must_use]
    pub fn new(uow: &InMemoryUnitOfWork) -> Arc<Self> {
        let store = Self::standalone();
        uow.enlist(Arc::clone(&store) as Arc<dyn TransactionParticipant>);
        store
    }

    /// Every committed event, in append order.
    #[must_use]
    pub fn all(&self) -> Vec<StoredEvent> {
        self.tables.read().committed.clone()
    }
}

impl TransactionParticipant for MemoryEventStore {
    fn prepare(&self, tx: TransactionId) -> Result<(), DomainError> {
        let tables = self.tables.read();
        for event in tables.staged.get(&tx).into_iter().flatten() {
            tables.check_unique(None, event)?;
        }
        Ok(())
    }

    fn apply(&self, tx: TransactionId) {
        let mut tables = self.tables.write();
        let staged = tables.staged.remove(&tx).unwrap_or_default();
        tables.committed.extend(staged);
    }

    fn discard(&self, tx: TransactionId) {
        self.tables.write().staged.remove(&tx);
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn save(&self, ctx: &Context, events: &[StoredEvent]) -> Result<(), DomainError> {
        ctx.check()?;
        let mut tables = self.tables.write();
        let tx = ctx.transaction();
        for (index, event) in events.iter().enumerate() {
            tables.check_unique(tx, event)?;
            if events[..index].iter().any(|e| e.event_id == event.event_id) {
                return Err(DomainError::Conflict(format!("event {} duplicated in batch", event.event_id)));
            }
        }
        match tx {
            Some(tx) => tables.staged.entry(tx).or_default().extend(events.iter().cloned()),
            None => tables.committed.extend(events.iter().cloned()),
        }
        Ok(())
    }

    async fn load(&self, ctx: &Context, aggregate_id: Uuid) -> Result<Vec<StoredEvent>, DomainError> {
        ctx.check()?;
        let tables = self.tables.read();
        let staged = ctx
            .transaction()
            .and_then(|tx| tables.staged.get(&tx))
            .into_iter()
            .flatten();
        let mut events: Vec<StoredEvent> = tables
            .committed
            .iter()
            .chain(staged)
            .filter(|e| e.aggregate_id == aggregate_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.sequence_number);
        Ok(events)
    }

    async fn unpublished(&self, ctx: &Context, limit: usize) -> Result<Vec<StoredEvent>, DomainError> {
        ctx.check()?;
        Ok(self
            .tables
            .read()
            .committed
            .iter()
            .filter(|e| e.published_at.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_published(
        &self,
        ctx: &Context,
        event_id: Uuid,
        published_at: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        ctx.check()?;
        let mut tables = self.tables.write();
        let event = tables
            .committed
            .iter_mut()
            .find(|e| e.event_id == event_id)
            .ok_or_else(|| DomainError::not_found("event", event_id))?;
        event.published_at = Some(published_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateState;
    use crate::clock::SystemClock;
    use crate::event::{DomainEvent, EventMetadata};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone)]
    struct NoEvent(EventMetadata);

    impl DomainEvent for NoEvent {
        fn event_type(&self) -> &'static str {
            "Noop"
        }
        fn to_payload(&self) -> serde_json::Value {
            serde_json::Value::Null
        }
        fn metadata(&self) -> &EventMetadata {
            &self.0
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Counter {
        #[serde(flatten)]
        state: AggregateState,
        label: String,
        #[serde(skip)]
        events: Vec<NoEvent>,
    }

    impl Counter {
        fn create(label: &str) -> Self {
            let mut state = AggregateState::new(Uuid::new_v4(), &SystemClock);
            state.touch(&SystemClock);
            Self {
                state,
                label: label.to_owned(),
                events: Vec::new(),
            }
        }

        fn bump(&mut self) {
            self.state.touch(&SystemClock);
        }
    }

    impl AggregateRoot for Counter {
        type Event = NoEvent;
        const AGGREGATE_TYPE: &'static str = "Counter";

        fn state(&self) -> &AggregateState {
            &self.state
        }
        fn state_mut(&mut self) -> &mut AggregateState {
            &mut self.state
        }
        fn validate(&self) -> Result<(), DomainError> {
            if self.label.is_empty() {
                return Err(DomainError::Validation("label required".into()));
            }
            Ok(())
        }
        fn status_tag(&self) -> &'static str {
            "active"
        }
        fn uncommitted_events(&self) -> &[NoEvent] {
            &self.events
        }
        fn take_uncommitted_events(&mut self) -> Vec<NoEvent> {
            std::mem::take(&mut self.events)
        }
    }

    #[tokio::test]
    async fn test_save_then_find_round_trips() {
        let uow = InMemoryUnitOfWork::new();
        let store = MemoryAggregateStore::<Counter>::new(&uow);
        let ctx = Context::background();
        let mut counter = Counter::create("a");

        store.save(&ctx, &mut counter).await.unwrap();
        let loaded = store.find_by_id(&ctx, counter.state.id).await.unwrap().unwrap();

        assert_eq!(loaded.state, counter.state);
        assert_eq!(loaded.label, "a");
    }

    #[tokio::test]
    async fn test_stale_save_fails_with_concurrent_modification() {
        let store = MemoryAggregateStore::<Counter>::standalone();
        let ctx = Context::background();
        let mut counter = Counter::create("a");
        store.save(&ctx, &mut counter).await.unwrap();

        let mut first = store.find_by_id(&ctx, counter.state.id).await.unwrap().unwrap();
        let mut second = first.clone();
        first.bump();
        second.bump();

        store.save(&ctx, &mut first).await.unwrap();
        let err = store.save(&ctx, &mut second).await.unwrap_err();

        assert!(matches!(
            err,
            DomainError::ConcurrentModification { expected: 1, actual: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_staged_writes_invisible_until_commit() {
        let uow = InMemoryUnitOfWork::new();
        let store = MemoryAggregateStore::<Counter>::new(&uow);
        let events = MemoryEventStore::new(&uow);
        let outside = Context::background();
        let tx = uow.begin(&outside).await.unwrap();
        let mut counter = Counter::create("a");

        store.save(tx.context(), &mut counter).await.unwrap();
        let event = NoEvent(EventMetadata::new("Noop", "Counter", counter.state.id, 1, "test", &outside, Utc::now()));
        events.save(tx.context(), &[StoredEvent::from_domain_event(&event)]).await.unwrap();

        assert!(store.find_by_id(&outside, counter.state.id).await.unwrap().is_none());
        assert!(store.find_by_id(tx.context(), counter.state.id).await.unwrap().is_some());
        assert!(events.all().is_empty());

        tx.commit().await.unwrap();

        assert!(store.find_by_id(&outside, counter.state.id).await.unwrap().is_some());
        assert_eq!(events.all().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_writes() {
        let uow = InMemoryUnitOfWork::new();
        let store = MemoryAggregateStore::<Counter>::new(&uow);
        let ctx = Context::background();
        let tx = uow.begin(&ctx).await.unwrap();
        let mut counter = Counter::create("a");

        store.save(tx.context(), &mut counter).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.find_by_id(&ctx, counter.state.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_detects_conflict_with_concurrent_transaction() {
        let uow = InMemoryUnitOfWork::new();
        let store = MemoryAggregateStore::<Counter>::new(&uow);
        let ctx = Context::background();
        let mut counter = Counter::create("a");
        store.save(&ctx, &mut counter).await.unwrap();

        let tx_a = uow.begin(&ctx).await.unwrap();
        let tx_b = uow.begin(&ctx).await.unwrap();
        let mut in_a = store.find_by_id(tx_a.context(), counter.state.id).await.unwrap().unwrap();
        let mut in_b = in_a.clone();
        in_a.bump();
        in_b.bump();
        store.save(tx_a.context(), &mut in_a).await.unwrap();
        store.save(tx_b.context(), &mut in_b).await.unwrap();

        tx_a.commit().await.unwrap();
        let err = tx_b.commit().await.unwrap_err();

        assert!(matches!(err, DomainError::ConcurrentModification { .. }));
        let stored = store.find_by_id(&ctx, counter.state.id).await.unwrap().unwrap();
        assert_eq!(stored.state.version, 2);
    }

    #[tokio::test]
    async fn test_find_by_field_and_delete() {
        let store = MemoryAggregateStore::<Counter>::standalone();
        let ctx = Context::background();
        let mut a = Counter::create("a");
        let mut b = Counter::create("b");
        store.save(&ctx, &mut a).await.unwrap();
        store.save(&ctx, &mut b).await.unwrap();

        let found = store.find_by_field(&ctx, "label", &serde_json::json!("b")).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].state.id, b.state.id);

        store.delete(&ctx, b.state.id).await.unwrap();
        assert_eq!(store.find_all(&ctx).await.unwrap().len(), 1);
        assert!(matches!(
            store.delete(&ctx, b.state.id).await,
            Err(DomainError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_aggregate_is_not_saved() {
        let store = MemoryAggregateStore::<Counter>::standalone();
        let mut counter = Counter::create("");

        let err = store.save(&Context::background(), &mut counter).await.unwrap_err();

        assert!(matches!(err, DomainError::Validation(_)));
    }
}
