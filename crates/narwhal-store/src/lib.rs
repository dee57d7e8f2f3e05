//! Narwhal Store — `PostgreSQL` persistence.
//!
//! Implements the unit of work, the domain event log, JSONB aggregate
//! documents with optimistic versioning and the saga store on one shared
//! [`PgDatabase`]. Stores given a context opened by [`PgUnitOfWork`] join
//! that transaction.

pub mod aggregate_store;
pub mod database;
pub mod error;
pub mod event_store;
pub mod saga_store;
pub mod schema;
pub mod unit_of_work;

pub use aggregate_store::PgAggregateStore;
pub use database::PgDatabase;
pub use error::StoreError;
pub use event_store::PgEventStore;
pub use saga_store::PgSagaStore;
pub use unit_of_work::PgUnitOfWork;
