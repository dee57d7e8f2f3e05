//! The step and definition contract.

use std::sync::Arc;

use async_trait::async_trait;
use narwhal_core::context::Context;
use narwhal_core::error::DomainError;

use crate::domain::saga::Saga;

/// One forward action of a saga and its undo.
///
/// Both directions may run more than once for the same saga after a
/// restart and must tolerate it.
#[async_trait]
pub trait SagaStep: Send + Sync {
    /// Unique name within the definition; used in event types.
    fn name(&self) -> &str;

    /// Performs the step, reading and writing the saga's data.
    async fn execute(&self, ctx: &Context, saga: &mut Saga) -> Result<(), DomainError>;

    /// Undoes a previously successful `execute`.
    async fn compensate(&self, ctx: &Context, saga: &Saga) -> Result<(), DomainError>;
}

/// An ordered list of steps registered under a saga type.
pub trait SagaDefinition: Send + Sync {
    /// Registered type name.
    fn saga_type(&self) -> &str;

    /// Steps in execution order.
    fn steps(&self) -> &[Arc<dyn SagaStep>];
}
