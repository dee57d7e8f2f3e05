//! Saga domain model: instances, data keys, lifecycle events and the step contract.

pub mod events;
pub mod saga;
pub mod step;
