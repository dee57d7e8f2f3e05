//! Saga application layer: the orchestrator, saga persistence and the media processing workflow.

pub mod media_processing;
pub mod orchestrator;
pub mod store;
pub mod trigger;
