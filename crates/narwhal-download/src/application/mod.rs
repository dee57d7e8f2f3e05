//! Download application services.

pub mod engine;
pub mod manager;
