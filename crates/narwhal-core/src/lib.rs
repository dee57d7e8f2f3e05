//! Narwhal Core — shared contracts for the processing backbone.
//!
//! This crate defines identifiers, the error taxonomy, the event base
//! contracts, the integration envelope, persistence traits and the
//! collaborator ports every other crate depends on. The in-memory
//! persistence in [`memory`] backs tests and single-node development.

pub mod aggregate;
pub mod clock;
pub mod command;
pub mod context;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod event;
pub mod memory;
pub mod ports;
pub mod registry;
pub mod repository;
