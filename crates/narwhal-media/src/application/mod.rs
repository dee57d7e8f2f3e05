//! Application layer of the media catalog.

pub mod catalog;
pub mod query_handlers;
