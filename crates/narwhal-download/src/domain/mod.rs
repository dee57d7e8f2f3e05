//! Download domain model.

pub mod aggregates;
pub mod events;
