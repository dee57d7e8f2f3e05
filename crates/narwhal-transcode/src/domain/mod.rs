//! Transcode domain model.

pub mod aggregates;
pub mod events;
pub mod profile;
