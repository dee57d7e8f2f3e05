//! Domain layer of the media catalog.

pub mod aggregates;
pub mod commands;
pub mod events;
pub mod repositories;
