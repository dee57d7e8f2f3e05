//! Narwhal Media — the media catalog bounded context.
//!
//! Responsible for movies, series and their episodes: invariants, the
//! processing status lattice, media domain events and the catalog service
//! that persists them under the outbox protocol.

pub mod application;
pub mod domain;

pub use application::catalog::{CatalogStores, MediaCatalog};
pub use domain::aggregates::{Episode, EpisodeEntry, Media, Movie, Series};
pub use domain::events::{MediaType, ProcessingRequest};
