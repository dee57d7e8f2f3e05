//! Narwhal Download — acquisition of source media.
//!
//! Tracks each download as an aggregate, selects a [`DownloadEngine`] for
//! its URL and runs the transfer in the background, publishing lifecycle
//! events as it goes.

pub mod application;
pub mod domain;
pub mod error;

pub use application::engine::{DownloadEngine, FetchProgress, FetchRequest, Fetched, FilesystemEngine};
pub use application::manager::{DownloadManager, DownloadStores};
pub use domain::aggregates::Download;
pub use error::DownloadError;
