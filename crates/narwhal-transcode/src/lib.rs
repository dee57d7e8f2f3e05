//! Narwhal Transcode — conversion of downloaded media for streaming.
//!
//! Probes inputs with `ffprobe`, runs `ffmpeg` to produce an adaptive HLS
//! ladder, a progressive MP4 or a WebM file, tracks each request as a
//! [`TranscodeJob`] aggregate and publishes its lifecycle events.

pub mod application;
pub mod domain;
pub mod error;
pub mod playlist;
pub mod storage;
pub mod tools;

pub use application::engine::{TranscodeEngine, TranscodeSettings, TranscodeStores};
pub use domain::aggregates::{JobProgress, JobResult, MediaProbe, TranscodeJob};
pub use domain::profile::{Capabilities, EncodingOptions, HlsVariant, JobOptions, Resolution, TranscodeProfile};
pub use error::TranscodeError;
pub use storage::LocalStorage;
pub use tools::probe::{Prober, verify_tool};
