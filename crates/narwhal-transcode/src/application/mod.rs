//! Transcode application services.

pub mod engine;
