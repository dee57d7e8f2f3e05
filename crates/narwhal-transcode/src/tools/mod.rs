//! External tool integration: `ffprobe` inspection, `ffmpeg` command lines
//! and progress parsing.

pub mod args;
pub mod probe;
pub mod progress;
