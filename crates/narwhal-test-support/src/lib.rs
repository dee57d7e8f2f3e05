//! Shared test doubles and fixtures for the Narwhal processing backbone.

mod clock;
mod publisher;
mod services;
#[cfg(unix)]
mod tools;

pub use clock::{FixedClock, TickingClock};
pub use publisher::{FailingPublisher, RecordingPublisher};
pub use services::{InstantDownloadService, InstantTranscodeService, MediaCall, RecordingMediaService};
#[cfg(unix)]
pub use tools::{FakeFfmpeg, FakeProbe, write_fake_ffmpeg, write_fake_ffprobe};
