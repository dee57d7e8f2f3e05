//! Input inspection through `ffprobe`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use narwhal_core::context::Context;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::domain::aggregates::MediaProbe;
use crate::error::TranscodeError;

/// Default time allowed for one probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ProbeDocument {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

/// Parses `ffprobe -print_format json -show_format -show_streams` output.
///
/// # Errors
///
/// Returns `TranscodeError::ProbeFailed` for malformed output or inputs
/// without a sized video stream.
pub fn parse_probe(json: &[u8]) -> Result<MediaProbe, TranscodeError> {
    let document: ProbeDocument =
        serde_json::from_slice(json).map_err(|e| TranscodeError::ProbeFailed(format!("unreadable probe output: {e}")))?;
    let video = document
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| TranscodeError::ProbeFailed("input has no video stream".into()))?;
    let (Some(width), Some(height)) = (video.width, video.height) else {
        return Err(TranscodeError::ProbeFailed("video stream has no dimensions".into()));
    };
    let audio = document.streams.iter().find(|s| s.codec_type.as_deref() == Some("audio"));
    let format = document.format.as_ref();
    let duration_seconds = format
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .ok_or_else(|| TranscodeError::ProbeFailed("input has no duration".into()))?;

    Ok(MediaProbe {
        width,
        height,
        duration_seconds,
        video_codec: video.codec_name.clone(),
        audio_codec: audio.and_then(|a| a.codec_name.clone()),
        bit_rate: format.and_then(|f| f.bit_rate.as_deref()).and_then(|b| b.parse().ok()),
        frame_rate: video
            .r_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| video.avg_frame_rate.as_deref().and_then(parse_frame_rate)),
    })
}

/// Parses an `ffprobe` rate such as `24000/1001` or `25`; `0/0` yields
/// `None`.
#[must_use]
pub fn parse_frame_rate(value: &str) -> Option<f64> {
    let rate = match value.trim().split_once('/') {
        Some((num, den)) => {
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num.trim().parse::<f64>().ok()? / den
        }
        None => value.trim().parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

/// Runs `ffprobe` against inputs.
#[derive(Debug, Clone)]
pub struct Prober {
    path: PathBuf,
    timeout: Duration,
}

impl Prober {
    /// A prober using the executable at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    /// Probes `input`.
    ///
    /// # Errors
    ///
    /// `ProbeTimeout` when the tool does not answer in time, `JobCancelled`
    /// when `ctx` is cancelled, and `ProbeFailed` otherwise.
    pub async fn probe(&self, ctx: &Context, input: &Path) -> Result<MediaProbe, TranscodeError> {
        let mut command = Command::new(&self.path);
        command
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(input)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        debug!(tool = %self.path.display(), input = %input.display(), "probing input");

        let output = tokio::select! {
            output = tokio::time::timeout(self.timeout, command.output()) => match output {
                Ok(output) => output.map_err(|e| TranscodeError::ProbeFailed(format!("{}: {e}", self.path.display())))?,
                Err(_) => return Err(TranscodeError::ProbeTimeout(self.timeout.as_secs())),
            },
            () = ctx.cancelled() => return Err(TranscodeError::JobCancelled),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            return Err(TranscodeError::ProbeFailed(format!(
                "ffprobe exited with {:?}: {stderr}",
                output.status.code()
            )));
        }
        parse_probe(&output.stdout)
    }
}

/// Confirms that `tool` runs by invoking `tool -version`.
///
/// # Errors
///
/// Returns `TranscodeError::ToolUnavailable` if it cannot be executed or
/// exits unsuccessfully.
pub async fn verify_tool(tool: &Path) -> Result<String, TranscodeError> {
    let unavailable = |reason: String| TranscodeError::ToolUnavailable {
        tool: tool.display().to_string(),
        reason,
    };
    let output = Command::new(tool)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| unavailable(e.to_string()))?;
    if !output.status.success() {
        return Err(unavailable(format!("exited with {:?}", output.status.code())));
    }
    let banner = String::from_utf8_lossy(&output.stdout);
    Ok(banner.lines().next().unwrap_or_default().to_owned())
}
