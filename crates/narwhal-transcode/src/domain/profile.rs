//! Output profiles, encoding options and the HLS bitrate ladder.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TranscodeError;

/// Output profile of a transcode job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeProfile {
    /// Adaptive ladder derived from the input resolution.
    Hls,
    /// Adaptive ladder capped at 1080p.
    #[serde(rename = "hls_1080p")]
    Hls1080p,
    /// Adaptive ladder capped at 720p.
    #[serde(rename = "hls_720p")]
    Hls720p,
    /// Single 480p rendition.
    #[serde(rename = "hls_480p")]
    Hls480p,
    /// Progressive MP4 (H.264/AAC).
    Mp4,
    /// WebM (VP9/Opus).
    Webm,
}

impl TranscodeProfile {
    /// Every profile this build can produce.
    pub const ALL: [Self; 6] = [
        Self::Hls,
        Self::Hls1080p,
        Self::Hls720p,
        Self::Hls480p,
        Self::Mp4,
        Self::Webm,
    ];

    /// Wire form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hls => "hls",
            Self::Hls1080p => "hls_1080p",
            Self::Hls720p => "hls_720p",
            Self::Hls480p => "hls_480p",
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
        }
    }

    /// Whether the output is an HLS variant tree.
    #[must_use]
    pub fn is_hls(self) -> bool {
        matches!(self, Self::Hls | Self::Hls1080p | Self::Hls720p | Self::Hls480p)
    }

    /// Tallest ladder rung the profile allows.
    #[must_use]
    pub fn ladder_cap(self) -> Option<u32> {
        match self {
            Self::Hls | Self::Hls1080p => Some(1080),
            Self::Hls720p => Some(720),
            Self::Hls480p => Some(480),
            Self::Mp4 | Self::Webm => None,
        }
    }

    /// File extension of single-file outputs.
    #[must_use]
    pub fn extension(self) -> Option<&'static str> {
        match self {
            Self::Mp4 => Some("mp4"),
            Self::Webm => Some("webm"),
            _ => None,
        }
    }
}

impl fmt::Display for TranscodeProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TranscodeProfile {
    type Err = TranscodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|profile| profile.as_str() == s)
            .ok_or_else(|| TranscodeError::UnsupportedProfile(s.to_owned()))
    }
}

/// One rendition of the HLS ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HlsVariant {
    /// Display name, e.g. `720p`.
    pub name: String,
    /// Output width.
    pub width: u32,
    /// Output height.
    pub height: u32,
    /// Target video bitrate (kb/s).
    pub video_bitrate_kbps: u32,
    /// Rate-control buffer (kb/s).
    pub buffer_size_kbps: u32,
    /// Constant rate factor.
    pub crf: u8,
    /// Audio bitrate (kb/s).
    pub audio_bitrate_kbps: u32,
}

impl HlsVariant {
    fn rung(name: &str, width: u32, height: u32, video_bitrate_kbps: u32, buffer_size_kbps: u32, crf: u8) -> Self {
        Self {
            name: name.to_owned(),
            width,
            height,
            video_bitrate_kbps,
            buffer_size_kbps,
            crf,
            audio_bitrate_kbps: 128,
        }
    }

    /// Total advertised bandwidth in bits per second.
    #[must_use]
    pub fn bandwidth(&self) -> u64 {
        (u64::from(self.video_bitrate_kbps) + u64::from(self.audio_bitrate_kbps)) * 1000
    }
}

/// The default ladder, tallest first.
#[must_use]
pub fn default_ladder() -> Vec<HlsVariant> {
    vec![
        HlsVariant::rung("1080p", 1920, 1080, 5000, 10_000, 22),
        HlsVariant::rung("720p", 1280, 720, 3000, 6000, 23),
        HlsVariant::rung("480p", 854, 480, 1500, 3000, 23),
    ]
}

/// Ladder rungs for `profile` that do not upscale an input of the given
/// dimensions nor exceed a requested output resolution. The lowest allowed
/// rung is always kept.
#[must_use]
pub fn ladder_for(profile: TranscodeProfile, input: Option<(u32, u32)>, options: &EncodingOptions) -> Vec<HlsVariant> {
    let Some(cap) = profile.ladder_cap() else {
        return Vec::new();
    };
    let input = match (input, options.resolution) {
        (Some((width, height)), Some(limit)) => Some((width.min(limit.width), height.min(limit.height))),
        (None, Some(limit)) => Some((limit.width, limit.height)),
        (input, None) => input,
    };
    let allowed: Vec<HlsVariant> = default_ladder().into_iter().filter(|v| v.height <= cap).collect();
    let mut variants: Vec<HlsVariant> = match input {
        Some((width, height)) => allowed
            .iter()
            .filter(|v| v.width <= width && v.height <= height)
            .cloned()
            .collect(),
        None => allowed.clone(),
    };
    if variants.is_empty() {
        variants.extend(allowed.last().cloned());
    }
    for variant in &mut variants {
        if let Some(bitrate) = options.video_bitrate_kbps {
            variant.video_bitrate_kbps = bitrate;
        }
        if let Some(buffer) = options.buffer_size_kbps {
            variant.buffer_size_kbps = buffer;
        }
        if let Some(crf) = options.crf_override {
            variant.crf = crf;
        }
        variant.audio_bitrate_kbps = options.audio_bitrate_kbps;
    }
    variants
}

/// Output frame size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Caller-supplied overrides; unset fields keep the profile default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Video encoder.
    pub video_codec: Option<String>,
    /// Audio encoder.
    pub audio_codec: Option<String>,
    /// Video bitrate cap (kb/s).
    pub video_bitrate_kbps: Option<u32>,
    /// Rate-control buffer (kb/s).
    pub buffer_size_kbps: Option<u32>,
    /// Encoder preset.
    pub preset: Option<String>,
    /// Constant rate factor.
    pub crf: Option<u8>,
    /// Audio bitrate (kb/s).
    pub audio_bitrate_kbps: Option<u32>,
    /// Audio channel count.
    pub audio_channels: Option<u8>,
    /// HLS segment duration (s).
    pub segment_seconds: Option<u32>,
    /// Output size; bounds the HLS ladder.
    pub resolution: Option<Resolution>,
    /// Output frame rate.
    pub frame_rate: Option<f64>,
    /// Arguments passed to `ffmpeg` before the output target.
    pub extra_args: Vec<String>,
}

/// Fully resolved encoding parameters of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingOptions {
    /// Video encoder.
    pub video_codec: String,
    /// Audio encoder.
    pub audio_codec: String,
    /// Video bitrate cap (kb/s); HLS rungs carry their own when unset.
    pub video_bitrate_kbps: Option<u32>,
    /// Rate-control buffer (kb/s).
    pub buffer_size_kbps: Option<u32>,
    /// Encoder preset.
    pub preset: Option<String>,
    /// Constant rate factor for single-file outputs.
    pub crf: u8,
    /// Explicit CRF applied to every HLS rung.
    pub crf_override: Option<u8>,
    /// Audio bitrate (kb/s).
    pub audio_bitrate_kbps: u32,
    /// Audio channel count.
    pub audio_channels: u8,
    /// HLS segment duration (s).
    pub segment_seconds: u32,
    /// HLS playlist type.
    pub playlist_type: String,
    /// Output size; the input size when unset.
    #[serde(default)]
    pub resolution: Option<Resolution>,
    /// Output frame rate; the input rate when unset.
    #[serde(default)]
    pub frame_rate: Option<f64>,
    /// Arguments passed to `ffmpeg` before the output target.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl EncodingOptions {
    /// Profile defaults.
    #[must_use]
    pub fn defaults(profile: TranscodeProfile) -> Self {
        let (video_codec, audio_codec, preset, crf) = match profile {
            TranscodeProfile::Webm => ("libvpx-vp9", "libopus", None, 30),
            _ => ("libx264", "aac", Some("fast"), 23),
        };
        Self {
            video_codec: video_codec.to_owned(),
            audio_codec: audio_codec.to_owned(),
            video_bitrate_kbps: None,
            buffer_size_kbps: None,
            preset: preset.map(str::to_owned),
            crf,
            crf_override: None,
            audio_bitrate_kbps: 128,
            audio_channels: 2,
            segment_seconds: 6,
            playlist_type: "vod".to_owned(),
            resolution: None,
            frame_rate: None,
            extra_args: Vec::new(),
        }
    }

    /// Profile defaults with `overrides` applied.
    #[must_use]
    pub fn resolve(profile: TranscodeProfile, overrides: &JobOptions) -> Self {
        let mut options = Self::defaults(profile);
        if let Some(codec) = &overrides.video_codec {
            options.video_codec.clone_from(codec);
        }
        if let Some(codec) = &overrides.audio_codec {
            options.audio_codec.clone_from(codec);
        }
        if overrides.preset.is_some() {
            options.preset.clone_from(&overrides.preset);
        }
        if let Some(crf) = overrides.crf {
            options.crf = crf;
            options.crf_override = Some(crf);
        }
        options.video_bitrate_kbps = overrides.video_bitrate_kbps.or(options.video_bitrate_kbps);
        options.buffer_size_kbps = overrides.buffer_size_kbps.or(options.buffer_size_kbps);
        options.audio_bitrate_kbps = overrides.audio_bitrate_kbps.unwrap_or(options.audio_bitrate_kbps);
        options.audio_channels = overrides.audio_channels.unwrap_or(options.audio_channels);
        options.segment_seconds = overrides.segment_seconds.unwrap_or(options.segment_seconds);
        options.resolution = overrides.resolution.or(options.resolution);
        options.frame_rate = overrides
            .frame_rate
            .filter(|rate| rate.is_finite() && *rate > 0.0)
            .or(options.frame_rate);
        options.extra_args.clone_from(&overrides.extra_args);
        options
    }
}

/// What the engine can produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Supported profiles.
    pub profiles: Vec<TranscodeProfile>,
    /// Video encoders used by those profiles.
    pub video_codecs: Vec<&'static str>,
    /// Audio encoders used by those profiles.
    pub audio_codecs: Vec<&'static str>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            profiles: TranscodeProfile::ALL.to_vec(),
            video_codecs: vec!["libx264", "libvpx-vp9"],
            audio_codecs: vec!["aac", "libopus"],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(variants: &[HlsVariant]) -> Vec<&str> {
        variants.iter().map(|v| v.name.as_str()).collect()
    }

    #[test]
    fn test_profile_parsing_rejects_unknown() {
        assert_eq!("hls_720p".parse::<TranscodeProfile>().unwrap(), TranscodeProfile::Hls720p);
        let err = "av1_4k".parse::<TranscodeProfile>().unwrap_err();
        assert!(matches!(err, TranscodeError::UnsupportedProfile(ref p) if p == "av1_4k"));
    }

    #[test]
    fn test_1080p_input_gets_full_ladder() {
        let options = EncodingOptions::defaults(TranscodeProfile::Hls1080p);

        let variants = ladder_for(TranscodeProfile::Hls1080p, Some((1920, 1080)), &options);

        assert_eq!(names(&variants), vec!["1080p", "720p", "480p"]);
        assert_eq!(variants[0].crf, 22);
        assert_eq!(variants[0].bandwidth(), 5_128_000);
    }

    #[test]
    fn test_ladder_never_upscales_but_keeps_lowest() {
        let options = EncodingOptions::defaults(TranscodeProfile::Hls);

        assert_eq!(names(&ladder_for(TranscodeProfile::Hls, Some((1280, 720)), &options)), vec!["720p", "480p"]);
        assert_eq!(names(&ladder_for(TranscodeProfile::Hls, Some((640, 360)), &options)), vec!["480p"]);
        assert_eq!(names(&ladder_for(TranscodeProfile::Hls720p, Some((3840, 2160)), &options)), vec!["720p", "480p"]);
    }

    #[test]
    fn test_overrides_replace_defaults() {
        let overrides = JobOptions {
            crf: Some(18),
            audio_bitrate_kbps: Some(192),
            ..JobOptions::default()
        };

        let options = EncodingOptions::resolve(TranscodeProfile::Hls480p, &overrides);
        let variants = ladder_for(TranscodeProfile::Hls480p, None, &options);

        assert_eq!(options.preset.as_deref(), Some("fast"));
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].crf, 18);
        assert_eq!(variants[0].audio_bitrate_kbps, 192);
    }

    #[test]
    fn test_requested_resolution_bounds_ladder() {
        // Arrange
        let overrides = JobOptions {
            resolution: Some(Resolution {
                width: 1280,
                height: 720,
            }),
            frame_rate: Some(25.0),
            extra_args: vec!["-tune".into(), "film".into()],
            ..JobOptions::default()
        };

        // Act
        let options = EncodingOptions::resolve(TranscodeProfile::Hls1080p, &overrides);
        let variants = ladder_for(TranscodeProfile::Hls1080p, Some((1920, 1080)), &options);

        // Assert
        assert_eq!(names(&variants), vec!["720p", "480p"]);
        assert_eq!(options.frame_rate, Some(25.0));
        assert_eq!(options.extra_args, vec!["-tune", "film"]);
    }

    #[test]
    fn test_options_without_new_fields_deserialize() {
        let mut value = serde_json::to_value(EncodingOptions::defaults(TranscodeProfile::Mp4)).unwrap();
        let object = value.as_object_mut().unwrap();
        object.remove("resolution");
        object.remove("frame_rate");
        object.remove("extra_args");

        let options: EncodingOptions = serde_json::from_value(value).unwrap();

        assert_eq!(options, EncodingOptions::defaults(TranscodeProfile::Mp4));
    }

    #[test]
    fn test_webm_defaults() {
        let options = EncodingOptions::defaults(TranscodeProfile::Webm);

        assert_eq!(options.video_codec, "libvpx-vp9");
        assert_eq!(options.audio_codec, "libopus");
        assert_eq!(options.crf, 30);
        assert!(options.preset.is_none());
    }
}
