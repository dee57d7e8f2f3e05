//! `ffmpeg` command lines for each profile.

use std::path::{Path, PathBuf};

use crate::domain::aggregates::MediaProbe;
use crate::domain::profile::{EncodingOptions, HlsVariant, TranscodeProfile, ladder_for};

/// Name of the master playlist written next to the variant directories.
pub const MASTER_PLAYLIST: &str = "master.m3u8";

/// A resolved `ffmpeg` invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct FfmpegPlan {
    /// Arguments after the executable. The output target is always last.
    pub args: Vec<String>,
    /// Directory the outputs are written under.
    pub output_dir: PathBuf,
    /// Playable artefact: master playlist or output file.
    pub playable: PathBuf,
    /// HLS renditions, empty for single-file outputs.
    pub variants: Vec<HlsVariant>,
}

impl FfmpegPlan {
    /// Builds the invocation for `profile` over a probed input.
    #[must_use]
    pub fn build(
        input: &Path,
        output: &Path,
        profile: TranscodeProfile,
        options: &EncodingOptions,
        probe: &MediaProbe,
    ) -> Self {
        let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-y", "-i"].map(str::to_owned).to_vec();
        args.push(path_arg(input));
        args.extend(["-progress", "pipe:1", "-nostats"].map(str::to_owned));

        if profile.is_hls() {
            let variants = ladder_for(profile, Some((probe.width, probe.height)), options);
            hls_args(&mut args, output, options, &variants, probe.has_audio());
            Self {
                args,
                output_dir: output.to_path_buf(),
                playable: output.join(MASTER_PLAYLIST),
                variants,
            }
        } else {
            let file = single_file_target(output, profile);
            single_file_args(&mut args, profile, options, probe.has_audio());
            args.extend(options.extra_args.iter().cloned());
            args.push(path_arg(&file));
            Self {
                args,
                output_dir: file.parent().map_or_else(|| output.to_path_buf(), Path::to_path_buf),
                playable: file,
                variants: Vec::new(),
            }
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// `output` itself when it already names a file of the profile's type,
/// otherwise `output/output.<ext>`.
fn single_file_target(output: &Path, profile: TranscodeProfile) -> PathBuf {
    let extension = profile.extension().unwrap_or("mp4");
    if output
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
    {
        output.to_path_buf()
    } else {
        output.join(format!("output.{extension}"))
    }
}

fn hls_args(args: &mut Vec<String>, output: &Path, options: &EncodingOptions, variants: &[HlsVariant], audio: bool) {
    for _ in variants {
        args.extend(["-map", "0:v:0"].map(str::to_owned));
        if audio {
            args.extend(["-map", "0:a:0"].map(str::to_owned));
        }
    }
    args.extend(["-c:v".to_owned(), options.video_codec.clone()]);
    if let Some(preset) = &options.preset {
        args.extend(["-preset".to_owned(), preset.clone()]);
    }
    // A keyframe at every segment boundary whatever the input frame rate.
    args.extend([
        "-force_key_frames".to_owned(),
        format!("expr:gte(t,n_forced*{})", options.segment_seconds),
        "-sc_threshold".to_owned(),
        "0".to_owned(),
    ]);
    push_frame_rate(args, options);
    for (i, variant) in variants.iter().enumerate() {
        args.extend([
            format!("-filter:v:{i}"),
            format!("scale=w={}:h={}:force_original_aspect_ratio=decrease:force_divisible_by=2", variant.width, variant.height),
            format!("-b:v:{i}"),
            format!("{}k", variant.video_bitrate_kbps),
            format!("-maxrate:v:{i}"),
            format!("{}k", variant.video_bitrate_kbps),
            format!("-bufsize:v:{i}"),
            format!("{}k", variant.buffer_size_kbps),
            format!("-crf:v:{i}"),
            variant.crf.to_string(),
        ]);
        if audio {
            args.extend([format!("-b:a:{i}"), format!("{}k", variant.audio_bitrate_kbps)]);
        }
    }
    if audio {
        args.extend([
            "-c:a".to_owned(),
            options.audio_codec.clone(),
            "-ac".to_owned(),
            options.audio_channels.to_string(),
        ]);
    }

    let stream_map = (0..variants.len())
        .map(|i| if audio { format!("v:{i},a:{i}") } else { format!("v:{i}") })
        .collect::<Vec<_>>()
        .join(" ");
    args.extend([
        "-f".to_owned(),
        "hls".to_owned(),
        "-hls_time".to_owned(),
        options.segment_seconds.to_string(),
        "-hls_playlist_type".to_owned(),
        options.playlist_type.clone(),
        "-hls_segment_filename".to_owned(),
        path_arg(&output.join("variant_%v").join("segment_%03d.ts")),
        "-var_stream_map".to_owned(),
        stream_map,
    ]);
    args.extend(options.extra_args.iter().cloned());
    args.push(path_arg(&output.join("variant_%v").join("playlist.m3u8")));
}

fn push_frame_rate(args: &mut Vec<String>, options: &EncodingOptions) {
    if let Some(rate) = options.frame_rate {
        args.extend(["-r".to_owned(), rate.to_string()]);
    }
}

fn single_file_args(args: &mut Vec<String>, profile: TranscodeProfile, options: &EncodingOptions, audio: bool) {
    args.extend(["-map", "0:v:0"].map(str::to_owned));
    if audio {
        args.extend(["-map", "0:a:0"].map(str::to_owned));
    }
    args.extend(["-c:v".to_owned(), options.video_codec.clone()]);
    if let Some(preset) = &options.preset {
        args.extend(["-preset".to_owned(), preset.clone()]);
    }
    args.extend(["-crf".to_owned(), options.crf.to_string()]);
    if let Some(size) = options.resolution {
        args.extend([
            "-vf".to_owned(),
            format!(
                "scale=w={}:h={}:force_original_aspect_ratio=decrease:force_divisible_by=2",
                size.width, size.height
            ),
        ]);
    }
    push_frame_rate(args, options);
    match options.video_bitrate_kbps {
        Some(bitrate) => {
            args.extend(["-maxrate".to_owned(), format!("{bitrate}k")]);
            let buffer = options.buffer_size_kbps.unwrap_or(bitrate * 2);
            args.extend(["-bufsize".to_owned(), format!("{buffer}k")]);
        }
        // Constant quality for VP9 requires a zero target bitrate.
        None if profile == TranscodeProfile::Webm => args.extend(["-b:v", "0"].map(str::to_owned)),
        None => {}
    }
    if audio {
        args.extend([
            "-c:a".to_owned(),
            options.audio_codec.clone(),
            "-b:a".to_owned(),
            format!("{}k", options.audio_bitrate_kbps),
            "-ac".to_owned(),
            options.audio_channels.to_string(),
        ]);
    }
    if profile == TranscodeProfile::Mp4 {
        args.extend(["-movflags", "+faststart"].map(str::to_owned));
    }
}
