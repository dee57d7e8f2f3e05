//! Fake `ffmpeg` / `ffprobe` executables for exercising process supervision.
//!
//! The scripts are POSIX shell. The fake `ffmpeg` creates the outputs named
//! by its trailing argument (one `variant_<i>/playlist.m3u8` per
//! `-var_stream_map` entry for HLS), writes `-progress pipe:1` style
//! key/value blocks to stdout, and exits with the configured code.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Behaviour of a fake `ffmpeg`.
#[derive(Debug, Clone)]
pub struct FakeFfmpeg {
    /// Exit status.
    pub exit_code: i32,
    /// Text written to stderr before exiting.
    pub stderr: String,
    /// Reported `out_time` values, one progress block each, in seconds.
    pub progress_seconds: Vec<f64>,
    /// Reported speed multiplier.
    pub speed: f64,
    /// Pause between progress blocks, in tenths of a second.
    pub pause_tenths: u32,
}

impl Default for FakeFfmpeg {
    fn default() -> Self {
        Self {
            exit_code: 0,
            stderr: String::new(),
            progress_seconds: vec![15.0, 30.0, 45.0, 60.0],
            speed: 2.0,
            pause_tenths: 1,
        }
    }
}

impl FakeFfmpeg {
    /// A run that fails with exit code 1 after reporting some progress.
    #[must_use]
    pub fn failing(stderr: &str) -> Self {
        Self {
            exit_code: 1,
            stderr: stderr.to_owned(),
            progress_seconds: vec![10.0],
            ..Self::default()
        }
    }

    /// A run that keeps reporting progress for about `seconds` before finishing.
    #[must_use]
    pub fn slow(seconds: u32) -> Self {
        Self {
            progress_seconds: (1..=seconds * 10).map(|tick| f64::from(tick) / 10.0).collect(),
            pause_tenths: 1,
            ..Self::default()
        }
    }
}

/// Stream layout reported by a fake `ffprobe`.
#[derive(Debug, Clone)]
pub struct FakeProbe {
    /// Video width.
    pub width: u32,
    /// Video height.
    pub height: u32,
    /// Duration in seconds.
    pub duration: f64,
    /// Whether an audio stream is present.
    pub audio: bool,
    /// Exit with status 1 and no output.
    pub fail: bool,
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            duration: 60.0,
            audio: true,
            fail: false,
        }
    }
}

fn write_executable(path: &Path, body: &str) -> io::Result<()> {
    fs::write(path, body)?;
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(path, permissions)
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Writes a fake `ffmpeg` into `dir` and returns its path.
///
/// # Errors
///
/// Returns the I/O error if the script cannot be written.
pub fn write_fake_ffmpeg(dir: &Path, behaviour: &FakeFfmpeg) -> io::Result<PathBuf> {
    let mut script = String::from(
        r#"#!/bin/sh
if [ "$1" = "-version" ]; then echo "ffmpeg version fake"; exit 0; fi
out=""
map=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "-var_stream_map" ]; then map="$arg"; fi
  prev="$arg"
  out="$arg"
done
if [ -n "$map" ]; then
  i=0
  for entry in $map; do
    playlist=$(echo "$out" | sed "s/%v/$i/")
    dir=$(dirname "$playlist")
    mkdir -p "$dir"
    printf '#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXTINF:6.0,\nsegment_000.ts\n#EXT-X-ENDLIST\n' > "$playlist"
    printf 'segment' > "$dir/segment_000.ts"
    i=$((i+1))
  done
else
  mkdir -p "$(dirname "$out")"
  printf 'media' > "$out"
fi
"#,
    );
    for seconds in &behaviour.progress_seconds {
        let whole = seconds.trunc();
        let hours = (whole / 3600.0).floor();
        let minutes = ((whole - hours * 3600.0) / 60.0).floor();
        let secs = seconds - hours * 3600.0 - minutes * 60.0;
        let _ = writeln!(
            script,
            "printf 'frame=240\\nfps=48.0\\nbitrate=4000.0kbits/s\\nout_time={hours:02.0}:{minutes:02.0}:{secs:09.6}\\nspeed={speed}x\\nprogress=continue\\n'",
            speed = behaviour.speed,
        );
        if behaviour.pause_tenths > 0 {
            let _ = writeln!(script, "sleep 0.{}", behaviour.pause_tenths.min(9));
        }
    }
    if behaviour.exit_code == 0 {
        script.push_str("printf 'progress=end\\n'\n");
    }
    if !behaviour.stderr.is_empty() {
        let _ = writeln!(script, "printf '%s\\n' {} >&2", shell_quote(&behaviour.stderr));
    }
    let _ = writeln!(script, "exit {}", behaviour.exit_code);

    let path = dir.join("ffmpeg");
    write_executable(&path, &script)?;
    Ok(path)
}

/// Writes a fake `ffprobe` into `dir` and returns its path.
///
/// # Errors
///
/// Returns the I/O error if the script cannot be written.
pub fn write_fake_ffprobe(dir: &Path, probe: &FakeProbe) -> io::Result<PathBuf> {
    let body = if probe.fail {
        "#!/bin/sh\necho 'Invalid data found when processing input' >&2\nexit 1\n".to_owned()
    } else {
        let mut streams = vec![serde_json::json!({
            "index": 0,
            "codec_type": "video",
            "codec_name": "h264",
            "width": probe.width,
            "height": probe.height,
            "r_frame_rate": "24000/1001",
            "avg_frame_rate": "24000/1001"
        })];
        if probe.audio {
            streams.push(serde_json::json!({
                "index": 1,
                "codec_type": "audio",
                "codec_name": "aac",
                "channels": 2,
                "sample_rate": "48000"
            }));
        }
        let document = serde_json::json!({
            "streams": streams,
            "format": {
                "duration": format!("{:.6}", probe.duration),
                "bit_rate": "8000000",
                "format_name": "matroska,webm"
            }
        });
        format!(
            "#!/bin/sh\nif [ \"$1\" = \"-version\" ]; then echo \"ffprobe version fake\"; exit 0; fi\ncat <<'JSON'\n{document}\nJSON\n"
        )
    };
    let path = dir.join("ffprobe");
    write_executable(&path, &body)?;
    Ok(path)
}
