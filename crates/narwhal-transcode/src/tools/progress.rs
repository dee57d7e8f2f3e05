//! Parsing of `ffmpeg -progress` key/value output.
//!
//! `ffmpeg` writes blocks of `key=value` lines, each terminated by a
//! `progress=continue` or `progress=end` line. A sample is emitted per
//! block.

use crate::domain::aggregates::JobProgress;

/// Accumulates progress lines for one run.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    total_seconds: f64,
    current_seconds: Option<f64>,
    speed: Option<f64>,
    fps: Option<f64>,
    bitrate_kbps: Option<f64>,
    last_percent: f64,
    finished: bool,
}

impl ProgressParser {
    /// A parser for an input of `total_seconds`.
    #[must_use]
    pub fn new(total_seconds: f64) -> Self {
        Self {
            total_seconds,
            current_seconds: None,
            speed: None,
            fps: None,
            bitrate_kbps: None,
            last_percent: 0.0,
            finished: false,
        }
    }

    /// Whether `progress=end` has been seen.
    #[must_use]
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Feeds one line; returns a sample when the line closes a block.
    pub fn feed(&mut self, line: &str) -> Option<JobProgress> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();
        match key.trim() {
            "out_time" | "time" => {
                if let Some(seconds) = parse_timestamp(value) {
                    self.current_seconds = Some(seconds);
                }
            }
            // Both keys carry microseconds.
            "out_time_us" | "out_time_ms" => {
                if let Ok(micros) = value.parse::<i64>() {
                    self.current_seconds = Some(micros.max(0) as f64 / 1_000_000.0);
                }
            }
            "speed" => self.speed = parse_speed(value),
            "fps" => self.fps = value.parse::<f64>().ok().filter(|fps| fps.is_finite()),
            "bitrate" => self.bitrate_kbps = parse_bitrate(value),
            "progress" => {
                self.finished = value == "end";
                return self.sample();
            }
            _ => {}
        }
        None
    }

    fn sample(&mut self) -> Option<JobProgress> {
        let current = self.current_seconds?;
        let percent = if self.total_seconds > 0.0 {
            (current / self.total_seconds * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        self.last_percent = self.last_percent.max(percent);
        let eta_seconds = self
            .speed
            .filter(|speed| *speed > 0.0)
            .map(|speed| ((self.total_seconds - current).max(0.0)) / speed);
        Some(JobProgress {
            percent: self.last_percent,
            current_seconds: current,
            total_seconds: self.total_seconds,
            speed: self.speed,
            eta_seconds,
            fps: self.fps,
            bitrate_kbps: self.bitrate_kbps,
        })
    }
}

/// Parses `HH:MM:SS.fraction`.
#[must_use]
pub fn parse_timestamp(value: &str) -> Option<f64> {
    if value.starts_with('-') {
        return None;
    }
    let mut parts = value.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || hours < 0.0 || minutes < 0.0 || seconds < 0.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Parses `1.25x`; `N/A` yields `None`.
#[must_use]
pub fn parse_speed(value: &str) -> Option<f64> {
    value
        .trim()
        .trim_end_matches('x')
        .parse::<f64>()
        .ok()
        .filter(|speed| speed.is_finite())
}

/// Parses `4000.0kbits/s`; `N/A` yields `None`.
#[must_use]
pub fn parse_bitrate(value: &str) -> Option<f64> {
    value
        .trim()
        .trim_end_matches("kbits/s")
        .parse::<f64>()
        .ok()
        .filter(|bitrate| bitrate.is_finite() && *bitrate >= 0.0)
}
