//! Captured-duration estimation.
//!
//! Probing the accumulated file is exact but spawns a process, so probes
//! are spaced out by a [`RefreshSchedule`] and the duration in between is
//! extrapolated from the byte count at the last probe.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::RefreshSchedule;
use crate::error::{Error, Result};

#[async_trait]
pub trait DurationProbe: Send + Sync {
    /// Seconds of media in `path`; `None` if it cannot be determined yet.
    async fn duration(&self, path: &Path) -> Result<Option<f64>>;
}

/// Asks `ffprobe` for the container duration
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    ffprobe: PathBuf,
}

impl FfprobeProbe {
    pub fn new(ffprobe: impl Into<PathBuf>) -> Self {
        Self { ffprobe: ffprobe.into() }
    }
}

#[async_trait]
impl DurationProbe for FfprobeProbe {
    async fn duration(&self, path: &Path) -> Result<Option<f64>> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-show_entries", "format=duration", "-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Muxer(format!("failed to run {}: {e}", self.ffprobe.display())))?;
        if !output.status.success() {
            tracing::debug!(status = %output.status, path = %path.display(), "ffprobe could not read file yet");
            return Ok(None);
        }
        Ok(parse_probe_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn parse_probe_output(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .filter_map(|l| l.trim().parse::<f64>().ok())
        .find(|d| d.is_finite() && *d >= 0.0)
}

#[derive(Debug)]
pub struct DurationEstimator {
    schedule: RefreshSchedule,
    chunks: u64,
    next_probe: u64,
    probed_bytes: u64,
    probed_duration: f64,
}

impl DurationEstimator {
    pub fn new(schedule: RefreshSchedule) -> Self {
        Self { schedule, chunks: 0, next_probe: 1, probed_bytes: 0, probed_duration: 0.0 }
    }

    /// Counts a chunk; `true` when a probe is due.
    pub fn record_chunk(&mut self) -> bool {
        self.chunks += 1;
        self.chunks >= self.next_probe
    }

    /// Stores a probe result taken over `bytes` bytes.
    pub fn update(&mut self, bytes: u64, duration: f64) {
        self.probed_bytes = bytes;
        self.probed_duration = duration;
        self.reschedule();
    }

    /// A probe failed; try again after the usual interval.
    pub fn reschedule(&mut self) {
        self.next_probe = self.chunks + self.schedule.interval(self.chunks);
    }

    pub fn estimate(&self, bytes: u64) -> f64 {
        if self.probed_bytes == 0 {
            return self.probed_duration;
        }
        self.probed_duration * bytes as f64 / self.probed_bytes as f64
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }
}
