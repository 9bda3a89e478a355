//! Configuration for sessions, segment downloads and stream jobs.
//!
//! Every struct deserializes with `#[serde(default)]`, so a JSON file only
//! needs the fields it wants to change.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;

/// Connection and identity settings for one media session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    /// Digest-auth user name
    pub username: String,
    /// Cloud password in clear; only its upper-hex MD5 is put on the wire
    pub cloud_password: String,
    /// Secret used for the key derivation when the device reports an anonymous peer
    pub super_secret_key: String,
    pub window_size: u32,
    pub client_boundary: String,
    pub connect_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            username: DEFAULT_DIGEST_USER.to_string(),
            cloud_password: String::new(),
            super_secret_key: String::new(),
            window_size: DEFAULT_WINDOW_SIZE,
            client_boundary: DEFAULT_CLIENT_BOUNDARY.to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Chunk-count thresholds that decide when the duration probe runs.
///
/// The probe runs after every chunk until `dense_until`, then every
/// `medium_every` chunks until `medium_until`, then every `sparse_every`
/// chunks until `sparse_until`, and beyond that after half as many chunks
/// again as were seen at the previous probe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSchedule {
    pub dense_until: u64,
    pub medium_every: u64,
    pub medium_until: u64,
    pub sparse_every: u64,
    pub sparse_until: u64,
}

impl Default for RefreshSchedule {
    fn default() -> Self {
        Self {
            dense_until: 100,
            medium_every: 250,
            medium_until: 1_000,
            sparse_every: 5_000,
            sparse_until: 10_000,
        }
    }
}

impl RefreshSchedule {
    /// Number of chunks to wait after a probe taken at `chunks`
    pub fn interval(&self, chunks: u64) -> u64 {
        let step = if chunks < self.dense_until {
            1
        } else if chunks < self.medium_until {
            self.medium_every
        } else if chunks < self.sparse_until {
            self.sparse_every
        } else {
            chunks / 2
        };
        step.max(1)
    }
}

/// External executables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxerConfig {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

/// Settings for a bounded recording download
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    pub output_dir: PathBuf,
    /// Extra seconds captured beyond the nominal segment length before finalizing
    pub padding_secs: f64,
    pub no_data_timeout_secs: f64,
    pub window_size: u32,
    pub retry_window_size: u32,
    /// A retry this close to the nominal length is accepted as a shorter download
    pub shorter_tolerance_secs: f64,
    /// Segments ending less than this long before the device clock are rejected
    pub recording_guard_secs: i64,
    /// Device clock minus local clock, in seconds
    pub time_correction: i64,
    pub overwrite: bool,
    pub audio: bool,
    pub refresh: RefreshSchedule,
    pub muxer: MuxerConfig,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            padding_secs: DEFAULT_PADDING_SECS,
            no_data_timeout_secs: 5.0,
            window_size: DEFAULT_WINDOW_SIZE,
            retry_window_size: RETRY_WINDOW_SIZE,
            shorter_tolerance_secs: SHORTER_TOLERANCE_SECS,
            recording_guard_secs: RECORDING_GUARD_SECS,
            time_correction: 0,
            overwrite: false,
            audio: true,
            refresh: RefreshSchedule::default(),
            muxer: MuxerConfig::default(),
        }
    }
}

impl SegmentConfig {
    pub fn no_data_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.no_data_timeout_secs)
    }
}

/// Where a stream job sends the muxer output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MuxerTarget {
    /// Write a file; the container is picked from its extension
    File(PathBuf),
    /// Emit MPEG-TS on the muxer's stdout
    Stdout,
}

/// Settings for a pipe-fed stream job (live relay or pipe download)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamJobConfig {
    pub target: MuxerTarget,
    pub audio: bool,
    /// Stop cleanly once the muxer reports this much output; `None` runs until stopped
    pub duration_secs: Option<f64>,
    pub no_data_timeout_secs: f64,
    pub window_size: u32,
    pub muxer: MuxerConfig,
}

impl Default for StreamJobConfig {
    fn default() -> Self {
        Self {
            target: MuxerTarget::Stdout,
            audio: true,
            duration_secs: None,
            no_data_timeout_secs: 10.0,
            window_size: DEFAULT_WINDOW_SIZE,
            muxer: MuxerConfig::default(),
        }
    }
}

impl StreamJobConfig {
    pub fn no_data_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.no_data_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_schedule_grows() {
        let s = RefreshSchedule::default();
        assert_eq!(s.interval(0), 1);
        assert_eq!(s.interval(99), 1);
        assert_eq!(s.interval(100), 250);
        assert_eq!(s.interval(999), 250);
        assert_eq!(s.interval(1_000), 5_000);
        assert_eq!(s.interval(20_000), 10_000);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: SegmentConfig = serde_json::from_str(r#"{"padding_secs": 2.5}"#).unwrap();
        assert_eq!(cfg.padding_secs, 2.5);
        assert_eq!(cfg.retry_window_size, RETRY_WINDOW_SIZE);

        let session: SessionConfig = serde_json::from_str(r#"{"host": "10.0.0.2"}"#).unwrap();
        assert_eq!(session.port, DEFAULT_PORT);
        assert_eq!(session.username, "admin");
    }
}
