use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use serde::Serialize;

use crate::constants::{MIME_JSON, MIME_MPEG_TS, STREAM_TYPE_H264, STREAM_TYPE_PCM_ALAW};

/// Elementary stream type declared in the PMT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    H264,
    PcmAlaw,
    /// Tracked but never decoded
    Other(u8),
}

impl From<u8> for StreamType {
    fn from(v: u8) -> Self {
        match v {
            STREAM_TYPE_H264 => StreamType::H264,
            STREAM_TYPE_PCM_ALAW => StreamType::PcmAlaw,
            other => StreamType::Other(other),
        }
    }
}

/// One H.264 access unit with length-prefixed NAL units
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoUnit {
    pub pid: u16,
    /// 90 kHz presentation timestamp, when the PES header carried one
    pub pts: Option<u64>,
    pub payload: Bytes,
}

/// A run of A-law samples with synthesized timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioUnit {
    pub pid: u16,
    pub sequence: u64,
    /// Running byte count, i.e. samples at 8 kHz mono
    pub timestamp: u64,
    pub payload: Bytes,
}

/// Output of the demultiplexer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaUnit {
    Video(VideoUnit),
    Audio(AudioUnit),
}

/// One decoded multipart frame from the device
#[derive(Debug, Clone)]
pub struct Response {
    pub sequence: Option<u64>,
    pub session_id: Option<u64>,
    /// Header names are lower-cased
    pub headers: HashMap<String, String>,
    pub mimetype: String,
    pub encrypted: bool,
    /// Raw body as received, when it was encrypted
    pub ciphertext: Option<Bytes>,
    pub plaintext: Bytes,
    pub json: Option<serde_json::Value>,
    /// A-law samples demuxed from a transport stream body
    pub audio_payload: Option<Bytes>,
}

impl Response {
    /// A transport-stream chunk as a media source would deliver it
    pub fn media(plaintext: impl Into<Bytes>, audio_payload: Option<Bytes>) -> Self {
        Self {
            sequence: None,
            session_id: None,
            headers: HashMap::new(),
            mimetype: MIME_MPEG_TS.to_string(),
            encrypted: false,
            ciphertext: None,
            plaintext: plaintext.into(),
            json: None,
            audio_payload,
        }
    }

    pub fn is_media(&self) -> bool {
        self.mimetype == MIME_MPEG_TS
    }

    pub fn is_json(&self) -> bool {
        self.mimetype == MIME_JSON
    }

    /// `error_code` of a JSON reply, if non-zero
    pub fn error_code(&self) -> Option<i64> {
        self.json
            .as_ref()
            .and_then(|j| j.get("params").and_then(|p| p.get("error_code")).or_else(|| j.get("error_code")))
            .and_then(serde_json::Value::as_i64)
            .filter(|code| *code != 0)
    }
}

/// Steps reported by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Action {
    Idle,
    Skipping,
    RecordingInProgress,
    Downloading,
    Retrying,
    Converting,
    Streaming,
    Finished,
    FinishedShorter,
    Stopped,
    GivingUp,
    Failed,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Idle => "Idle",
            Action::Skipping => "Skipping, file exists",
            Action::RecordingInProgress => "Recording in progress",
            Action::Downloading => "Downloading",
            Action::Retrying => "Retrying",
            Action::Converting => "Converting",
            Action::Streaming => "Streaming",
            Action::Finished => "Finished download",
            Action::FinishedShorter => "Finished download (shorter)",
            Action::Stopped => "Stopped",
            Action::GivingUp => "Giving up",
            Action::Failed => "Failed",
        }
    }

    /// No further events follow
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Action::Skipping
                | Action::RecordingInProgress
                | Action::Finished
                | Action::FinishedShorter
                | Action::Stopped
                | Action::GivingUp
                | Action::Failed
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress report emitted by download and stream jobs
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<PathBuf>,
    /// Seconds captured so far
    pub progress: f64,
    /// Seconds expected, 0 when unbounded
    pub total: f64,
}

/// How a segment download ended successfully
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    Complete { path: PathBuf, duration: f64 },
    /// The retry fell short of the nominal length but within tolerance
    Shorter { path: PathBuf, duration: f64 },
    /// Output already existed
    Skipped { path: PathBuf },
}

impl DownloadOutcome {
    pub fn path(&self) -> &PathBuf {
        match self {
            DownloadOutcome::Complete { path, .. }
            | DownloadOutcome::Shorter { path, .. }
            | DownloadOutcome::Skipped { path } => path,
        }
    }
}

/// How a stream job ended
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JobOutcome {
    /// The requested duration was reached and the muxer finalized
    DurationReached { seconds: f64 },
    /// The device stopped sending and the muxer finalized
    StreamEnded { seconds: f64 },
}
