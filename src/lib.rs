// src/lib.rs
//! Client for cameras that stream over an encrypted multipart `/stream`
//! endpoint: session handshake and correlation, MPEG-TS demultiplexing,
//! and orchestration of recording downloads and live relays through ffmpeg.

pub mod config;
pub mod constants;
pub mod crypto;
pub mod demux;
pub mod error;
pub mod headers;
pub mod network;
pub mod orchestrator;
pub mod session;
pub mod types;

mod psi;

pub use config::{MuxerConfig, MuxerTarget, RefreshSchedule, SegmentConfig, SessionConfig, StreamJobConfig};
pub use crypto::CryptoEngine;
pub use demux::Demuxer;
pub use error::{AuthFailure, Error, Result};
pub use orchestrator::{CameraSource, MediaSource, Resolution, SegmentDownloader, StreamJob, StreamRequest};
pub use session::{HttpMediaSession, Request, ResponseStream};
pub use types::{Action, DownloadOutcome, JobOutcome, MediaUnit, ProgressEvent, Response};
