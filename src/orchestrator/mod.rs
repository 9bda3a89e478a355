//! Drives sessions to fetch recordings or relay live video into a muxer.

pub mod estimate;
pub mod framing;
pub mod muxer;
pub mod relay;
pub mod segment;
pub mod source;

use std::path::PathBuf;

use tokio::sync::mpsc::UnboundedSender;

use crate::types::{Action, ProgressEvent};

pub use estimate::{DurationEstimator, DurationProbe, FfprobeProbe};
pub use framing::{AudioFramer, TsAligner};
pub use muxer::{FfmpegSegmentMuxer, MuxerProcess, SegmentMuxer};
pub use relay::StreamJob;
pub use segment::SegmentDownloader;
pub use source::{CameraSource, MediaSource, Resolution, StreamRequest};

/// Sends progress events for one job, if anyone listens.
#[derive(Debug, Clone, Default)]
pub(crate) struct Reporter {
    tx: Option<UnboundedSender<ProgressEvent>>,
    file_name: Option<PathBuf>,
    total: f64,
}

impl Reporter {
    pub fn new(tx: Option<UnboundedSender<ProgressEvent>>, file_name: Option<PathBuf>, total: f64) -> Self {
        Self { tx, file_name, total }
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn report(&self, action: Action, progress: f64) {
        if action.is_terminal() {
            tracing::info!(%action, progress, total = self.total, file = ?self.file_name, "job update");
        } else {
            tracing::trace!(%action, progress, total = self.total, "job progress");
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(ProgressEvent { action, file_name: self.file_name.clone(), progress, total: self.total });
        }
    }
}
