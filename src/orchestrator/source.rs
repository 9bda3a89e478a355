//! Where media comes from: request builders and the `MediaSource` seam.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::SessionConfig;
use crate::error::Result;
use crate::session::{HttpMediaSession, Request};
use crate::types::Response;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "HD")]
    Hd,
    #[serde(rename = "VGA")]
    Vga,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Hd => "HD",
            Resolution::Vga => "VGA",
        }
    }
}

/// What to ask the device for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRequest {
    /// Recorded footage between two device-clock epochs
    Playback { start: i64, end: i64 },
    /// Live view
    Preview { resolution: Resolution, audio: bool },
}

impl StreamRequest {
    pub fn to_json(&self, client_id: u64, channels: &[u8]) -> Value {
        match *self {
            StreamRequest::Playback { start, end } => playback_request(client_id, channels, start, end),
            StreamRequest::Preview { resolution, audio } => preview_request(channels, resolution, audio),
        }
    }
}

pub fn playback_request(client_id: u64, channels: &[u8], start: i64, end: i64) -> Value {
    json!({
        "type": "request",
        "params": {
            "playback": {
                "client_id": client_id,
                "channels": channels,
                "scale": "1/1",
                "start_time": start.to_string(),
                "end_time": end.to_string(),
                "event_type": [1, 2],
            },
            "method": "get",
        },
    })
}

pub fn preview_request(channels: &[u8], resolution: Resolution, audio: bool) -> Value {
    let audio: &[&str] = if audio { &["default"] } else { &[] };
    json!({
        "type": "request",
        "params": {
            "preview": {
                "audio": audio,
                "channels": channels,
                "resolutions": [resolution.as_str()],
            },
            "method": "get",
        },
    })
}

/// Opens one exchange that yields media responses until the device goes quiet
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn open(
        &self,
        request: &StreamRequest,
        window_size: u32,
        no_data_timeout: Duration,
    ) -> Result<BoxStream<'static, Result<Response>>>;
}

/// A real camera; every `open` gets its own session so that a retry starts
/// from a clean connection.
#[derive(Debug, Clone)]
pub struct CameraSource {
    config: SessionConfig,
    client_id: u64,
    channels: Vec<u8>,
}

impl CameraSource {
    pub fn new(config: SessionConfig) -> Self {
        Self { config, client_id: 0, channels: vec![0, 1] }
    }

    pub fn with_client_id(mut self, client_id: u64) -> Self {
        self.client_id = client_id;
        self
    }

    pub fn with_channels(mut self, channels: Vec<u8>) -> Self {
        self.channels = channels;
        self
    }
}

#[async_trait]
impl MediaSource for CameraSource {
    async fn open(
        &self,
        request: &StreamRequest,
        window_size: u32,
        no_data_timeout: Duration,
    ) -> Result<BoxStream<'static, Result<Response>>> {
        let mut session = HttpMediaSession::new(self.config.clone());
        session.set_window_size(window_size);
        session.start().await?;
        let body = request.to_json(self.client_id, &self.channels);
        tracing::debug!(window = window_size, ?request, "opening media exchange");
        let responses = session.transceive(Request::json(&body).no_data_timeout(no_data_timeout)).await?;

        // the session lives as long as its responses are being read
        Ok(futures::stream::unfold((session, responses), |(session, mut responses)| async move {
            responses.next().await.map(|item| (item, (session, responses)))
        })
        .boxed())
    }
}
