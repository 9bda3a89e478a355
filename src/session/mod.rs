//! Authenticated, encrypted multipart session over a single TCP connection.
//!
//! The client opens `POST /stream` once, answers the digest challenge and
//! then keeps both directions of the connection open: requests go out as
//! parts of the client's multipart body, replies and media arrive as parts
//! of the device's. A background task reads the device side and routes each
//! frame to the exchange it belongs to.

pub mod auth;
mod correlation;
mod dispatch;
pub mod framing;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use rand::Rng;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::constants::{CLIENT_SEQ_MAX, CLIENT_SEQ_MIN, DEFAULT_DEVICE_BOUNDARY, MIME_JSON, RESPONSE_QUEUE_CAPACITY};
use crate::crypto::{CryptoEngine, hash_cloud_password};
use crate::demux::Demuxer;
use crate::error::{AuthFailure, Error, Result};
use crate::headers::multipart_boundary;
use crate::network::connect_tcp;
use crate::types::Response;

use auth::DigestChallenge;
use correlation::{Correlation, Subscription};
use dispatch::{Dispatcher, SharedWriter, lock};

/// One outgoing message
#[derive(Debug, Clone)]
pub struct Request {
    pub body: Vec<u8>,
    pub mimetype: String,
    /// Continue an established exchange instead of starting one
    pub session_id: Option<u64>,
    pub encrypt: bool,
    /// The response stream ends after this long without a frame
    pub no_data_timeout: Duration,
}

impl Request {
    pub fn json(value: &Value) -> Self {
        Self {
            body: value.to_string().into_bytes(),
            mimetype: MIME_JSON.to_string(),
            session_id: None,
            encrypt: true,
            no_data_timeout: Duration::from_secs_f64(crate::constants::DEFAULT_NO_DATA_TIMEOUT_SECS),
        }
    }

    pub fn with_session(mut self, session_id: u64) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn plain(mut self) -> Self {
        self.encrypt = false;
        self
    }

    pub fn no_data_timeout(mut self, timeout: Duration) -> Self {
        self.no_data_timeout = timeout;
        self
    }
}

/// Frames belonging to one exchange, in arrival order.
///
/// Ends when no frame arrives within the request's no-data timeout, when
/// the connection goes away, or right after an error item. Dropping it
/// unregisters the exchange.
pub struct ResponseStream {
    subscription: Subscription,
    correlation: Arc<Mutex<Correlation>>,
    no_data_timeout: Duration,
    finished: bool,
}

impl ResponseStream {
    pub async fn next(&mut self) -> Option<Result<Response>> {
        if self.finished {
            return None;
        }
        match tokio::time::timeout(self.no_data_timeout, self.subscription.rx.recv()).await {
            Ok(Some(Ok(response))) => Some(Ok(response)),
            Ok(Some(Err(e))) => {
                self.finished = true;
                Some(Err(e))
            }
            Ok(None) => {
                tracing::debug!("connection gone, ending response stream");
                self.finished = true;
                None
            }
            Err(_) => {
                tracing::debug!(timeout = ?self.no_data_timeout, "no data, ending response stream");
                self.finished = true;
                None
            }
        }
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<Response>> {
        futures::stream::unfold(self, |mut s| async move { s.next().await.map(|item| (item, s)) }).boxed()
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        lock(&self.correlation).release(self.subscription.id);
    }
}

struct Connection {
    writer: SharedWriter,
    crypto: Arc<CryptoEngine>,
    dispatch: JoinHandle<()>,
}

pub struct HttpMediaSession {
    config: SessionConfig,
    hashed_password: String,
    window_size: Arc<AtomicU32>,
    correlation: Arc<Mutex<Correlation>>,
    conn: Option<Connection>,
}

impl HttpMediaSession {
    pub fn new(config: SessionConfig) -> Self {
        let hashed_password = hash_cloud_password(&config.cloud_password);
        let window_size = Arc::new(AtomicU32::new(config.window_size));
        Self {
            config,
            hashed_password,
            window_size,
            correlation: Arc::new(Mutex::new(Correlation::new(RESPONSE_QUEUE_CAPACITY))),
            conn: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| !c.dispatch.is_finished())
    }

    pub fn window_size(&self) -> u32 {
        self.window_size.load(Ordering::Relaxed)
    }

    /// Takes effect for the next request and the next acknowledgement.
    pub fn set_window_size(&self, window_size: u32) {
        self.window_size.store(window_size, Ordering::Relaxed);
    }

    /// Connects, authenticates and starts the frame dispatcher. A no-op when
    /// already started.
    pub async fn start(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let stream = connect_tcp(&self.config.host, self.config.port, self.config.connect_timeout()).await?;
        let (read, write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut writer = write;

        let (crypto, boundary) = match self.handshake(&mut reader, &mut writer).await {
            Ok(v) => v,
            Err(e) => {
                let _ = writer.shutdown().await;
                return Err(e);
            }
        };
        tracing::info!(host = %self.config.host, port = self.config.port, "session established");

        let crypto = Arc::new(crypto);
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(Box::new(writer)));
        let dispatcher = Dispatcher {
            reader,
            boundary,
            client_boundary: self.config.client_boundary.clone(),
            crypto: crypto.clone(),
            correlation: self.correlation.clone(),
            writer: writer.clone(),
            window_size: self.window_size.clone(),
            demuxer: Demuxer::new(),
        };
        let dispatch = tokio::spawn(dispatcher.run());
        self.conn = Some(Connection { writer, crypto, dispatch });
        Ok(())
    }

    /// Digest handshake; yields the session cipher and the device's boundary.
    async fn handshake<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<(CryptoEngine, String)>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let content_type = format!("multipart/mixed;boundary={}", self.config.client_boundary);
        let mut headers = vec![
            ("Content-Type", content_type),
            ("Connection", "keep-alive".to_string()),
            ("Content-Length", "-1".to_string()),
        ];

        send(writer, &framing::request_head(&headers)).await?;
        let head = framing::read_http_head(reader).await.map_err(as_connection)?;
        if head.status != 401 {
            return Err(Error::UnexpectedStatus(head.status));
        }
        framing::skip_body(reader, head.content_length().unwrap_or(0)).await.map_err(as_connection)?;
        let challenge = head
            .headers
            .get("www-authenticate")
            .ok_or(AuthFailure::ChallengeMissing)
            .map_err(Error::from)
            .and_then(|h| DigestChallenge::parse(h))?;

        let authorization =
            challenge.authorization(&self.config.username, &self.hashed_password, &auth::generate_cnonce());
        headers.push(("Authorization", authorization));
        send(writer, &framing::request_head(&headers)).await?;

        let head = framing::read_http_head(reader).await.map_err(as_connection)?;
        match head.status {
            200 => {}
            401 => return Err(AuthFailure::BadCredentials.into()),
            other => return Err(Error::UnexpectedStatus(other)),
        }
        let key_exchange = head.headers.get("key-exchange").ok_or(AuthFailure::KeyExchangeMissing)?;
        let crypto =
            CryptoEngine::from_key_exchange(key_exchange, &self.config.cloud_password, &self.config.super_secret_key)?;
        let boundary = head
            .headers
            .get("content-type")
            .and_then(|ct| multipart_boundary(ct))
            .unwrap_or_else(|| DEFAULT_DEVICE_BOUNDARY.to_string());
        tracing::debug!(%boundary, "device boundary");
        Ok((crypto, boundary))
    }

    /// Sends one request and returns the stream of frames answering it.
    pub async fn transceive(&self, request: Request) -> Result<ResponseStream> {
        let conn = self.conn.as_ref().ok_or(Error::NotStarted)?;

        let (subscription, body, fresh) = match request.session_id {
            Some(session) => (lock(&self.correlation).subscribe_session(session), request.body, false),
            None => {
                if request.mimetype != MIME_JSON {
                    return Err(Error::Protocol("a new exchange must start with a JSON request".into()));
                }
                let mut value: Value = serde_json::from_slice(&request.body)?;
                let object = value
                    .as_object_mut()
                    .ok_or_else(|| Error::Protocol("request body is not a JSON object".into()))?;
                let (sequence, subscription) = {
                    let mut correlation = lock(&self.correlation);
                    let mut rng = rand::thread_rng();
                    loop {
                        let sequence = rng.gen_range(CLIENT_SEQ_MIN..=CLIENT_SEQ_MAX);
                        if let Some(subscription) = correlation.register_sequence(sequence) {
                            break (sequence, subscription);
                        }
                    }
                };
                object.insert("seq".into(), sequence.into());
                tracing::debug!(sequence, "new exchange");
                (subscription, serde_json::to_vec(&value)?, true)
            }
        };
        // built first so that a failed write still unregisters the exchange
        let stream = ResponseStream {
            subscription,
            correlation: self.correlation.clone(),
            no_data_timeout: request.no_data_timeout,
            finished: false,
        };

        let payload = if request.encrypt { conn.crypto.encrypt(&body) } else { body };
        let mut headers = vec![
            ("Content-Type", request.mimetype.clone()),
            ("Content-Length", payload.len().to_string()),
        ];
        if request.encrypt {
            headers.push(("X-If-Encrypt", "1".to_string()));
        }
        if let Some(session) = request.session_id {
            headers.push(("X-Session-Id", session.to_string()));
        }
        if fresh {
            headers.push(("X-Data-Window-Size", self.window_size().to_string()));
        }
        let part = framing::encode_part(&self.config.client_boundary, &headers, &payload);

        let mut writer = conn.writer.lock().await;
        send(&mut *writer, &part).await?;
        Ok(stream)
    }

    /// Stops the dispatcher and closes the connection. Safe to call twice.
    pub async fn close(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        conn.dispatch.abort();
        let _ = conn.dispatch.await;
        let _ = conn.writer.lock().await.shutdown().await;
        lock(&self.correlation).clear();
        tracing::debug!("session closed");
    }
}

impl Drop for HttpMediaSession {
    fn drop(&mut self) {
        if let Some(conn) = &self.conn {
            conn.dispatch.abort();
            lock(&self.correlation).clear();
        }
    }
}

async fn send<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_all(bytes).await.map_err(Error::Connection)?;
    writer.flush().await.map_err(Error::Connection)
}

fn as_connection(e: Error) -> Error {
    match e {
        Error::Io(io) => Error::Connection(io),
        other => other,
    }
}
