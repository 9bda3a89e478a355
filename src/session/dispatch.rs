//! Background loop reading the device's multipart stream.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

use super::correlation::{Correlation, QueueItem};
use super::framing::{self, HeaderMap, Part};
use crate::constants::{LIVE_STREAM_SEQUENCE, MIME_JSON, MIME_MPEG_TS};
use crate::crypto::CryptoEngine;
use crate::demux::Demuxer;
use crate::error::Error;
use crate::types::{MediaUnit, Response};

pub type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

pub(crate) fn lock(correlation: &Mutex<Correlation>) -> MutexGuard<'_, Correlation> {
    correlation.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Accepts numbers and numeric strings; the firmware sends both.
fn value_as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name).and_then(|v| v.trim().parse().ok())
}

pub struct Dispatcher<R> {
    pub reader: R,
    pub boundary: String,
    pub client_boundary: String,
    pub crypto: Arc<CryptoEngine>,
    pub correlation: Arc<Mutex<Correlation>>,
    pub writer: SharedWriter,
    pub window_size: Arc<AtomicU32>,
    pub demuxer: Demuxer,
}

impl<R: AsyncBufRead + Unpin> Dispatcher<R> {
    pub async fn run(mut self) {
        loop {
            let part = match framing::read_part(&mut self.reader, &self.boundary).await {
                Ok(Some(part)) => part,
                Ok(None) => {
                    tracing::info!("device closed the stream");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "stream read failed");
                    break;
                }
            };

            let (sequence, session, item) = self.decode(part);
            let route = lock(&self.correlation).resolve(sequence, session);
            let Some(route) = route else {
                match item {
                    Err(Error::Decryption(reason)) => self.broadcast_undecryptable(&reason).await,
                    _ => tracing::warn!(?sequence, ?session, "no exchange waiting for frame, dropped"),
                }
                continue;
            };
            if route.send(item).await.is_err() {
                tracing::debug!(?sequence, ?session, "exchange went away, frame dropped");
            }

            if let (Some(sequence), Some(session)) = (sequence, session) {
                let window = u64::from(self.window_size.load(Ordering::Relaxed));
                if window > 0 && sequence != LIVE_STREAM_SEQUENCE && sequence % window == 0 {
                    self.acknowledge(session, sequence).await;
                }
            }
        }
        // ends every open response stream once it has drained
        lock(&self.correlation).clear();
    }

    /// A frame that failed to decrypt keeps its routing keys in the body, so
    /// every exchange still waiting for a first reply gets the error.
    async fn broadcast_undecryptable(&self, reason: &str) {
        let waiting = lock(&self.correlation).waiting();
        if waiting.is_empty() {
            tracing::warn!(reason, "undecryptable frame with no exchange waiting, dropped");
            return;
        }
        tracing::warn!(reason, exchanges = waiting.len(), "undecryptable frame without routing keys");
        for route in waiting {
            let _ = route.send(Err(Error::Decryption(reason.to_string()))).await;
        }
    }

    /// Turns a raw part into a response, recovering routing keys from the
    /// JSON body when the headers lack them.
    fn decode(&mut self, part: Part) -> (Option<u64>, Option<u64>, QueueItem) {
        let Part { headers, body } = part;
        let mimetype = headers
            .get("content-type")
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_string())
            .unwrap_or_default();
        let encrypted = headers.get("x-if-encrypt").is_some_and(|v| v.trim() == "1");
        let mut sequence = header_u64(&headers, "x-data-sequence");
        let mut session = header_u64(&headers, "x-session-id");

        let body = Bytes::from(body);
        let (ciphertext, plaintext) = if encrypted {
            match self.crypto.decrypt(&body) {
                Ok(plain) => (Some(body), Bytes::from(plain)),
                Err(e) => return (sequence, session, Err(e)),
            }
        } else {
            (None, body)
        };

        let json = if mimetype == MIME_JSON {
            match serde_json::from_slice::<Value>(&plaintext) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::debug!(error = %e, "JSON frame did not parse");
                    None
                }
            }
        } else {
            None
        };
        if let Some(j) = &json {
            if sequence.is_none() {
                sequence = j.get("seq").and_then(value_as_u64);
            }
            if session.is_none() {
                session = j.get("params").and_then(|p| p.get("session_id")).and_then(value_as_u64);
            }
        }

        let audio_payload = if mimetype == MIME_MPEG_TS {
            let mut audio = BytesMut::new();
            for unit in self.demuxer.feed(&plaintext) {
                if let MediaUnit::Audio(a) = unit {
                    audio.extend_from_slice(&a.payload);
                }
            }
            (!audio.is_empty()).then(|| audio.freeze())
        } else {
            None
        };

        let response = Response {
            sequence,
            session_id: session,
            headers,
            mimetype,
            encrypted,
            ciphertext,
            plaintext,
            json,
            audio_payload,
        };
        if let Some(code) = response.error_code() {
            tracing::warn!(code, ?sequence, ?session, "device replied with an error");
        }
        (sequence, session, Ok(response))
    }

    async fn acknowledge(&self, session: u64, sequence: u64) {
        let body = json!({
            "type": "notification",
            "params": { "event_type": "stream_sequence" }
        })
        .to_string();
        let part = framing::encode_part(
            &self.client_boundary,
            &[
                ("Content-Type", MIME_JSON.to_string()),
                ("Content-Length", body.len().to_string()),
                ("X-Session-Id", session.to_string()),
                ("X-Data-Received", sequence.to_string()),
            ],
            body.as_bytes(),
        );
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(&part).await {
            tracing::warn!(error = %e, session, sequence, "failed to acknowledge");
            return;
        }
        let _ = writer.flush().await;
        tracing::trace!(session, sequence, "acknowledged");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::test_stream::sample_stream;
    use tokio::io::{AsyncReadExt, BufReader, DuplexStream};

    const KX: &str = r#"username="admin" nonce="ABCD""#;
    const DEVICE_BOUNDARY: &str = "--device-stream-boundary--";

    fn part(headers: &[(&str, String)], body: &[u8]) -> Vec<u8> {
        framing::encode_part(DEVICE_BOUNDARY, headers, body)
    }

    fn engine() -> CryptoEngine {
        CryptoEngine::from_key_exchange(KX, "pw", "").unwrap()
    }

    /// Runs the loop over `input` to completion; returns what it wrote back.
    async fn run(input: Vec<u8>, window: u32, correlation: Arc<Mutex<Correlation>>) -> DuplexStream {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        Dispatcher {
            reader: BufReader::new(std::io::Cursor::new(input)),
            boundary: DEVICE_BOUNDARY.into(),
            client_boundary: "--client-stream-boundary--".into(),
            crypto: Arc::new(engine()),
            correlation,
            writer: Arc::new(tokio::sync::Mutex::new(Box::new(ours))),
            window_size: Arc::new(AtomicU32::new(window)),
            demuxer: Demuxer::new(),
        }
        .run()
        .await;
        theirs
    }

    #[tokio::test]
    async fn encrypted_media_carries_demuxed_audio() {
        let ciphertext = engine().encrypt(&sample_stream(320));
        let input = part(
            &[
                ("Content-Type", MIME_MPEG_TS.into()),
                ("Content-Length", ciphertext.len().to_string()),
                ("X-If-Encrypt", "1".into()),
                ("X-Session-Id", "9".into()),
                ("X-Data-Sequence", "1".into()),
            ],
            &ciphertext,
        );
        let correlation = Arc::new(Mutex::new(Correlation::new(16)));
        let mut queue = lock(&correlation).subscribe_session(9);
        run(input, 200, correlation).await;

        let frame = queue.rx.recv().await.unwrap().unwrap();
        assert!(frame.encrypted && frame.is_media());
        assert_eq!(frame.plaintext, Bytes::from(sample_stream(320)));
        assert_eq!(frame.ciphertext.as_deref(), Some(&ciphertext[..]));
        assert_eq!(frame.audio_payload.map(|a| a.len()), Some(320));
    }

    /// Ciphertext that is not a whole number of blocks never decrypts
    const GARBLED: &[u8] = &[0x55; 17];

    #[tokio::test]
    async fn undecryptable_frame_becomes_an_error_item() {
        let input = part(
            &[
                ("Content-Type", MIME_JSON.into()),
                ("Content-Length", GARBLED.len().to_string()),
                ("X-If-Encrypt", "1".into()),
                ("X-Session-Id", "9".into()),
            ],
            GARBLED,
        );
        let correlation = Arc::new(Mutex::new(Correlation::new(16)));
        let mut queue = lock(&correlation).subscribe_session(9);
        run(input, 200, correlation).await;

        assert!(matches!(queue.rx.recv().await, Some(Err(Error::Decryption(_)))));
        assert!(queue.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn undecryptable_frame_without_keys_reaches_waiting_exchanges() {
        let input = part(
            &[
                ("Content-Type", MIME_JSON.into()),
                ("Content-Length", GARBLED.len().to_string()),
                ("X-If-Encrypt", "1".into()),
            ],
            GARBLED,
        );
        let correlation = Arc::new(Mutex::new(Correlation::new(16)));
        let mut first = lock(&correlation).register_sequence(1000).unwrap();
        let mut second = lock(&correlation).register_sequence(1001).unwrap();
        let mut established = lock(&correlation).subscribe_session(3);
        run(input, 200, correlation).await;

        assert!(matches!(first.rx.recv().await, Some(Err(Error::Decryption(_)))));
        assert!(matches!(second.rx.recv().await, Some(Err(Error::Decryption(_)))));
        // established sessions get their frames by header and are left alone
        assert!(established.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn json_keys_route_and_ack_on_window_multiple() {
        let body = br#"{"type":"response","seq":1500,"params":{"session_id":"42","error_code":0}}"#;
        let mut input = part(&[("Content-Type", MIME_JSON.into()), ("Content-Length", body.len().to_string())], body);
        for seq in 1..=4u64 {
            input.extend(part(
                &[
                    ("Content-Type", MIME_MPEG_TS.into()),
                    ("Content-Length", "0".into()),
                    ("X-Session-Id", "42".into()),
                    ("X-Data-Sequence", seq.to_string()),
                ],
                b"",
            ));
        }
        let correlation = Arc::new(Mutex::new(Correlation::new(16)));
        let mut queue = lock(&correlation).register_sequence(1500).unwrap();
        let mut written = run(input, 2, correlation).await;

        let reply = queue.rx.recv().await.unwrap().unwrap();
        assert_eq!(reply.sequence, Some(1500));
        assert_eq!(reply.session_id, Some(42));
        assert!(reply.is_json());
        for seq in 1..=4u64 {
            assert_eq!(queue.rx.recv().await.unwrap().unwrap().sequence, Some(seq));
        }

        let mut acks = String::new();
        written.read_to_string(&mut acks).await.unwrap();
        assert_eq!(acks.matches("X-Data-Received").count(), 2);
        assert!(acks.contains("X-Data-Received: 2\r\n"));
        assert!(acks.contains("X-Data-Received: 4\r\n"));
        assert!(acks.contains("X-Session-Id: 42\r\n"));
        assert!(acks.contains(r#""event_type":"stream_sequence""#));
    }

    #[tokio::test]
    async fn live_sentinel_is_never_acknowledged() {
        let input = part(
            &[
                ("Content-Type", MIME_MPEG_TS.into()),
                ("Content-Length", "0".into()),
                ("X-Session-Id", "5".into()),
                ("X-Data-Sequence", LIVE_STREAM_SEQUENCE.to_string()),
            ],
            b"",
        );
        let correlation = Arc::new(Mutex::new(Correlation::new(16)));
        let _queue = lock(&correlation).subscribe_session(5);
        let mut written = run(input, 1, correlation).await;
        let mut acks = Vec::new();
        written.read_to_end(&mut acks).await.unwrap();
        assert!(acks.is_empty());
    }

    #[tokio::test]
    async fn unmatched_frames_are_dropped() {
        let body = br#"{"seq":4242}"#;
        let mut input = part(&[("Content-Type", MIME_JSON.into()), ("Content-Length", body.len().to_string())], body);
        let body = br#"{"seq":1000}"#;
        input.extend(part(&[("Content-Type", MIME_JSON.into()), ("Content-Length", body.len().to_string())], body));

        let correlation = Arc::new(Mutex::new(Correlation::new(16)));
        let mut queue = lock(&correlation).register_sequence(1000).unwrap();
        run(input, 200, correlation.clone()).await;

        assert_eq!(queue.rx.recv().await.unwrap().unwrap().sequence, Some(1000));
        // the loop forgets every exchange once the device hangs up
        assert_eq!(lock(&correlation).pending(), 0);
    }
}
