//! Error taxonomy shared by the session and the orchestrator

use std::io;

/// Why the handshake with the device was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    /// The device rejected the digest response; almost always a wrong cloud password.
    #[error("device rejected the credentials (check the cloud password)")]
    BadCredentials,
    /// The probe was not answered with a digest challenge.
    #[error("device did not send a digest challenge")]
    ChallengeMissing,
    /// The authenticated reply carried no `Key-Exchange` header.
    #[error("device reply is missing the Key-Exchange header")]
    KeyExchangeMissing,
    /// The Key-Exchange header carried no nonce.
    #[error("Key-Exchange header has no nonce")]
    NonceMissing,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection to device failed: {0}")]
    Connection(#[source] io::Error),

    #[error("timed out connecting to device")]
    ConnectTimeout,

    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthFailure),

    #[error("device answered with HTTP status {0}")]
    UnexpectedStatus(u16),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("failed to decrypt response ({0}); the cloud password is probably wrong")]
    Decryption(String),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("media session is not started")]
    NotStarted,

    #[error("recording is still in progress")]
    RecordingInProgress,

    #[error("captured {captured:.1}s of an expected {expected:.1}s")]
    IncompleteCapture { captured: f64, expected: f64 },

    #[error("muxer failed: {0}")]
    Muxer(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
