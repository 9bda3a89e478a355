//! Constants for MPEG-TS demuxing, the camera stream protocol and the muxer

/// MPEG-TS packet constants
pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;

/// Well-known PIDs
pub const PAT_PID: u16 = 0x0000;
pub const NULL_PID: u16 = 0x1FFF;

/// PES packet constants
pub const PES_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];
pub const PES_FIXED_HEADER_LEN: usize = 6;
/// H.264 access unit delimiter behind a 4-byte start code
pub const H264_AUD_PREFIX: [u8; 5] = [0x00, 0x00, 0x00, 0x01, 0x09];

/// Stream types interpreted by the demuxer
pub const STREAM_TYPE_H264: u8 = 0x1B;
pub const STREAM_TYPE_PCM_ALAW: u8 = 0x90;

/// Device protocol
pub const DEFAULT_PORT: u16 = 8800;
pub const STREAM_PATH: &str = "/stream";
pub const DEFAULT_DIGEST_USER: &str = "admin";
pub const ANONYMOUS_USER: &str = "none";
pub const DEFAULT_CLIENT_BOUNDARY: &str = "--client-stream-boundary--";
pub const DEFAULT_DEVICE_BOUNDARY: &str = "--device-stream-boundary--";
pub const DIGEST_NONCE_COUNT: &str = "00000001";

/// MIME types carried by the multipart stream
pub const MIME_JSON: &str = "application/json";
pub const MIME_MPEG_TS: &str = "video/mp2t";

/// Client sequence numbers are drawn from this range
pub const CLIENT_SEQ_MIN: u64 = 1000;
pub const CLIENT_SEQ_MAX: u64 = 0x7FFF;

/// Frames carrying this data sequence belong to an unbounded live stream
/// and are never acknowledged.
pub const LIVE_STREAM_SEQUENCE: u64 = 0;

/// Flow control
pub const DEFAULT_WINDOW_SIZE: u32 = 200;
pub const RETRY_WINDOW_SIZE: u32 = 50;

/// Capacity of each per-exchange response queue
pub const RESPONSE_QUEUE_CAPACITY: usize = 256;

/// Default seconds without data before a transceive stream is considered ended
pub const DEFAULT_NO_DATA_TIMEOUT_SECS: f64 = 1.0;

/// One A-law frame: 8 kHz, 20 ms, 1 byte per sample
pub const ALAW_FRAME_SIZE: usize = 160;
pub const ALAW_SAMPLE_RATE: u32 = 8000;

/// Capacity of the muxer input channels, in messages
pub const MUXER_CHANNEL_CAPACITY: usize = 64;
/// Interval between subprocess liveness checks while a pipe write is pending
pub const MUXER_POLL_INTERVAL_MS: u64 = 250;

/// Segment downloads
pub const DEFAULT_PADDING_SECS: f64 = 5.0;
pub const SHORTER_TOLERANCE_SECS: f64 = 5.0;
pub const RECORDING_GUARD_SECS: i64 = 60;
