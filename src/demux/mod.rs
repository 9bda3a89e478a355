//! Transport stream demultiplexer.
//!
//! Fed one network chunk at a time. The PAT and PMT are parsed once; PES
//! units are reassembled per PID across cells and across chunks, and every
//! completed H.264 or A-law unit is returned to the caller. Malformed input
//! is logged and dropped, never returned as an error.

mod cursor;
pub mod nal;
mod pes;

use std::collections::HashMap;
use std::mem;

use bytes::{Bytes, BytesMut};

use crate::constants::*;
use crate::psi::{parse_pat, parse_pmt};
use crate::types::{AudioUnit, MediaUnit, StreamType, VideoUnit};
use cursor::{TsCell, TsCursor};
use pes::PesHeader;

pub use nal::annexb_to_length_prefixed;

/// Upper bound for an unknown-length PES unit
const MAX_STREAMING_PES: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub(crate) enum DemuxError {
    #[error("PID {pid:#06x}: adaptation field length {len} exceeds the cell")]
    AdaptationLength { pid: u16, len: usize },
    #[error("PID {pid:#06x}: PES does not start with 00 00 01")]
    MissingStartCode { pid: u16 },
    #[error("PID {pid:#06x}: zero PES length not recognized for stream type {stream_type:?}")]
    UnknownZeroLength { pid: u16, stream_type: StreamType },
    #[error("PID {pid:#06x}: PES overflow, {got} bytes for a declared {declared}")]
    Overflow { pid: u16, declared: usize, got: usize },
    #[error("bad PES header: {0}")]
    PesHeader(&'static str),
    #[error("truncated PES header: {0}")]
    Truncated(#[from] std::io::Error),
    #[error("PSI: {0}")]
    Psi(String),
}

/// Reassembly state of one PID
#[derive(Debug, Default)]
enum PesState {
    #[default]
    Empty,
    /// `declared` counts the whole PES packet, fixed header included
    Accumulating { declared: usize, buf: BytesMut },
    /// Declared length 0; the unit ends where the next one starts
    Streaming { buf: BytesMut },
}

#[derive(Debug)]
struct PesStream {
    pid: u16,
    stream_type: StreamType,
    state: PesState,
    audio_sequence: u64,
    audio_timestamp: u64,
}

impl PesStream {
    fn new(pid: u16, stream_type: StreamType) -> Self {
        Self { pid, stream_type, state: PesState::Empty, audio_sequence: 0, audio_timestamp: 0 }
    }

    fn push(&mut self, cell: TsCell<'_>, out: &mut Vec<MediaUnit>) -> Result<(), DemuxError> {
        let payload = cell.payload;
        if payload.is_empty() {
            return Ok(());
        }
        let starts_unit = cell.payload_unit_start && payload.starts_with(&PES_START_CODE);

        match mem::take(&mut self.state) {
            // tail of a unit that was dropped or began before the first chunk
            PesState::Empty if !cell.payload_unit_start => {
                tracing::trace!(pid = self.pid, bytes = payload.len(), "no unit in progress, skipping cell");
                Ok(())
            }
            PesState::Empty => self.begin(payload, out),
            PesState::Accumulating { declared, buf } if starts_unit => {
                tracing::warn!(pid = self.pid, have = buf.len(), declared, "PES unit cut short by the next one");
                self.begin(payload, out)
            }
            PesState::Accumulating { declared, mut buf } => {
                buf.extend_from_slice(payload);
                self.settle(declared, buf, out)
            }
            PesState::Streaming { buf } if starts_unit => {
                self.finish(buf.freeze(), out)?;
                self.begin(payload, out)
            }
            PesState::Streaming { mut buf } => {
                buf.extend_from_slice(payload);
                if buf.len() > MAX_STREAMING_PES {
                    return Err(DemuxError::Overflow { pid: self.pid, declared: MAX_STREAMING_PES, got: buf.len() });
                }
                self.state = PesState::Streaming { buf };
                Ok(())
            }
        }
    }

    fn begin(&mut self, payload: &[u8], out: &mut Vec<MediaUnit>) -> Result<(), DemuxError> {
        if !payload.starts_with(&PES_START_CODE) {
            return Err(DemuxError::MissingStartCode { pid: self.pid });
        }
        let header = PesHeader::parse(payload)?;

        if header.packet_length == 0 {
            let es = &payload[header.header_len..];
            if self.stream_type == StreamType::H264 && es.starts_with(&H264_AUD_PREFIX) {
                self.state = PesState::Streaming { buf: BytesMut::from(payload) };
                return Ok(());
            }
            return Err(DemuxError::UnknownZeroLength { pid: self.pid, stream_type: self.stream_type });
        }

        let declared = header.packet_length as usize + PES_FIXED_HEADER_LEN;
        self.settle(declared, BytesMut::from(payload), out)
    }

    fn settle(&mut self, declared: usize, buf: BytesMut, out: &mut Vec<MediaUnit>) -> Result<(), DemuxError> {
        if buf.len() > declared {
            return Err(DemuxError::Overflow { pid: self.pid, declared, got: buf.len() });
        }
        if buf.len() == declared {
            return self.finish(buf.freeze(), out);
        }
        self.state = PesState::Accumulating { declared, buf };
        Ok(())
    }

    fn finish(&mut self, pes: Bytes, out: &mut Vec<MediaUnit>) -> Result<(), DemuxError> {
        let header = PesHeader::parse(&pes)?;
        let es = pes.slice(header.header_len..);

        match self.stream_type {
            StreamType::H264 => {
                out.push(MediaUnit::Video(VideoUnit {
                    pid: self.pid,
                    pts: header.pts,
                    payload: annexb_to_length_prefixed(&es),
                }));
            }
            StreamType::PcmAlaw => {
                // the source carries no audio timestamps
                self.audio_sequence += 1;
                self.audio_timestamp += es.len() as u64;
                out.push(MediaUnit::Audio(AudioUnit {
                    pid: self.pid,
                    sequence: self.audio_sequence,
                    timestamp: self.audio_timestamp,
                    payload: es,
                }));
            }
            StreamType::Other(t) => {
                tracing::trace!(pid = self.pid, stream_type = t, bytes = es.len(), "discarding unit of unhandled type");
            }
        }
        Ok(())
    }
}

/// Per-instance demuxer state; nothing is shared between instances.
#[derive(Debug, Default)]
pub struct Demuxer {
    pmt_pid: Option<u16>,
    pmt_parsed: bool,
    streams: HashMap<u16, PesStream>,
}

impl Demuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// PMT PID announced by the PAT, once seen
    pub fn pmt_pid(&self) -> Option<u16> {
        self.pmt_pid
    }

    /// Stream type declared for `pid` by the PMT
    pub fn stream_type(&self, pid: u16) -> Option<StreamType> {
        self.streams.get(&pid).map(|s| s.stream_type)
    }

    /// Demuxes one chunk and returns the units it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<MediaUnit> {
        let mut out = Vec::new();
        for cell in TsCursor::new(chunk) {
            let result = cell.and_then(|cell| self.on_cell(cell, &mut out));
            if let Err(e) = result {
                tracing::warn!(error = %e, "dropping malformed transport stream data");
            }
        }
        out
    }

    /// Emits any unknown-length units still being collected.
    pub fn flush(&mut self) -> Vec<MediaUnit> {
        let mut out = Vec::new();
        for stream in self.streams.values_mut() {
            if !matches!(stream.state, PesState::Streaming { .. }) {
                continue;
            }
            if let PesState::Streaming { buf } = mem::take(&mut stream.state) {
                if let Err(e) = stream.finish(buf.freeze(), &mut out) {
                    tracing::warn!(error = %e, "dropping unfinished unit");
                }
            }
        }
        out
    }

    fn on_cell(&mut self, cell: TsCell<'_>, out: &mut Vec<MediaUnit>) -> Result<(), DemuxError> {
        if cell.pid == NULL_PID {
            return Ok(());
        }

        if cell.pid == PAT_PID {
            if self.pmt_pid.is_none() && cell.payload_unit_start {
                let pat = parse_pat(cell.payload).map_err(|e| DemuxError::Psi(e.to_string()))?;
                if !pat.crc_valid {
                    tracing::warn!("PAT CRC mismatch, using it anyway");
                }
                if let Some(pid) = pat.first_pmt_pid() {
                    tracing::debug!(pmt_pid = pid, "PAT parsed");
                    self.pmt_pid = Some(pid);
                }
            }
            return Ok(());
        }

        if Some(cell.pid) == self.pmt_pid {
            if !self.pmt_parsed && cell.payload_unit_start {
                let pmt = parse_pmt(cell.payload).map_err(|e| DemuxError::Psi(e.to_string()))?;
                if !pmt.crc_valid {
                    tracing::warn!("PMT CRC mismatch, using it anyway");
                }
                for s in &pmt.streams {
                    tracing::debug!(pid = s.elementary_pid, stream_type = ?s.stream_type, "PMT stream");
                    self.streams.insert(s.elementary_pid, PesStream::new(s.elementary_pid, s.stream_type));
                }
                self.pmt_parsed = true;
            }
            return Ok(());
        }

        match self.streams.get_mut(&cell.pid) {
            Some(stream) => stream.push(cell, out),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_stream {
    //! Builders for synthetic transport streams.

    use crate::constants::*;
    use crate::psi::section::build_section;

    pub const PMT_PID: u16 = 0x1000;
    pub const VIDEO_PID: u16 = 0x0100;
    pub const AUDIO_PID: u16 = 0x0101;

    /// Splits `payload` into cells, padding the last one with an adaptation field.
    pub fn packetize(pid: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut first = true;
        let mut rest = payload;
        loop {
            let mut cell = vec![TS_SYNC_BYTE, (pid >> 8) as u8 & 0x1F, pid as u8, 0x10];
            if first {
                cell[1] |= 0x40;
            }
            let room = TS_PACKET_SIZE - 4;
            if rest.len() >= room {
                cell.extend_from_slice(&rest[..room]);
                rest = &rest[room..];
            } else {
                // stuffing through the adaptation field
                let stuffing = room - rest.len();
                cell[3] = 0x30;
                cell.push((stuffing - 1) as u8);
                if stuffing > 1 {
                    cell.push(0x00);
                    cell.extend(std::iter::repeat_n(0xFF, stuffing - 2));
                }
                cell.extend_from_slice(rest);
                rest = &[];
            }
            out.extend(cell);
            first = false;
            if rest.is_empty() {
                return out;
            }
        }
    }

    pub fn pat() -> Vec<u8> {
        let body = [0x00, 0x01, 0xE0 | (PMT_PID >> 8) as u8, PMT_PID as u8];
        packetize(PAT_PID, &build_section(0x00, 1, &body))
    }

    pub fn pmt() -> Vec<u8> {
        let body = [
            0xE0 | (VIDEO_PID >> 8) as u8, VIDEO_PID as u8, 0xF0, 0x00,
            STREAM_TYPE_H264, 0xE0 | (VIDEO_PID >> 8) as u8, VIDEO_PID as u8, 0xF0, 0x00,
            STREAM_TYPE_PCM_ALAW, 0xE0 | (AUDIO_PID >> 8) as u8, AUDIO_PID as u8, 0xF0, 0x00,
        ];
        packetize(PMT_PID, &build_section(0x02, 1, &body))
    }

    /// A complete PES packet with a declared length (0 when `bounded` is false)
    pub fn pes(stream_id: u8, pts: Option<u64>, es: &[u8], bounded: bool) -> Vec<u8> {
        let mut opt = vec![0x80, 0x00, 0x00];
        if let Some(pts) = pts {
            opt[1] = 0x80;
            opt[2] = 5;
            opt.extend(super::pes::encode_pts(pts));
        }
        let len = if bounded { (opt.len() + es.len()) as u16 } else { 0 };
        let mut p = vec![0x00, 0x00, 0x01, stream_id];
        p.extend(len.to_be_bytes());
        p.extend(opt);
        p.extend_from_slice(es);
        p
    }

    pub const H264_ES: &[u8] = &[
        0x00, 0x00, 0x00, 0x01, 0x09, 0xF0, //
        0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0xC0, 0x1E, //
        0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x21,
    ];

    pub const H264_LENGTH_PREFIXED: &[u8] = &[
        0, 0, 0, 2, 0x09, 0xF0, //
        0, 0, 0, 4, 0x67, 0x42, 0xC0, 0x1E, //
        0, 0, 0, 4, 0x65, 0x88, 0x84, 0x21,
    ];

    pub fn alaw_es(len: usize) -> Vec<u8> {
        (0..len).map(|i| 0xD5 ^ i as u8).collect()
    }

    /// PAT, PMT, one bounded H.264 unit and one A-law unit
    pub fn sample_stream(alaw_len: usize) -> Vec<u8> {
        let mut ts = pat();
        ts.extend(pmt());
        ts.extend(packetize(VIDEO_PID, &pes(0xE0, Some(90_000), H264_ES, true)));
        ts.extend(packetize(AUDIO_PID, &pes(0xC0, None, &alaw_es(alaw_len), true)));
        ts
    }
}
