//! PES header fields needed to strip the header and recover the PTS.

use bitstream_io::{BigEndian, BitRead, BitReader};

use crate::constants::{PES_FIXED_HEADER_LEN, PES_START_CODE};
use crate::demux::DemuxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PesHeader {
    pub stream_id: u8,
    /// PES_packet_length; 0 means unbounded
    pub packet_length: u16,
    /// Bytes before the elementary stream data
    pub header_len: usize,
    pub pts: Option<u64>,
}

/// Stream ids whose PES packets carry no optional header
fn has_optional_header(stream_id: u8) -> bool {
    !matches!(stream_id, 0xBC | 0xBE | 0xBF | 0xF0 | 0xF1 | 0xF2 | 0xF8 | 0xFF)
}

impl PesHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, DemuxError> {
        if buf.len() < PES_FIXED_HEADER_LEN || !buf.starts_with(&PES_START_CODE) {
            return Err(DemuxError::PesHeader("missing start code"));
        }
        let mut br = BitReader::endian(buf, BigEndian);
        br.skip(24)?; // start code
        let stream_id = br.read::<8, u8>()?;
        let packet_length = br.read::<16, u16>()?;

        if !has_optional_header(stream_id) {
            return Ok(Self { stream_id, packet_length, header_len: PES_FIXED_HEADER_LEN, pts: None });
        }

        if br.read::<2, u8>()? != 0b10 {
            return Err(DemuxError::PesHeader("bad optional header marker"));
        }
        br.skip(6)?; // scrambling, priority, alignment, copyright, original
        let pts_dts_flags = br.read::<2, u8>()?;
        br.skip(6)?; // ESCR, ES rate, trick mode, copy info, CRC, extension
        let header_data_len = br.read::<8, u8>()? as usize;

        let header_len = PES_FIXED_HEADER_LEN + 3 + header_data_len;
        if buf.len() < header_len {
            return Err(DemuxError::PesHeader("header longer than packet"));
        }

        let pts = if pts_dts_flags & 0b10 != 0 {
            if header_data_len < 5 {
                return Err(DemuxError::PesHeader("PTS flag set without PTS bytes"));
            }
            Some(read_timestamp(&mut br)?)
        } else {
            None
        };

        Ok(Self { stream_id, packet_length, header_len, pts })
    }
}

/// 33-bit timestamp spread over 5 bytes with marker bits
fn read_timestamp<R: std::io::Read>(br: &mut BitReader<R, BigEndian>) -> std::io::Result<u64> {
    br.skip(4)?;
    let hi = br.read::<3, u64>()?;
    br.skip(1)?;
    let mid = br.read::<15, u64>()?;
    br.skip(1)?;
    let lo = br.read::<15, u64>()?;
    br.skip(1)?;
    Ok((hi << 30) | (mid << 15) | lo)
}

/// Encodes a PTS the way a muxer writes it (prefix `0010`)
#[cfg(test)]
pub(crate) fn encode_pts(pts: u64) -> [u8; 5] {
    [
        0x21 | (((pts >> 30) & 0x07) as u8) << 1,
        (pts >> 22) as u8,
        0x01 | (((pts >> 15) & 0x7F) as u8) << 1,
        (pts >> 7) as u8,
        0x01 | ((pts & 0x7F) as u8) << 1,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_header_with_pts() {
        let pts = (1u64 << 32) + 123_456_789;
        let mut buf = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x80, 0x05];
        buf.extend(encode_pts(pts));
        buf.extend([0x00, 0x00, 0x00, 0x01, 0x09, 0xF0]);
        let h = PesHeader::parse(&buf).unwrap();
        assert_eq!(h.stream_id, 0xE0);
        assert_eq!(h.header_len, 14);
        assert_eq!(h.pts, Some(pts));
    }

    #[test]
    fn header_without_pts() {
        let buf = [0x00, 0x00, 0x01, 0xC0, 0x00, 0x05, 0x80, 0x00, 0x00, 0xD5, 0xD5];
        let h = PesHeader::parse(&buf).unwrap();
        assert_eq!(h.packet_length, 5);
        assert_eq!(h.header_len, 9);
        assert_eq!(h.pts, None);
    }

    #[test]
    fn padding_stream_has_no_optional_header() {
        let buf = [0x00, 0x00, 0x01, 0xBE, 0x00, 0x02, 0xFF, 0xFF];
        assert_eq!(PesHeader::parse(&buf).unwrap().header_len, 6);
    }

    #[test]
    fn truncated_header() {
        let buf = [0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x80, 0x05, 0x21];
        assert!(PesHeader::parse(&buf).is_err());
    }
}
