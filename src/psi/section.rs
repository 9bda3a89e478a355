// psi/section.rs
//! Long-form PSI sections (PAT, PMT) with CRC-32/MPEG-2 checking.

use crc::{CRC_32_MPEG_2, Crc};

pub(crate) const CRC_MPEG: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Fixed part of the long section syntax: table_id_extension, version,
/// section numbers.
const LONG_HEADER_LEN: usize = 5;
const CRC_LEN: usize = 4;

/// 13-bit PID from two bytes with three reserved high bits
pub(crate) fn pid_from(hi: u8, lo: u8) -> u16 {
    u16::from_be_bytes([hi & 0x1F, lo])
}

/// 12-bit length field (section_length, info/descriptor lengths)
pub(crate) fn length_from(hi: u8, lo: u8) -> usize {
    usize::from(u16::from_be_bytes([hi & 0x0F, lo]))
}

/// A section located in a unit-start payload, body borrowed from it.
pub struct SectionReader<'a> {
    pub table_id:     u8,
    pub version:      u8,
    pub table_id_ext: u16,
    pub crc_valid:    bool,
    /// Bytes between the long header and the CRC
    pub body:         &'a [u8],
}

impl<'a> SectionReader<'a> {
    /// Follows the pointer field and checks the declared length. The CRC is
    /// only recorded; a mismatch is for the caller to judge.
    pub fn new(payload: &'a [u8]) -> anyhow::Result<Self> {
        let Some((&pointer, rest)) = payload.split_first() else {
            anyhow::bail!("empty section payload");
        };
        let Some(section) = rest.get(usize::from(pointer)..) else {
            anyhow::bail!("pointer field {pointer} runs past the payload");
        };
        let Some(&[table_id, len_hi, len_lo]) = section.first_chunk::<3>() else {
            anyhow::bail!("short section");
        };

        let sec_len = length_from(len_hi, len_lo);
        if sec_len < LONG_HEADER_LEN + CRC_LEN { anyhow::bail!("invalid section_length {sec_len}") }
        let Some(section) = section.get(..3 + sec_len) else {
            anyhow::bail!("truncated section ({} of {} bytes)", section.len(), 3 + sec_len);
        };

        let (covered, crc) = section.split_at(section.len() - CRC_LEN);
        let crc_valid = CRC_MPEG.checksum(covered) == u32::from_be_bytes(crc.try_into()?);

        Ok(Self {
            table_id,
            version:      (covered[5] >> 1) & 0x1F,
            table_id_ext: u16::from_be_bytes([covered[3], covered[4]]),
            crc_valid,
            body:         &covered[3 + LONG_HEADER_LEN..],
        })
    }
}

/// Builds a complete section (pointer field, header, body, CRC) for tests.
#[cfg(test)]
pub(crate) fn build_section(table_id: u8, table_id_ext: u16, body: &[u8]) -> Vec<u8> {
    let sec_len = LONG_HEADER_LEN + body.len() + CRC_LEN;
    let mut s = vec![
        0x00, // pointer_field
        table_id,
        0xB0 | ((sec_len >> 8) as u8 & 0x0F),
        sec_len as u8,
    ];
    s.extend_from_slice(&table_id_ext.to_be_bytes());
    s.extend_from_slice(&[0xC1, 0x00, 0x00]); // version 0, current, section 0/0
    s.extend_from_slice(body);
    let crc = CRC_MPEG.checksum(&s[1..]);
    s.extend_from_slice(&crc.to_be_bytes());
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_header_fields() {
        let mut sec = build_section(0x02, 0x1234, &[9, 9]);
        sec[6] = 0xC1 | (7 << 1); // version 7
        let r = SectionReader::new(&sec).unwrap();
        assert_eq!((r.table_id, r.table_id_ext, r.version), (0x02, 0x1234, 7));
        assert_eq!(r.body, &[9, 9]);
        // header changed after the CRC was computed
        assert!(!r.crc_valid);
    }

    #[test]
    fn honours_pointer_field() {
        let mut sec = build_section(0x00, 1, &[0, 1, 0xF0, 0]);
        sec.splice(0..1, [2, 0xFF, 0xFF]);
        let r = SectionReader::new(&sec).unwrap();
        assert!(r.crc_valid);
        assert_eq!(r.table_id, 0x00);
    }

    #[test]
    fn rejects_truncation() {
        let sec = build_section(0x00, 1, &[0, 1, 0xF0, 0]);
        assert!(SectionReader::new(&sec[..sec.len() - 1]).is_err());
        assert!(SectionReader::new(&[]).is_err());
        assert!(SectionReader::new(&[5, 0]).is_err());
    }
}
