//! Walks the 188-byte cells of one network chunk.

use crate::constants::{TS_PACKET_SIZE, TS_SYNC_BYTE};
use crate::demux::DemuxError;

/// Header fields the demuxer needs plus the cell payload
#[derive(Debug, Clone, Copy)]
pub(crate) struct TsCell<'a> {
    pub pid: u16,
    pub payload_unit_start: bool,
    pub payload: &'a [u8],
}

impl<'a> TsCell<'a> {
    pub fn parse(cell: &'a [u8]) -> Result<Self, DemuxError> {
        let pid = (((cell[1] & 0x1F) as u16) << 8) | (cell[2] as u16);
        let payload_unit_start = cell[1] & 0x40 != 0;
        let adaptation_field_ctrl = (cell[3] & 0x30) >> 4;

        let mut payload_offset = 4usize;
        if adaptation_field_ctrl & 0x02 != 0 {
            let adap_len = cell[4] as usize;
            payload_offset += 1 + adap_len;
            if payload_offset > TS_PACKET_SIZE {
                return Err(DemuxError::AdaptationLength { pid, len: adap_len });
            }
        }
        // 0b10 carries an adaptation field only, 0b00 is reserved
        let payload = if adaptation_field_ctrl & 0x01 != 0 {
            &cell[payload_offset..]
        } else {
            &[]
        };
        Ok(Self { pid, payload_unit_start, payload })
    }
}

/// Read position and segment end within a single chunk.
///
/// Nothing here outlives the chunk: reassembly state lives in the demuxer.
pub(crate) struct TsCursor<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> TsCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, end: data.len() }
    }

    /// First offset at or after `from` holding a sync byte that is either the
    /// last whole cell or followed by another sync byte one cell later.
    fn resync(&self, from: usize) -> Option<usize> {
        (from..=self.end.checked_sub(TS_PACKET_SIZE)?).find(|&p| {
            self.data[p] == TS_SYNC_BYTE
                && (p + TS_PACKET_SIZE == self.end || self.data[p + TS_PACKET_SIZE] == TS_SYNC_BYTE)
        })
    }
}

impl<'a> Iterator for TsCursor<'a> {
    type Item = Result<TsCell<'a>, DemuxError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos + TS_PACKET_SIZE > self.end {
            if self.pos < self.end {
                tracing::trace!(bytes = self.end - self.pos, "discarding partial cell at chunk end");
                self.pos = self.end;
            }
            return None;
        }
        if self.data[self.pos] != TS_SYNC_BYTE {
            match self.resync(self.pos) {
                Some(p) => {
                    tracing::debug!(skipped = p - self.pos, "resynchronized to sync byte");
                    self.pos = p;
                }
                None => {
                    tracing::debug!(bytes = self.end - self.pos, "no sync byte found, discarding rest of chunk");
                    self.pos = self.end;
                    return None;
                }
            }
        }
        let cell = &self.data[self.pos..self.pos + TS_PACKET_SIZE];
        self.pos += TS_PACKET_SIZE;
        Some(TsCell::parse(cell))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(pid: u16, fill: u8) -> Vec<u8> {
        let mut c = vec![fill; TS_PACKET_SIZE];
        c[0] = TS_SYNC_BYTE;
        c[1] = 0x40 | (pid >> 8) as u8;
        c[2] = pid as u8;
        c[3] = 0x10;
        c
    }

    #[test]
    fn skips_leading_garbage() {
        let mut data = vec![0x00, 0x47, 0x12, 0x99];
        data.extend(cell(0x100, 0xAA));
        data.extend(cell(0x101, 0xBB));
        let pids: Vec<u16> = TsCursor::new(&data).map(|c| c.unwrap().pid).collect();
        assert_eq!(pids, vec![0x100, 0x101]);
    }

    #[test]
    fn drops_chunk_without_sync() {
        let data = vec![0x11; 400];
        assert_eq!(TsCursor::new(&data).count(), 0);
    }

    #[test]
    fn adaptation_field_is_skipped() {
        let mut c = cell(0x100, 0xCC);
        c[3] = 0x30;
        c[4] = 10;
        let parsed = TsCell::parse(&c).unwrap();
        assert_eq!(parsed.payload.len(), TS_PACKET_SIZE - 4 - 1 - 10);
    }

    #[test]
    fn oversized_adaptation_field_is_an_error() {
        let mut c = cell(0x100, 0xCC);
        c[3] = 0x30;
        c[4] = 200;
        assert!(matches!(TsCell::parse(&c), Err(DemuxError::AdaptationLength { .. })));
    }
}
