//! Shaping demuxed bytes for the muxer's inputs.

use bytes::{Buf, Bytes, BytesMut};

use crate::constants::{TS_PACKET_SIZE, TS_SYNC_BYTE};

/// Re-cuts transport chunks into whole 188-byte cells that start with a sync
/// byte. Bytes before a sync byte are dropped; a trailing partial cell waits
/// for the next chunk.
#[derive(Debug, Default)]
pub struct TsAligner {
    carry: BytesMut,
    dropped: u64,
}

impl TsAligner {
    pub fn push(&mut self, chunk: &[u8]) -> Bytes {
        self.carry.extend_from_slice(chunk);
        let mut out = BytesMut::with_capacity(self.carry.len());
        loop {
            match self.carry.iter().position(|&b| b == TS_SYNC_BYTE) {
                Some(0) => {}
                Some(skip) => {
                    self.dropped += skip as u64;
                    self.carry.advance(skip);
                }
                None => {
                    self.dropped += self.carry.len() as u64;
                    self.carry.clear();
                    break;
                }
            }
            if self.carry.len() < TS_PACKET_SIZE {
                break;
            }
            out.extend_from_slice(&self.carry.split_to(TS_PACKET_SIZE));
        }
        out.freeze()
    }

    /// Bytes discarded while hunting for a sync byte
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Regroups audio into fixed-size frames; a partial frame is held back.
#[derive(Debug)]
pub struct AudioFramer {
    frame_size: usize,
    pending: BytesMut,
}

impl AudioFramer {
    pub fn new(frame_size: usize) -> Self {
        Self { frame_size: frame_size.max(1), pending: BytesMut::new() }
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(data);
        let mut frames = Vec::with_capacity(self.pending.len() / self.frame_size);
        while self.pending.len() >= self.frame_size {
            frames.push(self.pending.split_to(self.frame_size).freeze());
        }
        frames
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ALAW_FRAME_SIZE;

    fn cell(tag: u8) -> Vec<u8> {
        let mut c = vec![tag; TS_PACKET_SIZE];
        c[0] = TS_SYNC_BYTE;
        c
    }

    #[test]
    fn leading_garbage_is_dropped() {
        let mut a = TsAligner::default();
        let mut chunk = vec![1, 2, 3];
        chunk.extend(cell(9));
        let out = a.push(&chunk);
        assert_eq!(&out[..], &cell(9)[..]);
        assert_eq!(a.dropped(), 3);
    }

    #[test]
    fn cells_split_across_chunks_are_rejoined() {
        let mut a = TsAligner::default();
        let mut stream = cell(1);
        stream.extend(cell(2));
        let (x, y) = stream.split_at(250);
        let first = a.push(x);
        assert_eq!(first.len(), TS_PACKET_SIZE);
        let second = a.push(y);
        assert_eq!(&second[..], &cell(2)[..]);
    }

    #[test]
    fn chunk_without_sync_yields_nothing() {
        let mut a = TsAligner::default();
        assert!(a.push(&[0u8; 400]).is_empty());
        assert_eq!(a.dropped(), 400);
    }

    #[test]
    fn audio_is_cut_into_whole_frames() {
        let mut f = AudioFramer::new(ALAW_FRAME_SIZE);
        let mut frames = Vec::new();
        for len in [100usize, 7, 93, 200, 80] {
            frames.extend(f.push(&vec![0xD5; len]));
        }
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|fr| fr.len() == ALAW_FRAME_SIZE));
        assert_eq!(f.pending(), 0);

        assert!(f.push(&[1; 159]).is_empty());
        assert_eq!(f.pending(), 159);
        assert_eq!(f.push(&[2]).len(), 1);
    }
}
