//! Annex-B to length-prefixed H.264 conversion.
//!
//! Each NAL unit found between start codes is written as a 4-byte big-endian
//! size followed by the unit. Trailing zero bytes that belong to a following
//! 4-byte start code are not part of the unit.
// TODO: validate against captures from real devices (SEI and filler NALs).

use bytes::{BufMut, Bytes, BytesMut};

/// NAL units of an Annex-B byte stream, without their start codes
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    // (start of the start code, first byte of the NAL)
    let mut marks = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let sc_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            marks.push((sc_start, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nals = Vec::with_capacity(marks.len() + 1);
    let leading_end = marks.first().map(|m| m.0).unwrap_or(data.len());
    push_trimmed(&mut nals, &data[..leading_end]);
    for (n, &(_, nal_start)) in marks.iter().enumerate() {
        let nal_end = marks.get(n + 1).map(|m| m.0).unwrap_or(data.len());
        push_trimmed(&mut nals, &data[nal_start..nal_end]);
    }
    nals
}

fn push_trimmed<'a>(nals: &mut Vec<&'a [u8]>, nal: &'a [u8]) {
    let len = nal.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    if len > 0 {
        nals.push(&nal[..len]);
    }
}

pub fn annexb_to_length_prefixed(data: &[u8]) -> Bytes {
    let nals = split_annexb(data);
    let mut out = BytesMut::with_capacity(data.len() + 4 * nals.len());
    for nal in nals {
        out.put_u32(nal.len() as u32);
        out.put_slice(nal);
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_start_codes() {
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x09, 0xF0, // AUD
            0x00, 0x00, 0x01, 0x67, 0x42, // SPS, 3-byte start code
            0x00, 0x00, 0x00, 0x01, 0x65, 0x88, // IDR slice
        ];
        let out = annexb_to_length_prefixed(&data);
        assert_eq!(
            &out[..],
            &[
                0, 0, 0, 2, 0x09, 0xF0, //
                0, 0, 0, 2, 0x67, 0x42, //
                0, 0, 0, 2, 0x65, 0x88,
            ]
        );
    }

    #[test]
    fn no_start_code_is_one_unit() {
        assert_eq!(split_annexb(&[0x41, 0x9A, 0x00, 0x07]), vec![&[0x41, 0x9A, 0x00, 0x07][..]]);
    }

    #[test]
    fn empty_and_zero_only() {
        assert!(annexb_to_length_prefixed(&[]).is_empty());
        assert!(split_annexb(&[0, 0, 0, 1, 0, 0]).is_empty());
    }
}
