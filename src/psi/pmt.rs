use crate::psi::section::{SectionReader, length_from, pid_from};
use crate::types::StreamType;

/// Program Map Table of the single program a camera carries
#[derive(Clone, Debug)]
pub struct PmtSection {
    pub version:        u8,
    pub program_number: u16,
    pub pcr_pid:        u16,
    pub crc_valid:      bool,
    pub streams:        Vec<StreamInfo>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub stream_type:    StreamType,
    pub elementary_pid: u16,
}

pub fn parse_pmt(payload: &[u8]) -> anyhow::Result<PmtSection> {
    let sec = SectionReader::new(payload)?;
    if sec.table_id != 0x02 { anyhow::bail!("not PMT (table_id {:#04x})", sec.table_id); }
    let Some((head, rest)) = sec.body.split_first_chunk::<4>() else {
        anyhow::bail!("short PMT body");
    };
    let pcr_pid = pid_from(head[0], head[1]);
    let mut rest = rest.get(length_from(head[2], head[3])..).unwrap_or_default();

    let mut streams = Vec::new();
    while let Some((entry, tail)) = rest.split_first_chunk::<5>() {
        streams.push(StreamInfo {
            stream_type:    StreamType::from(entry[0]),
            elementary_pid: pid_from(entry[1], entry[2]),
        });
        // ES descriptors are of no interest
        rest = tail.get(length_from(entry[3], entry[4])..).unwrap_or_default();
    }

    Ok(PmtSection {
        version:        sec.version,
        program_number: sec.table_id_ext,
        pcr_pid,
        crc_valid:      sec.crc_valid,
        streams,
    })
}
