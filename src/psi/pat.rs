use crate::psi::section::{SectionReader, pid_from};

/// Program Association Table
#[derive(Clone, Debug)]
pub struct PatSection {
    pub version:   u8,
    pub crc_valid: bool,
    /// `(program_number, pmt_pid)`, network entry excluded
    pub programs:  Vec<(u16, u16)>,
}

impl PatSection {
    /// PMT PID of the first real program
    pub fn first_pmt_pid(&self) -> Option<u16> {
        self.programs.first().map(|&(_, pid)| pid)
    }
}

pub fn parse_pat(payload: &[u8]) -> anyhow::Result<PatSection> {
    let sec = SectionReader::new(payload)?;
    if sec.table_id != 0x00 { anyhow::bail!("not PAT (table_id {:#04x})", sec.table_id); }

    // program 0 points at the NIT, not a PMT
    let programs = sec
        .body
        .chunks_exact(4)
        .map(|e| (u16::from_be_bytes([e[0], e[1]]), pid_from(e[2], e[3])))
        .filter(|&(program, _)| program != 0)
        .collect();
    Ok(PatSection { version: sec.version, crc_valid: sec.crc_valid, programs })
}
