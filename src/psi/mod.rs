pub mod section;
pub mod pat;
pub mod pmt;

pub use pat::parse_pat;
pub use pmt::parse_pmt;
