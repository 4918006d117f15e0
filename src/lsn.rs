//! PostgreSQL log sequence number helpers
//!
//! An LSN is the WAL byte position, formatted on the wire and in catalog
//! views as two hex 32-bit words separated by a slash (`H/L`). Internally we
//! always carry it as a single `u64` (`upper << 32 | lower`) so ordering and
//! arithmetic are plain integer operations.

use crate::errors::{OutboxError, OutboxResult};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn new(raw: u64) -> Self {
        Lsn(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// Parse the `"H/L"` textual form used by `pg_replication_slots`,
    /// `IDENTIFY_SYSTEM`, and the protocol-level feedback messages.
    pub fn parse(s: &str) -> OutboxResult<Self> {
        let (upper, lower) = s
            .split_once('/')
            .ok_or_else(|| OutboxError::protocol(format!("malformed LSN: {s}")))?;
        let upper = u32::from_str_radix(upper, 16)
            .map_err(|_| OutboxError::protocol(format!("malformed LSN upper word: {s}")))?;
        let lower = u32::from_str_radix(lower, 16)
            .map_err(|_| OutboxError::protocol(format!("malformed LSN lower word: {s}")))?;
        Ok(Lsn(((upper as u64) << 32) | lower as u64))
    }

    /// The LSN to acknowledge for "current + 1", with lower-word wrap to
    /// zero and upper-word carry,
    pub fn next(self) -> Self {
        let upper = (self.0 >> 32) as u32;
        let lower = self.0 as u32;
        if lower == 0xFFFF_FFFF {
            Lsn((((upper.wrapping_add(1)) as u64) << 32) | 0)
        } else {
            Lsn(self.0 + 1)
        }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let upper = (self.0 >> 32) as u32;
        let lower = self.0 as u32;
        write!(f, "{upper:X}/{lower:X}")
    }
}

impl From<u64> for Lsn {
    fn from(raw: u64) -> Self {
        Lsn(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats_round_trip() {
        let lsn = Lsn::parse("0/16B6E40").unwrap();
        assert_eq!(lsn.to_string(), "0/16B6E40");
    }

    #[test]
    fn orders_by_numeric_value_not_text() {
        let a = Lsn::parse("0/16B6E40").unwrap();
        let b = Lsn::parse("0/16B6E60").unwrap();
        let c = Lsn::parse("0/16B6E80").unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn next_wraps_lower_word_with_upper_carry() {
        let lsn = Lsn::new(0x0000_0001_FFFF_FFFF);
        let next = lsn.next();
        assert_eq!(next.raw(), 0x0000_0002_0000_0000);
    }

    #[test]
    fn next_increments_without_wrap() {
        let lsn = Lsn::parse("0/16B6E40").unwrap();
        assert_eq!(lsn.next().raw(), lsn.raw() + 1);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(Lsn::parse("not-an-lsn").is_err());
        assert!(Lsn::parse("ZZ/11").is_err());
    }
}
