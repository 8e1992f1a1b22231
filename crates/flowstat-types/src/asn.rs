//! Autonomous system numbers.

use std::fmt;

/// A 4-byte autonomous system number.
///
/// `0` is reserved (RFC 7607) and doubles as the "not found" result of a
/// routing table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct AsNumber(u32);

impl AsNumber {
    pub const UNKNOWN: AsNumber = AsNumber(0);

    pub const fn new(asn: u32) -> Self {
        AsNumber(asn)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn is_unknown(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for AsNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for AsNumber {
    fn from(asn: u32) -> Self {
        AsNumber(asn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_unknown() {
        assert!(AsNumber::UNKNOWN.is_unknown());
        assert!(AsNumber::default().is_unknown());
        assert!(!AsNumber::new(64500).is_unknown());
    }

    #[test]
    fn test_display() {
        assert_eq!(AsNumber::new(4_200_000_000).to_string(), "4200000000");
    }
}
