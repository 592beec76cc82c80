use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical address that terminates every chain.
pub const INVALID_ADDRESS: u64 = 0;

/// Reference to a record in the primary store's log.
///
/// Ordered by address first, then version. The merge-join relies on this
/// order both within a sub-stream and to detect ties across sub-streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId {
    pub address: u64,
    pub version: u32,
}

impl RecordId {
    pub const INVALID: RecordId = RecordId {
        address: INVALID_ADDRESS,
        version: 0,
    };

    pub fn new(address: u64, version: u32) -> Self {
        Self { address, version }
    }

    pub fn is_valid(&self) -> bool {
        self.address != INVALID_ADDRESS
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.address, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_by_address_then_version() {
        let a = RecordId::new(10, 2);
        let b = RecordId::new(11, 0);
        let c = RecordId::new(10, 3);

        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
        assert!(!RecordId::INVALID.is_valid());
        assert_eq!(a.to_string(), "10@2");
    }
}
