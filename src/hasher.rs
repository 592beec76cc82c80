use std::fmt;

use crc::{Crc, Digest, CRC_64_ECMA_182};

/// CRC-64 used for log records and checkpoint files.
static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Incremental CRC-64 hasher.
#[derive(Clone)]
pub struct Hasher {
    digest: Digest<'static, u64>,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hasher")
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            digest: CRC64.digest(),
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    pub fn checksum(&self) -> u64 {
        self.digest.clone().finalize()
    }

    pub fn reset(&mut self) {
        self.digest = CRC64.digest();
    }

    /// One-shot checksum of `data`.
    pub fn checksum_of(data: &[u8]) -> u64 {
        CRC64.checksum(data)
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}
