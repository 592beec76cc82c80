use crossbeam_skiplist::SkipMap;

use crate::psf::INVALID_ADDRESS;

/// Chain-head index: `(ordinal, key)` chain key to the newest record address.
///
/// Readers look heads up without locking; writers update heads only after
/// the record they point at has been appended to the log.
#[derive(Debug, Default)]
pub struct HashIndex {
    heads: SkipMap<Vec<u8>, u64>,
}

impl HashIndex {
    pub fn new() -> Self {
        Self {
            heads: SkipMap::new(),
        }
    }

    /// Current head of the chain, or [`INVALID_ADDRESS`] if the chain is empty.
    pub fn head(&self, chain_key: &[u8]) -> u64 {
        self.heads
            .get(chain_key)
            .map(|entry| *entry.value())
            .unwrap_or(INVALID_ADDRESS)
    }

    pub fn set_head(&self, chain_key: Vec<u8>, address: u64) {
        self.heads.insert(chain_key, address);
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Ordered copy of every chain head, for index checkpoints.
    pub fn snapshot(&self) -> Vec<(Vec<u8>, u64)> {
        self.heads
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Replaces the whole index with checkpointed heads.
    pub fn restore(&self, entries: Vec<(Vec<u8>, u64)>) {
        self.heads.clear();
        for (chain_key, address) in entries {
            self.heads.insert(chain_key, address);
        }
    }
}
