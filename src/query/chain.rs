//! Walking one predicate chain of a secondary store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use super::settings::CancelToken;
use crate::error::Result;
use crate::psf::{chain_key, RecordId, INVALID_ADDRESS};
use crate::store::LogRecord;
use crate::Error;

/// Record ids found tombstoned during one query, per chain.
///
/// Scoped by chain so a record that moved from one key of a predicate to
/// another is only recorded against the chain it left. A walk only
/// suppresses records older than the tombstones it has seen itself, so a
/// second walk of the same chain is not affected by the first.
#[derive(Debug, Default)]
pub struct DeadRecords {
    by_chain: HashMap<Vec<u8>, HashSet<RecordId>>,
}

impl DeadRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, chain: &[u8], record_id: RecordId) {
        self.by_chain
            .entry(chain.to_vec())
            .or_default()
            .insert(record_id);
    }

    pub fn is_dead(&self, chain: &[u8], record_id: RecordId) -> bool {
        self.by_chain
            .get(chain)
            .is_some_and(|dead| dead.contains(&record_id))
    }

    pub fn len(&self) -> usize {
        self.by_chain.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reads the chain of `(ordinal, key)` and returns its live record ids in
/// ascending order, or `None` if the walk was cancelled.
#[async_trait]
pub trait ChainReader: Send + Sync {
    fn group_id(&self) -> u64;

    fn read_chain(
        &self,
        ordinal: u8,
        key: &[u8],
        cancel: &CancelToken,
        dead: &mut DeadRecords,
    ) -> Result<Option<Vec<RecordId>>>;

    async fn read_chain_async(
        &self,
        ordinal: u8,
        key: &[u8],
        cancel: &CancelToken,
        dead: &mut DeadRecords,
    ) -> Result<Option<Vec<RecordId>>>;
}

/// One predicate of a query with the encoded keys it is queried for.
#[derive(Clone)]
pub struct ChainSource {
    pub(crate) reader: Arc<dyn ChainReader>,
    pub(crate) name: Arc<str>,
    pub(crate) ordinal: u8,
    pub(crate) keys: Vec<Vec<u8>>,
}

impl ChainSource {
    pub(crate) fn new(
        reader: Arc<dyn ChainReader>,
        name: Arc<str>,
        ordinal: u8,
        keys: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            reader,
            name,
            ordinal,
            keys,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ChainSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainSource")
            .field("group_id", &self.reader.group_id())
            .field("name", &self.name)
            .field("ordinal", &self.ordinal)
            .field("keys", &self.keys.len())
            .finish()
    }
}

/// State of one chain walk, newest record first. The caller fetches each
/// address (resident or pending) and hands the record to [`ChainWalk::visit`].
#[derive(Debug)]
pub(crate) struct ChainWalk {
    ordinal: u8,
    key: Vec<u8>,
    chain: Vec<u8>,
    next: u64,
    tombstoned: HashSet<RecordId>,
    live: Vec<RecordId>,
}

impl ChainWalk {
    pub(crate) fn new(ordinal: u8, key: &[u8], head: u64) -> Self {
        Self {
            ordinal,
            key: key.to_vec(),
            chain: chain_key(ordinal, key),
            next: head,
            tombstoned: HashSet::new(),
            live: Vec::new(),
        }
    }

    pub(crate) fn next_address(&self) -> Option<u64> {
        (self.next != INVALID_ADDRESS).then_some(self.next)
    }

    pub(crate) fn visit(&mut self, address: u64, record: LogRecord, dead: &mut DeadRecords) -> Result<()> {
        let slot = record
            .key
            .pointer(self.ordinal)
            .filter(|kp| kp.key.as_deref() == Some(self.key.as_slice()))
            .ok_or_else(|| {
                Error::CorruptedRecord(format!(
                    "record at {} is not on chain of predicate {}",
                    address, self.ordinal
                ))
            })?;
        self.next = slot.previous_address;

        if record.tombstone {
            self.tombstoned.insert(record.record_id);
            dead.mark(&self.chain, record.record_id);
        } else if !self.tombstoned.contains(&record.record_id) {
            self.live.push(record.record_id);
        }
        Ok(())
    }

    /// Live ids in ascending order.
    pub(crate) fn finish(mut self) -> Vec<RecordId> {
        self.live.sort_unstable();
        self.live.dedup();
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psf::CompositeKey;

    fn record(rid: u64, key: u8, previous: u64, tombstone: bool) -> LogRecord {
        let mut composite = CompositeKey::from_outputs(vec![Some(vec![key])]);
        composite.pointers[0].previous_address = previous;
        LogRecord::new(RecordId::new(rid, 0), composite, tombstone)
    }

    #[test]
    fn test_walk_skips_records_behind_tombstones() {
        let mut dead = DeadRecords::new();
        let mut walk = ChainWalk::new(0, &[7], 300);

        walk.visit(300, record(2, 7, 200, false), &mut dead).unwrap();
        walk.visit(200, record(1, 7, 100, true), &mut dead).unwrap();
        walk.visit(100, record(1, 7, INVALID_ADDRESS, false), &mut dead)
            .unwrap();
        assert_eq!(walk.next_address(), None);
        assert_eq!(walk.finish(), vec![RecordId::new(2, 0)]);
        assert!(dead.is_dead(&chain_key(0, &[7]), RecordId::new(1, 0)));
        assert!(!dead.is_dead(&chain_key(0, &[8]), RecordId::new(1, 0)));
    }

    #[test]
    fn test_second_walk_of_chain_keeps_newer_entry() {
        let mut dead = DeadRecords::new();
        // Record 1 left key 7 and came back: live at 300, tombstone at 200.
        for _ in 0..2 {
            let mut walk = ChainWalk::new(0, &[7], 300);
            walk.visit(300, record(1, 7, 200, false), &mut dead).unwrap();
            walk.visit(200, record(1, 7, 100, true), &mut dead).unwrap();
            walk.visit(100, record(1, 7, INVALID_ADDRESS, false), &mut dead)
                .unwrap();
            assert_eq!(walk.finish(), vec![RecordId::new(1, 0)]);
        }
        assert!(dead.is_dead(&chain_key(0, &[7]), RecordId::new(1, 0)));
    }

    #[test]
    fn test_walk_sorts_ascending() {
        let mut dead = DeadRecords::new();
        let mut walk = ChainWalk::new(0, &[1], 30);
        walk.visit(30, record(9, 1, 20, false), &mut dead).unwrap();
        walk.visit(20, record(4, 1, 10, false), &mut dead).unwrap();
        walk.visit(10, record(6, 1, 0, false), &mut dead).unwrap();

        let ids: Vec<u64> = walk.finish().iter().map(|id| id.address).collect();
        assert_eq!(ids, vec![4, 6, 9]);
    }

    #[test]
    fn test_walk_rejects_foreign_record() {
        let mut dead = DeadRecords::new();
        let mut walk = ChainWalk::new(0, &[1], 10);
        let result = walk.visit(10, record(1, 2, 0, false), &mut dead);
        assert!(matches!(result, Err(Error::CorruptedRecord(_))));
    }
}
