//! A minimal append-only primary store wired to a [`PsfManager`] through
//! its update-dispatch hooks.
//!
//! Records live in an in-memory log; the record id of a record is its log
//! address. Records at or above the read-only address are updated in place,
//! records below it are copied to the tail (read-copy-update).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::psf::{ChangeTracker, PsfManager, RecordId};
use crate::Error;

/// The view of a record handed to predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderData<K, V> {
    pub key: K,
    pub value: V,
}

#[derive(Debug)]
struct PrimaryState<K, V> {
    /// Slot `i` holds address `i + 1`; copied-away and deleted records are `None`.
    log: Vec<Option<ProviderData<K, V>>>,
    index: HashMap<K, u64>,
    read_only_address: u64,
    version: u32,
}

impl<K, V> PrimaryState<K, V> {
    fn tail_address(&self) -> u64 {
        self.log.len() as u64 + 1
    }

    fn record_id(&self, address: u64) -> RecordId {
        RecordId::new(address, self.version)
    }

    fn slot_mut(&mut self, address: u64) -> Result<&mut Option<ProviderData<K, V>>> {
        address
            .checked_sub(1)
            .and_then(|i| self.log.get_mut(i as usize))
            .ok_or(Error::InvalidAddress(address))
    }
}

pub struct PrimaryStore<K, V> {
    psf: Arc<PsfManager<ProviderData<K, V>>>,
    state: Mutex<PrimaryState<K, V>>,
}

impl<K, V> PrimaryStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(psf: Arc<PsfManager<ProviderData<K, V>>>) -> Self {
        Self {
            psf,
            state: Mutex::new(PrimaryState {
                log: Vec::new(),
                index: HashMap::new(),
                read_only_address: 1,
                version: 1,
            }),
        }
    }

    pub fn psf(&self) -> &PsfManager<ProviderData<K, V>> {
        &self.psf
    }

    /// Inserts or replaces the value of `key`.
    pub fn upsert(&self, key: K, value: V) -> Result<RecordId> {
        let mut state = self.state.lock()?;
        match state.index.get(&key).copied() {
            Some(address) => self.update_record(&mut state, address, |v| *v = value),
            None => self.initial_updater(&mut state, key, value),
        }
    }

    /// Applies `f` to the value of `key`. Returns `None` if the key is absent.
    pub fn update_with<F>(&self, key: &K, f: F) -> Result<Option<RecordId>>
    where
        F: FnOnce(&mut V),
    {
        let mut state = self.state.lock()?;
        match state.index.get(key).copied() {
            Some(address) => self.update_record(&mut state, address, f).map(Some),
            None => Ok(None),
        }
    }

    pub fn delete(&self, key: &K) -> Result<bool> {
        let mut state = self.state.lock()?;
        let Some(address) = state.index.get(key).copied() else {
            return Ok(false);
        };
        let record_id = state.record_id(address);
        let before = state
            .slot_mut(address)?
            .clone()
            .ok_or(Error::InvalidAddress(address))?;

        let mut tracker = self.psf.begin_update(&before, record_id)?;
        self.psf.delete(&mut tracker)?;

        *state.slot_mut(address)? = None;
        state.index.remove(key);
        Ok(true)
    }

    pub fn get(&self, key: &K) -> Result<Option<(RecordId, V)>> {
        let mut state = self.state.lock()?;
        let Some(address) = state.index.get(key).copied() else {
            return Ok(None);
        };
        let record_id = state.record_id(address);
        let value = state
            .slot_mut(address)?
            .as_ref()
            .map(|data| (record_id, data.value.clone()));
        Ok(value)
    }

    /// Resolves a record id returned by a query.
    pub fn read(&self, record_id: RecordId) -> Result<Option<ProviderData<K, V>>> {
        let mut state = self.state.lock()?;
        if record_id.version != state.version || record_id.address >= state.tail_address() {
            return Ok(None);
        }
        Ok(state.slot_mut(record_id.address)?.clone())
    }

    /// Makes every existing record read-only; their next update is a copy.
    pub fn shift_read_only_address(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        state.read_only_address = state.tail_address();
        Ok(())
    }

    fn initial_updater(&self, state: &mut PrimaryState<K, V>, key: K, value: V) -> Result<RecordId> {
        let address = state.tail_address();
        let record_id = state.record_id(address);
        let data = ProviderData { key, value };

        self.psf.upsert(&data, record_id, None)?;
        state.index.insert(data.key.clone(), address);
        state.log.push(Some(data));
        Ok(record_id)
    }

    fn update_record<F>(&self, state: &mut PrimaryState<K, V>, address: u64, f: F) -> Result<RecordId>
    where
        F: FnOnce(&mut V),
    {
        if address >= state.read_only_address {
            self.in_place_updater(state, address, f)
        } else {
            self.copy_updater(state, address, f)
        }
    }

    fn in_place_updater<F>(&self, state: &mut PrimaryState<K, V>, address: u64, f: F) -> Result<RecordId>
    where
        F: FnOnce(&mut V),
    {
        let record_id = state.record_id(address);
        let slot = state.slot_mut(address)?;
        let data = slot.as_mut().ok_or(Error::InvalidAddress(address))?;

        // The tracker owns the before snapshot before the record is mutated
        let mut tracker = self.psf.begin_update(data, record_id)?;
        f(&mut data.value);
        self.psf.set_after_data(&mut tracker, data.clone(), record_id);
        self.psf.upsert(data, record_id, Some(&mut tracker))?;
        Ok(record_id)
    }

    fn copy_updater<F>(&self, state: &mut PrimaryState<K, V>, address: u64, f: F) -> Result<RecordId>
    where
        F: FnOnce(&mut V),
    {
        let old_id = state.record_id(address);
        let before = state
            .slot_mut(address)?
            .clone()
            .ok_or(Error::InvalidAddress(address))?;
        let mut tracker: ChangeTracker<ProviderData<K, V>> = self.psf.begin_update(&before, old_id)?;

        let mut after = before;
        f(&mut after.value);
        let new_address = state.tail_address();
        let new_id = state.record_id(new_address);
        self.psf.set_after_data(&mut tracker, after.clone(), new_id);
        self.psf.update(&mut tracker)?;

        state.index.insert(after.key.clone(), new_address);
        state.log.push(Some(after));
        *state.slot_mut(address)? = None;
        Ok(new_id)
    }
}

impl<K, V> std::fmt::Debug for PrimaryStore<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimaryStore")
            .field("psf", &self.psf)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PsfConfig;
    use crate::psf::{Psf, UpdateOp};
    use crate::query::QuerySettings;
    use crate::tmpfs::TempDir;

    type Data = ProviderData<u32, u8>;

    fn store(temp_dir: &TempDir) -> (PrimaryStore<u32, u8>, Psf<u8>) {
        let psf = Arc::new(PsfManager::new(PsfConfig::new(temp_dir.path())).unwrap());
        let value = psf.register_psf("value", |d: &Data| Some(d.value)).unwrap();
        (PrimaryStore::new(psf), value)
    }

    fn ids(store: &PrimaryStore<u32, u8>, psf: &Psf<u8>, key: u8) -> Vec<RecordId> {
        store
            .psf()
            .query(psf, &key, QuerySettings::new())
            .unwrap()
            .into_iter()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_in_place_update_keeps_record_id() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (store, value) = store(&temp_dir);

        let rid = store.upsert(1, 10).unwrap();
        assert_eq!(store.upsert(1, 20).unwrap(), rid);
        assert!(ids(&store, &value, 10).is_empty());
        assert_eq!(ids(&store, &value, 20), vec![rid]);
        assert_eq!(store.get(&1).unwrap(), Some((rid, 20)));
    }

    #[test]
    fn test_copy_update_moves_record() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (store, value) = store(&temp_dir);

        let old = store.upsert(1, 10).unwrap();
        store.shift_read_only_address().unwrap();
        let new = store.update_with(&1, |v| *v += 1).unwrap().unwrap();

        assert!(new > old);
        assert_eq!(store.read(old).unwrap(), None);
        assert!(ids(&store, &value, 10).is_empty());
        assert_eq!(ids(&store, &value, 11), vec![new]);
        assert_eq!(store.update_with(&2, |v| *v += 1).unwrap(), None);
    }

    #[test]
    fn test_delete_removes_from_index() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (store, value) = store(&temp_dir);

        store.upsert(1, 10).unwrap();
        let kept = store.upsert(2, 10).unwrap();
        assert!(store.delete(&1).unwrap());
        assert!(!store.delete(&1).unwrap());
        assert_eq!(ids(&store, &value, 10), vec![kept]);
    }

    #[test]
    fn test_before_snapshot_is_owned() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (store, _) = store(&temp_dir);
        let data = ProviderData { key: 1, value: 5 };

        let mut tracker = store.psf().begin_update(&data, RecordId::new(1, 1)).unwrap();
        drop(data);
        store
            .psf()
            .set_after_data(&mut tracker, ProviderData { key: 1, value: 6 }, RecordId::new(1, 1));
        assert_eq!(tracker.before_data().map(|d| d.value), Some(5));
        assert_eq!(tracker.op(), UpdateOp::Ipu);
    }
}
