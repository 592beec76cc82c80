//! A set of predicates sharing one composite-key secondary store.

use std::sync::Arc;

use async_trait::async_trait;

use super::change_tracker::{BeforeKeys, ChangeTracker, Phase, UpdateOp};
use super::composite::{chain_key, CompositeKey};
use super::key::Predicate;
use super::record_id::RecordId;
use crate::config::PsfConfig;
use crate::error::Result;
use crate::query::chain::{ChainReader, ChainWalk, DeadRecords};
use crate::query::CancelToken;
use crate::store::{CheckpointKind, CheckpointToken, ReadStatus, SecondaryStore, StoreStats};
use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStats {
    pub group_id: u64,
    pub predicates: Vec<String>,
    pub store: StoreStats,
}

pub struct PredicateGroup<D> {
    id: u64,
    predicates: Vec<Box<dyn Predicate<D>>>,
    names: Vec<Arc<str>>,
    store: SecondaryStore,
}

impl<D> std::fmt::Debug for PredicateGroup<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateGroup")
            .field("id", &self.id)
            .field("predicates", &self.names)
            .field("store", &self.store)
            .finish()
    }
}

impl<D: Send + Sync + 'static> PredicateGroup<D> {
    pub(crate) fn open(
        id: u64,
        predicates: Vec<Box<dyn Predicate<D>>>,
        config: &PsfConfig,
    ) -> Result<Self> {
        let names = predicates.iter().map(|p| Arc::from(p.name())).collect();
        let store = SecondaryStore::open(&config.group_dir(id), config)?;
        Ok(Self {
            id,
            predicates,
            names,
            store,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub(crate) fn name(&self, ordinal: u8) -> Option<&Arc<str>> {
        self.names.get(ordinal as usize)
    }

    pub fn store(&self) -> &SecondaryStore {
        &self.store
    }

    /// Evaluates every predicate, in ordinal order.
    pub fn evaluate(&self, data: &D) -> CompositeKey {
        CompositeKey::from_outputs(self.predicates.iter().map(|p| p.evaluate(data)).collect())
    }

    /// Applies one phase of a primary-store operation to this group.
    ///
    /// `Insert` never touches the tracker and writes nothing when no
    /// predicate matches. The other phases need the update's tracker.
    pub fn execute_and_store(
        &self,
        data: &D,
        record_id: RecordId,
        phase: Phase,
        tracker: Option<&mut ChangeTracker<D>>,
    ) -> Result<()> {
        let key = self.evaluate(data);
        if phase == Phase::Insert {
            if !key.any_match() {
                return Ok(());
            }
            return self.write(&key, record_id, false);
        }

        let tracker = tracker.ok_or_else(|| {
            Error::Internal(format!("{:?} phase requires a change tracker", phase))
        })?;
        match phase {
            Phase::PreUpdate => {
                self.store_before(key, tracker);
                Ok(())
            }
            Phase::PostUpdate => self.store_after(key, tracker),
            Phase::Delete => {
                self.store_before(key.clone(), tracker);
                if key.any_match() {
                    self.write(&key, record_id, true)?;
                }
                Ok(())
            }
            Phase::Insert => Ok(()),
        }
    }

    /// Captures the before keys from the tracker's before snapshot, unless
    /// already captured.
    pub fn get_before_keys(&self, tracker: &mut ChangeTracker<D>) -> Result<()> {
        if !tracker.needs_before(self.id) {
            return Ok(());
        }
        let key = match tracker.before_data() {
            Some(data) => self.evaluate(data),
            None => {
                return Err(Error::Internal(
                    "update has no before data".to_string(),
                ))
            }
        };
        self.store_before(key, tracker);
        Ok(())
    }

    pub fn update(&self, tracker: &mut ChangeTracker<D>) -> Result<()> {
        self.get_before_keys(tracker)?;
        let key = match tracker.after_data() {
            Some(data) => self.evaluate(data),
            None => {
                return Err(Error::Internal(
                    "update has no after data".to_string(),
                ))
            }
        };
        self.store_after(key, tracker)
    }

    pub fn delete(&self, tracker: &mut ChangeTracker<D>) -> Result<()> {
        self.get_before_keys(tracker)?;
        match self.before_keys(tracker)? {
            BeforeKeys::Captured(before) => {
                self.write(&before, tracker.before_record_id(), true)
            }
            BeforeKeys::NoMatch | BeforeKeys::Missing => Ok(()),
        }
    }

    fn before_keys(&self, tracker: &ChangeTracker<D>) -> Result<BeforeKeys> {
        tracker.before_keys(self.id).ok_or_else(|| {
            Error::Internal(format!("before keys of group {} were not captured", self.id))
        })
    }

    fn store_before(&self, key: CompositeKey, tracker: &mut ChangeTracker<D>) {
        let before = if key.any_match() {
            BeforeKeys::Captured(key)
        } else {
            BeforeKeys::NoMatch
        };
        tracker.set_before_keys(self.id, before);
    }

    fn store_after(&self, mut after: CompositeKey, tracker: &mut ChangeTracker<D>) -> Result<()> {
        let before = match self.before_keys(tracker)? {
            BeforeKeys::Captured(before) => before,
            BeforeKeys::NoMatch => CompositeKey::from_outputs(vec![None; self.len()]),
            BeforeKeys::Missing => {
                // The record was never indexed by this group
                tracing::debug!(group_id = self.id, "Group registered mid-update, inserting");
                let has_changes = after.any_match();
                if has_changes {
                    self.write(&after, tracker.after_record_id(), false)?;
                }
                tracker.set_after_keys(self.id, after, has_changes);
                return Ok(());
            }
        };

        let changed = mark_changes(&before, &mut after);
        let before_rid = tracker.before_record_id();
        let after_rid = tracker.after_record_id();

        match tracker.op() {
            UpdateOp::Ipu if changed => {
                let unlink = before.retain(|kp| {
                    after
                        .pointer(kp.ordinal)
                        .is_some_and(|a| a.is_unlink_old)
                });
                if unlink.any_match() {
                    self.write(&unlink, before_rid, true)?;
                }
                let link = after.retain(|kp| kp.is_link_new);
                if link.any_match() {
                    self.write(&link, after_rid, false)?;
                }
            }
            UpdateOp::Ipu => {}
            UpdateOp::Rcu => {
                // The record id changed, so every chain has to move to the new one
                if before.any_match() {
                    self.write(&before, before_rid, true)?;
                }
                if after.any_match() {
                    self.write(&after, after_rid, false)?;
                }
            }
            op => {
                return Err(Error::Internal(format!(
                    "post-update applied to a {:?} operation",
                    op
                )))
            }
        }

        let has_changes = match tracker.op() {
            UpdateOp::Rcu => changed || before.any_match() || after.any_match(),
            _ => changed,
        };
        tracker.set_after_keys(self.id, after, has_changes);
        Ok(())
    }

    fn write(&self, key: &CompositeKey, record_id: RecordId, tombstone: bool) -> Result<()> {
        let mut session = self.store.session()?;
        self.store.upsert(&mut session, key, record_id, tombstone)?;
        Ok(())
    }

    pub fn take_checkpoint(&self, kind: CheckpointKind, token: CheckpointToken) -> Result<bool> {
        self.store.take_checkpoint(kind, token)
    }

    pub fn abort_checkpoint(&self, token: CheckpointToken) -> Result<()> {
        self.store.abort_checkpoint(token)
    }

    pub fn checkpoint_in_progress(&self) -> Result<bool> {
        self.store.checkpoint_in_progress()
    }

    pub fn complete_checkpoint(&self) -> Result<Option<CheckpointToken>> {
        self.store.complete_checkpoint()
    }

    pub fn recover(
        &self,
        index_token: Option<CheckpointToken>,
        log_token: Option<CheckpointToken>,
    ) -> Result<CheckpointToken> {
        self.store.recover(index_token, log_token)
    }

    pub fn flush(&self, wait: bool) -> Result<()> {
        self.store.flush(wait).map(|_| ())
    }

    pub fn flush_and_evict(&self, wait: bool) -> Result<()> {
        self.store.flush_and_evict(wait)
    }

    pub fn dispose_from_memory(&self) -> Result<()> {
        self.store.dispose_from_memory()
    }

    pub fn stats(&self) -> Result<GroupStats> {
        Ok(GroupStats {
            group_id: self.id,
            predicates: self.names.iter().map(|n| n.to_string()).collect(),
            store: self.store.stats()?,
        })
    }
}

/// Flags the slots whose value differs between `before` and `after`.
/// Returns whether any slot changed.
pub(crate) fn mark_changes(before: &CompositeKey, after: &mut CompositeKey) -> bool {
    let mut changed = false;
    for (b, a) in before.pointers.iter().zip(after.pointers.iter_mut()) {
        if b.key == a.key {
            continue;
        }
        a.is_unlink_old = !b.is_null();
        a.is_link_new = !a.is_null();
        changed = true;
    }
    changed
}

#[async_trait]
impl<D: Send + Sync + 'static> ChainReader for PredicateGroup<D> {
    fn group_id(&self) -> u64 {
        self.id
    }

    fn read_chain(
        &self,
        ordinal: u8,
        key: &[u8],
        cancel: &CancelToken,
        dead: &mut DeadRecords,
    ) -> Result<Option<Vec<RecordId>>> {
        let mut session = self.store.session()?;
        let mut walk = ChainWalk::new(ordinal, key, self.store.chain_head(&chain_key(ordinal, key)));

        while let Some(address) = walk.next_address() {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let record = match self.store.read(&mut session, address)? {
                ReadStatus::Found(record) => record,
                ReadStatus::Pending(pending) => pending.complete()?,
                ReadStatus::NotFound => break,
            };
            walk.visit(address, record, dead)?;
        }
        Ok(Some(walk.finish()))
    }

    async fn read_chain_async(
        &self,
        ordinal: u8,
        key: &[u8],
        cancel: &CancelToken,
        dead: &mut DeadRecords,
    ) -> Result<Option<Vec<RecordId>>> {
        let mut session = self.store.session()?;
        let mut walk = ChainWalk::new(ordinal, key, self.store.chain_head(&chain_key(ordinal, key)));

        while let Some(address) = walk.next_address() {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let status = self.store.read(&mut session, address)?;
            let record = match status {
                ReadStatus::Found(record) => record,
                ReadStatus::Pending(pending) => pending.complete_async().await?,
                ReadStatus::NotFound => break,
            };
            walk.visit(address, record, dead)?;
        }
        Ok(Some(walk.finish()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psf::key::PredicateFn;
    use crate::psf::PsfKey;
    use crate::tmpfs::TempDir;

    #[derive(Debug, Clone)]
    struct Item {
        color: u8,
        size: u32,
    }

    fn open_group(temp_dir: &TempDir) -> PredicateGroup<Item> {
        let predicates: Vec<Box<dyn Predicate<Item>>> = vec![
            Box::new(PredicateFn::<Item, u8, _>::new("color", |item: &Item| {
                Some(item.color)
            })),
            Box::new(PredicateFn::<Item, bool, _>::new("large", |item: &Item| {
                (item.size > 10).then_some(true)
            })),
        ];
        PredicateGroup::open(0, predicates, &PsfConfig::new(temp_dir.path()))
            .expect("Failed to open group")
    }

    fn query(group: &PredicateGroup<Item>, ordinal: u8, key: Vec<u8>) -> Vec<RecordId> {
        group
            .read_chain(ordinal, &key, &CancelToken::new(), &mut DeadRecords::new())
            .unwrap()
            .unwrap()
    }

    fn tracker_for(before: Item, rid: RecordId) -> ChangeTracker<Item> {
        let mut tracker = ChangeTracker::new();
        tracker.set_before(before, rid);
        tracker
    }

    #[test]
    fn test_mark_changes() {
        let before = CompositeKey::from_outputs(vec![Some(vec![1]), None, Some(vec![3])]);
        let mut after = CompositeKey::from_outputs(vec![Some(vec![1]), Some(vec![2]), None]);

        assert!(mark_changes(&before, &mut after));
        assert!(!after.pointers[0].is_unlink_old && !after.pointers[0].is_link_new);
        assert!(!after.pointers[1].is_unlink_old && after.pointers[1].is_link_new);
        assert!(after.pointers[2].is_unlink_old && !after.pointers[2].is_link_new);

        let mut same = before.clone();
        assert!(!mark_changes(&before, &mut same));
    }

    #[test]
    fn test_insert_without_match_writes_nothing() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let predicates: Vec<Box<dyn Predicate<Item>>> = vec![Box::new(PredicateFn::<Item, u8, _>::new(
            "never",
            |_: &Item| None,
        ))];
        let group = PredicateGroup::open(3, predicates, &PsfConfig::new(temp_dir.path())).unwrap();

        group
            .execute_and_store(&Item { color: 1, size: 1 }, RecordId::new(1, 0), Phase::Insert, None)
            .unwrap();
        assert!(group.store().stats().unwrap().resident_bytes == 0);
    }

    #[test]
    fn test_in_place_update_relinks_changed_slot() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let group = open_group(&temp_dir);
        let rid = RecordId::new(1, 0);
        let red = Item { color: 1, size: 20 };
        group
            .execute_and_store(&red, rid, Phase::Insert, None)
            .unwrap();

        let mut tracker = tracker_for(red, rid);
        tracker.set_after(Item { color: 2, size: 20 }, rid);
        group.update(&mut tracker).unwrap();

        assert!(tracker.has_changes(0));
        assert!(query(&group, 0, 1u8.encode()).is_empty());
        assert_eq!(query(&group, 0, 2u8.encode()), vec![rid]);
        assert_eq!(query(&group, 1, true.encode()), vec![rid]);
    }

    #[test]
    fn test_unchanged_update_writes_nothing() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let group = open_group(&temp_dir);
        let rid = RecordId::new(1, 0);
        let item = Item { color: 1, size: 5 };
        group.execute_and_store(&item, rid, Phase::Insert, None).unwrap();
        let tail = group.store().stats().unwrap().tail_address;

        let mut tracker = tracker_for(item.clone(), rid);
        tracker.set_after(Item { color: 1, size: 6 }, rid);
        group.update(&mut tracker).unwrap();

        assert!(!tracker.has_changes(0));
        assert_eq!(group.store().stats().unwrap().tail_address, tail);
    }

    #[test]
    fn test_copy_update_moves_every_chain() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let group = open_group(&temp_dir);
        let old = RecordId::new(1, 0);
        let new = RecordId::new(2, 0);
        let item = Item { color: 4, size: 50 };
        group.execute_and_store(&item, old, Phase::Insert, None).unwrap();

        let mut tracker = tracker_for(item.clone(), old);
        tracker.set_after(item, new);
        group.update(&mut tracker).unwrap();

        assert_eq!(query(&group, 0, 4u8.encode()), vec![new]);
        assert_eq!(query(&group, 1, true.encode()), vec![new]);
    }

    #[test]
    fn test_delete_tombstones_before_keys() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let group = open_group(&temp_dir);
        let rid = RecordId::new(1, 0);
        let item = Item { color: 9, size: 1 };
        group.execute_and_store(&item, rid, Phase::Insert, None).unwrap();

        let mut tracker = tracker_for(item, rid);
        tracker.set_op(UpdateOp::Delete);
        group.delete(&mut tracker).unwrap();
        assert!(query(&group, 0, 9u8.encode()).is_empty());
    }

    #[test]
    fn test_missing_before_keys_insert_after() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let group = open_group(&temp_dir);
        let rid = RecordId::new(1, 0);

        let mut tracker = tracker_for(Item { color: 1, size: 1 }, rid);
        tracker.mark_captured(0);
        tracker.set_after(Item { color: 3, size: 1 }, rid);
        group.update(&mut tracker).unwrap();

        assert_eq!(query(&group, 0, 3u8.encode()), vec![rid]);
        assert!(query(&group, 0, 1u8.encode()).is_empty());
    }

    #[test]
    fn test_phases_require_tracker() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let group = open_group(&temp_dir);
        let result = group.execute_and_store(
            &Item { color: 1, size: 1 },
            RecordId::new(1, 0),
            Phase::PostUpdate,
            None,
        );
        assert!(matches!(result, Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn test_async_chain_read_from_disk() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let group = open_group(&temp_dir);
        for address in 1..=3 {
            group
                .execute_and_store(
                    &Item { color: 5, size: 1 },
                    RecordId::new(address, 0),
                    Phase::Insert,
                    None,
                )
                .unwrap();
        }
        group.flush_and_evict(true).unwrap();

        let ids = group
            .read_chain_async(0, &5u8.encode(), &CancelToken::new(), &mut DeadRecords::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_cancelled_walk_returns_none() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let group = open_group(&temp_dir);
        group
            .execute_and_store(&Item { color: 5, size: 1 }, RecordId::new(1, 0), Phase::Insert, None)
            .unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let result = group
            .read_chain(0, &5u8.encode(), &cancel, &mut DeadRecords::new())
            .unwrap();
        assert!(result.is_none());
    }
}
