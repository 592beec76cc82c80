//! Before/after state of one logical update, shared by every predicate group
//! the update fans out to.

use std::collections::HashMap;

use super::composite::CompositeKey;
use super::record_id::RecordId;

/// How the primary store applied an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Insert,
    /// In-place update: the record id is unchanged.
    Ipu,
    /// Read-copy-update: the record moved to a new record id.
    Rcu,
    Delete,
}

/// Point in the primary store's write path a group is executing for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Insert,
    PreUpdate,
    PostUpdate,
    Delete,
}

/// A group's composite key for the record before the update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeforeKeys {
    Captured(CompositeKey),
    /// Evaluated, but no predicate of the group matched.
    NoMatch,
    /// The group was registered after the before keys were captured.
    Missing,
}

#[derive(Debug, Clone)]
pub struct GroupKeys {
    pub before: BeforeKeys,
    pub after: Option<CompositeKey>,
    pub has_changes: bool,
}

impl GroupKeys {
    fn new(before: BeforeKeys) -> Self {
        Self {
            before,
            after: None,
            has_changes: false,
        }
    }
}

/// Scratch state for one update.
///
/// The before snapshot is owned, so the primary store may mutate the record
/// in place once the tracker exists.
#[derive(Debug)]
pub struct ChangeTracker<D> {
    before_data: Option<D>,
    before_record_id: RecordId,
    after_data: Option<D>,
    after_record_id: RecordId,
    op: UpdateOp,
    groups: HashMap<u64, GroupKeys>,
    /// Groups with an id below this had their before keys captured eagerly.
    captured_through: Option<u64>,
}

impl<D> Default for ChangeTracker<D> {
    fn default() -> Self {
        Self {
            before_data: None,
            before_record_id: RecordId::INVALID,
            after_data: None,
            after_record_id: RecordId::INVALID,
            op: UpdateOp::Insert,
            groups: HashMap::new(),
            captured_through: None,
        }
    }
}

impl<D> ChangeTracker<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op(&self) -> UpdateOp {
        self.op
    }

    pub fn before_data(&self) -> Option<&D> {
        self.before_data.as_ref()
    }

    pub fn before_record_id(&self) -> RecordId {
        self.before_record_id
    }

    pub fn after_data(&self) -> Option<&D> {
        self.after_data.as_ref()
    }

    pub fn after_record_id(&self) -> RecordId {
        self.after_record_id
    }

    pub fn group_keys(&self, group_id: u64) -> Option<&GroupKeys> {
        self.groups.get(&group_id)
    }

    /// Whether the last post-update changed any of the group's keys.
    pub fn has_changes(&self, group_id: u64) -> bool {
        self.groups.get(&group_id).is_some_and(|g| g.has_changes)
    }

    /// Replaces the before snapshot, discarding keys captured for the old one.
    pub(crate) fn set_before(&mut self, data: D, record_id: RecordId) {
        self.before_data = Some(data);
        self.before_record_id = record_id;
        self.groups.clear();
        self.captured_through = None;
    }

    pub(crate) fn set_after(&mut self, data: D, record_id: RecordId) {
        self.op = if self.before_data.is_none() {
            UpdateOp::Insert
        } else if record_id == self.before_record_id {
            UpdateOp::Ipu
        } else {
            UpdateOp::Rcu
        };
        self.after_data = Some(data);
        self.after_record_id = record_id;
    }

    pub(crate) fn set_op(&mut self, op: UpdateOp) {
        self.op = op;
    }

    pub(crate) fn mark_captured(&mut self, next_group_id: u64) {
        self.captured_through = Some(next_group_id);
    }

    /// Whether `group_id` still has to evaluate its before keys.
    pub(crate) fn needs_before(&self, group_id: u64) -> bool {
        match self.captured_through {
            Some(_) => false,
            None => !self.groups.contains_key(&group_id),
        }
    }

    /// The group's before keys, or `None` if they were expected to be
    /// captured but never were.
    pub(crate) fn before_keys(&self, group_id: u64) -> Option<BeforeKeys> {
        if let Some(keys) = self.groups.get(&group_id) {
            return Some(keys.before.clone());
        }
        match self.captured_through {
            Some(through) if group_id >= through => Some(BeforeKeys::Missing),
            _ => None,
        }
    }

    pub(crate) fn set_before_keys(&mut self, group_id: u64, before: BeforeKeys) {
        self.groups.insert(group_id, GroupKeys::new(before));
    }

    pub(crate) fn set_after_keys(&mut self, group_id: u64, after: CompositeKey, has_changes: bool) {
        let keys = self
            .groups
            .entry(group_id)
            .or_insert_with(|| GroupKeys::new(BeforeKeys::Missing));
        keys.after = Some(after);
        keys.has_changes = has_changes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_follows_record_ids() {
        let mut tracker = ChangeTracker::new();
        tracker.set_after("a", RecordId::new(1, 0));
        assert_eq!(tracker.op(), UpdateOp::Insert);

        tracker.set_before("a", RecordId::new(1, 0));
        tracker.set_after("b", RecordId::new(1, 0));
        assert_eq!(tracker.op(), UpdateOp::Ipu);

        tracker.set_after("c", RecordId::new(9, 0));
        assert_eq!(tracker.op(), UpdateOp::Rcu);
        assert_eq!(tracker.before_data(), Some(&"a"));
        assert_eq!(tracker.after_record_id(), RecordId::new(9, 0));
    }

    #[test]
    fn test_before_keys_states() {
        let mut tracker: ChangeTracker<()> = ChangeTracker::new();
        tracker.set_before((), RecordId::new(1, 0));
        assert!(tracker.needs_before(0));
        assert_eq!(tracker.before_keys(0), None);

        tracker.set_before_keys(0, BeforeKeys::NoMatch);
        tracker.mark_captured(1);
        assert!(!tracker.needs_before(0));
        assert!(!tracker.needs_before(1));
        assert_eq!(tracker.before_keys(0), Some(BeforeKeys::NoMatch));
        assert_eq!(tracker.before_keys(1), Some(BeforeKeys::Missing));
    }

    #[test]
    fn test_set_before_resets_group_state() {
        let mut tracker: ChangeTracker<u32> = ChangeTracker::new();
        tracker.set_before(1, RecordId::new(1, 0));
        tracker.set_before_keys(0, BeforeKeys::NoMatch);
        tracker.set_after_keys(0, CompositeKey::from_outputs(vec![None]), true);
        tracker.mark_captured(1);
        assert!(tracker.has_changes(0));

        tracker.set_before(2, RecordId::new(2, 0));
        assert!(tracker.group_keys(0).is_none());
        assert!(tracker.needs_before(0));
    }
}
