//! Registration, fan-out and query composition across predicate groups.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use super::change_tracker::{ChangeTracker, Phase, UpdateOp};
use super::group::{GroupStats, PredicateGroup};
use super::key::{Predicate, PredicateFn, Psf, PsfKey};
use super::record_id::RecordId;
use crate::config::PsfConfig;
use crate::error::Result;
use crate::query::{ChainReader, ChainSource, Combinator, Query, QuerySettings};
use crate::store::{CheckpointKind, CheckpointToken};
use crate::Error;

/// Slot ordinals are a single byte.
pub const MAX_PSFS_PER_GROUP: usize = 255;

/// Boxed predicate, for registering several predicates as one group.
pub type PsfFn<D, K> = Box<dyn Fn(&D) -> Option<K> + Send + Sync>;

/// Name of every registered predicate -> (group id, ordinal).
#[derive(Debug, Default)]
struct Registry {
    names: HashMap<Arc<str>, (u64, u8)>,
}

/// Entry point for registering predicates, keeping their groups in sync
/// with the primary store, and querying them.
pub struct PsfManager<D> {
    config: PsfConfig,
    identity: Arc<()>,
    registry: Mutex<Registry>,
    groups: RwLock<Vec<Arc<PredicateGroup<D>>>>,
    next_group_id: AtomicU64,
    last_token: AtomicU64,
}

impl<D: Clone + Send + Sync + 'static> PsfManager<D> {
    pub fn new(config: PsfConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        Ok(Self {
            config,
            identity: Arc::new(()),
            registry: Mutex::new(Registry::default()),
            groups: RwLock::new(Vec::new()),
            next_group_id: AtomicU64::new(0),
            last_token: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &PsfConfig {
        &self.config
    }

    pub fn group_count(&self) -> usize {
        self.groups.read().map(|groups| groups.len()).unwrap_or(0)
    }

    /// Registers `f` as the only predicate of a new group.
    pub fn register_psf<K, F>(&self, name: &str, f: F) -> Result<Psf<K>>
    where
        K: PsfKey,
        F: Fn(&D) -> Option<K> + Send + Sync + 'static,
    {
        let predicate: Box<dyn Predicate<D>> = Box::new(PredicateFn::<D, K, F>::new(name, f));
        self.register_group::<K>(vec![predicate])?
            .pop()
            .ok_or_else(|| Error::Internal("registration returned no predicate".to_string()))
    }

    /// Registers several predicates of one key type as a single group.
    pub fn register_psfs<K: PsfKey>(&self, definitions: Vec<(&str, PsfFn<D, K>)>) -> Result<Vec<Psf<K>>> {
        let predicates = definitions
            .into_iter()
            .map(|(name, f)| {
                Box::new(PredicateFn::<D, K, PsfFn<D, K>>::new(name, f)) as Box<dyn Predicate<D>>
            })
            .collect();
        self.register_group::<K>(predicates)
    }

    fn register_group<K: PsfKey>(&self, predicates: Vec<Box<dyn Predicate<D>>>) -> Result<Vec<Psf<K>>> {
        if predicates.is_empty() {
            return Err(Error::InvalidArgument(
                "null definition: no predicates given".to_string(),
            ));
        }
        if predicates.len() > MAX_PSFS_PER_GROUP {
            return Err(Error::InvalidArgument(format!(
                "{} predicates exceed the maximum of {} per group",
                predicates.len(),
                MAX_PSFS_PER_GROUP
            )));
        }
        K::KIND.validate()?;

        let mut registry = self.registry.lock()?;
        let mut batch = HashSet::new();
        for predicate in &predicates {
            let name = predicate.name();
            if name.is_empty() {
                return Err(Error::InvalidArgument(
                    "null definition: empty predicate name".to_string(),
                ));
            }
            if registry.names.contains_key(name) || !batch.insert(name) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate predicate name '{}'",
                    name
                )));
            }
        }

        let names: Vec<Arc<str>> = predicates.iter().map(|p| Arc::from(p.name())).collect();
        let group_id = self.next_group_id.fetch_add(1, Ordering::SeqCst);
        let group = Arc::new(PredicateGroup::open(group_id, predicates, &self.config)?);

        let psfs = names
            .iter()
            .enumerate()
            .map(|(ordinal, name)| {
                let ordinal = ordinal as u8;
                registry.names.insert(name.clone(), (group_id, ordinal));
                Psf::new(name.clone(), group_id, ordinal, self.identity.clone())
            })
            .collect();
        self.groups.write()?.push(group);

        tracing::info!(
            group_id,
            predicates = ?names,
            key_kind = ?K::KIND,
            "Registered predicate group"
        );
        Ok(psfs)
    }

    /// Checks that `psf` was registered with this manager and returns its group.
    pub fn verify_is_our_psf<K>(&self, psf: &Psf<K>) -> Result<Arc<PredicateGroup<D>>> {
        let not_ours = || {
            Error::InvalidArgument(format!(
                "predicate '{}' is not registered with this manager",
                psf.name
            ))
        };
        if !Arc::ptr_eq(&psf.owner, &self.identity) {
            return Err(not_ours());
        }
        self.groups
            .read()?
            .iter()
            .find(|group| group.id() == psf.group_id)
            .filter(|group| group.name(psf.ordinal) == Some(&psf.name))
            .cloned()
            .ok_or_else(not_ours)
    }

    fn groups(&self) -> Result<Vec<Arc<PredicateGroup<D>>>> {
        Ok(self.groups.read()?.clone())
    }

    /// Runs `f` on every group in registration order, stopping at the first
    /// failure.
    fn fan_out(
        &self,
        op: &str,
        mut f: impl FnMut(&PredicateGroup<D>) -> Result<()>,
    ) -> Result<()> {
        let groups = self.groups()?;
        tracing::debug!(op, groups = groups.len(), "Fanning out to predicate groups");
        for group in &groups {
            if let Err(e) = f(group) {
                tracing::error!(group_id = group.id(), op, error = %e, "Predicate group failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Indexes a new record, or applies `tracker`'s update if it carries one.
    pub fn upsert(
        &self,
        data: &D,
        record_id: RecordId,
        tracker: Option<&mut ChangeTracker<D>>,
    ) -> Result<()> {
        match tracker {
            Some(tracker) if tracker.op() != UpdateOp::Insert => self.update(tracker),
            _ => self.fan_out("upsert", |group| {
                group.execute_and_store(data, record_id, Phase::Insert, None)
            }),
        }
    }

    /// Starts an update of the record `record_id` currently holding `before`.
    ///
    /// The returned tracker owns a copy of `before` and the before keys of
    /// every registered group, so the caller may mutate the record afterwards.
    pub fn begin_update(&self, before: &D, record_id: RecordId) -> Result<ChangeTracker<D>> {
        let mut tracker = ChangeTracker::new();
        self.set_before_data(&mut tracker, before.clone(), record_id)?;
        Ok(tracker)
    }

    pub fn set_before_data(
        &self,
        tracker: &mut ChangeTracker<D>,
        data: D,
        record_id: RecordId,
    ) -> Result<()> {
        tracker.set_before(data, record_id);

        let groups = self.groups.read()?;
        for group in groups.iter() {
            if let Err(e) = group.get_before_keys(tracker) {
                tracing::error!(group_id = group.id(), error = %e, "Capturing before keys failed");
                return Err(e);
            }
        }
        // Groups registered from here on are missing from this tracker
        tracker.mark_captured(groups.last().map_or(0, |group| group.id() + 1));
        Ok(())
    }

    pub fn set_after_data(&self, tracker: &mut ChangeTracker<D>, data: D, record_id: RecordId) {
        tracker.set_after(data, record_id);
    }

    pub fn update(&self, tracker: &mut ChangeTracker<D>) -> Result<()> {
        self.fan_out("update", |group| group.update(tracker))
    }

    pub fn delete(&self, tracker: &mut ChangeTracker<D>) -> Result<()> {
        tracker.set_op(UpdateOp::Delete);
        self.fan_out("delete", |group| group.delete(tracker))
    }

    fn source<K: PsfKey>(&self, psf: &Psf<K>, keys: &[K]) -> Result<ChainSource> {
        let reader: Arc<dyn ChainReader> = self.verify_is_our_psf(psf)?;
        Ok(ChainSource::new(
            reader,
            psf.name.clone(),
            psf.ordinal,
            keys.iter().map(PsfKey::encode).collect(),
        ))
    }

    fn sources<K: PsfKey>(&self, psfs: &[(&Psf<K>, &[K])]) -> Result<Vec<ChainSource>> {
        if psfs.is_empty() {
            return Err(Error::InvalidArgument(
                "query names no predicates".to_string(),
            ));
        }
        psfs.iter().map(|(psf, keys)| self.source(psf, keys)).collect()
    }

    fn prepare(
        &self,
        sources: Vec<Vec<ChainSource>>,
        combinator: Combinator,
        settings: QuerySettings,
    ) -> Query {
        tracing::debug!(
            key_types = sources.len(),
            sub_streams = sources.iter().map(Vec::len).sum::<usize>(),
            "Prepared query"
        );
        Query::new(sources, combinator, settings)
    }

    /// Records for which `psf` returned `key`.
    pub fn query<K: PsfKey>(&self, psf: &Psf<K>, key: &K, settings: QuerySettings) -> Result<Query> {
        self.query_keys(psf, std::slice::from_ref(key), settings)
    }

    /// Records for which `psf` returned any of `keys`.
    pub fn query_keys<K: PsfKey>(
        &self,
        psf: &Psf<K>,
        keys: &[K],
        settings: QuerySettings,
    ) -> Result<Query> {
        let sources = vec![vec![self.source(psf, keys)?]];
        Ok(self.prepare(sources, Arc::new(|m: &[Vec<bool>]| m[0][0]), settings))
    }

    pub fn query2<K1, K2, F>(
        &self,
        psf1: &Psf<K1>,
        keys1: &[K1],
        psf2: &Psf<K2>,
        keys2: &[K2],
        matches: F,
        settings: QuerySettings,
    ) -> Result<Query>
    where
        K1: PsfKey,
        K2: PsfKey,
        F: Fn(bool, bool) -> bool + Send + Sync + 'static,
    {
        let sources = vec![
            vec![self.source(psf1, keys1)?],
            vec![self.source(psf2, keys2)?],
        ];
        let combinator = Arc::new(move |m: &[Vec<bool>]| matches(m[0][0], m[1][0]));
        Ok(self.prepare(sources, combinator, settings))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn query3<K1, K2, K3, F>(
        &self,
        psf1: &Psf<K1>,
        keys1: &[K1],
        psf2: &Psf<K2>,
        keys2: &[K2],
        psf3: &Psf<K3>,
        keys3: &[K3],
        matches: F,
        settings: QuerySettings,
    ) -> Result<Query>
    where
        K1: PsfKey,
        K2: PsfKey,
        K3: PsfKey,
        F: Fn(bool, bool, bool) -> bool + Send + Sync + 'static,
    {
        let sources = vec![
            vec![self.source(psf1, keys1)?],
            vec![self.source(psf2, keys2)?],
            vec![self.source(psf3, keys3)?],
        ];
        let combinator = Arc::new(move |m: &[Vec<bool>]| matches(m[0][0], m[1][0], m[2][0]));
        Ok(self.prepare(sources, combinator, settings))
    }

    /// Any number of predicates of one key type; `matches` gets one
    /// indicator per predicate, in the order given.
    pub fn query_multi<K, F>(
        &self,
        psfs: &[(&Psf<K>, &[K])],
        matches: F,
        settings: QuerySettings,
    ) -> Result<Query>
    where
        K: PsfKey,
        F: Fn(&[bool]) -> bool + Send + Sync + 'static,
    {
        let sources = vec![self.sources(psfs)?];
        let combinator = Arc::new(move |m: &[Vec<bool>]| matches(&m[0]));
        Ok(self.prepare(sources, combinator, settings))
    }

    pub fn query_multi2<K1, K2, F>(
        &self,
        psfs1: &[(&Psf<K1>, &[K1])],
        psfs2: &[(&Psf<K2>, &[K2])],
        matches: F,
        settings: QuerySettings,
    ) -> Result<Query>
    where
        K1: PsfKey,
        K2: PsfKey,
        F: Fn(&[bool], &[bool]) -> bool + Send + Sync + 'static,
    {
        let sources = vec![self.sources(psfs1)?, self.sources(psfs2)?];
        let combinator = Arc::new(move |m: &[Vec<bool>]| matches(&m[0], &m[1]));
        Ok(self.prepare(sources, combinator, settings))
    }

    pub fn query_multi3<K1, K2, K3, F>(
        &self,
        psfs1: &[(&Psf<K1>, &[K1])],
        psfs2: &[(&Psf<K2>, &[K2])],
        psfs3: &[(&Psf<K3>, &[K3])],
        matches: F,
        settings: QuerySettings,
    ) -> Result<Query>
    where
        K1: PsfKey,
        K2: PsfKey,
        K3: PsfKey,
        F: Fn(&[bool], &[bool], &[bool]) -> bool + Send + Sync + 'static,
    {
        let sources = vec![
            self.sources(psfs1)?,
            self.sources(psfs2)?,
            self.sources(psfs3)?,
        ];
        let combinator = Arc::new(move |m: &[Vec<bool>]| matches(&m[0], &m[1], &m[2]));
        Ok(self.prepare(sources, combinator, settings))
    }

    pub fn take_full_checkpoint(&self) -> Result<Option<CheckpointToken>> {
        self.take_checkpoint(CheckpointKind::Full)
    }

    pub fn take_index_checkpoint(&self) -> Result<Option<CheckpointToken>> {
        self.take_checkpoint(CheckpointKind::Index)
    }

    pub fn take_hybrid_log_checkpoint(&self) -> Result<Option<CheckpointToken>> {
        self.take_checkpoint(CheckpointKind::HybridLog)
    }

    /// Starts a checkpoint of every group under one token. Returns `None`
    /// if a checkpoint is already in progress.
    fn take_checkpoint(&self, kind: CheckpointKind) -> Result<Option<CheckpointToken>> {
        let groups = self.groups()?;
        for group in &groups {
            if group.checkpoint_in_progress()? {
                tracing::warn!(group_id = group.id(), ?kind, "Checkpoint already in progress");
                return Ok(None);
            }
        }

        let token = self.next_token();
        for (started, group) in groups.iter().enumerate() {
            let outcome = group.take_checkpoint(kind, token);
            if matches!(outcome, Ok(true)) {
                continue;
            }

            // The token must not be persisted by only some groups
            for group in &groups[..started] {
                if let Err(e) = group.abort_checkpoint(token) {
                    tracing::error!(group_id = group.id(), error = %e, "Checkpoint abort failed");
                }
            }
            return match outcome {
                Err(e) => {
                    tracing::error!(group_id = group.id(), error = %e, "Checkpoint failed to start");
                    Err(e)
                }
                _ => Ok(None),
            };
        }

        tracing::info!(token = %token, ?kind, groups = groups.len(), "Checkpoint started");
        Ok(Some(token))
    }

    /// Tokens are wall-clock nanoseconds, kept strictly increasing.
    fn next_token(&self) -> CheckpointToken {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut last = self.last_token.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self
                .last_token
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return CheckpointToken(next),
                Err(actual) => last = actual,
            }
        }
    }

    /// Persists the checkpoint in progress on every group.
    pub fn complete_checkpoint(&self) -> Result<Option<CheckpointToken>> {
        let mut completed = None;
        self.fan_out("complete_checkpoint", |group| {
            if let Some(token) = group.complete_checkpoint()? {
                completed = Some(token);
            }
            Ok(())
        })?;
        Ok(completed)
    }

    /// Recovers every registered group. All groups must land on the same
    /// checkpoint token.
    pub fn recover(
        &self,
        index_token: Option<CheckpointToken>,
        log_token: Option<CheckpointToken>,
    ) -> Result<Option<CheckpointToken>> {
        let mut recovered: Option<CheckpointToken> = None;
        self.fan_out("recover", |group| {
            let token = group.recover(index_token, log_token)?;
            match recovered {
                Some(expected) if expected != token => Err(Error::CheckpointMismatch(format!(
                    "group {} recovered checkpoint {}, other groups recovered {}",
                    group.id(),
                    token,
                    expected
                ))),
                _ => {
                    recovered = Some(token);
                    Ok(())
                }
            }
        })?;

        if let Some(token) = recovered {
            self.last_token.fetch_max(token.0, Ordering::SeqCst);
            tracing::info!(token = %token, groups = self.group_count(), "Recovered predicate groups");
        }
        Ok(recovered)
    }

    pub fn flush(&self, wait: bool) -> Result<()> {
        self.fan_out("flush", |group| group.flush(wait))
    }

    pub fn flush_and_evict(&self, wait: bool) -> Result<()> {
        self.fan_out("flush_and_evict", |group| group.flush_and_evict(wait))
    }

    pub fn dispose_from_memory(&self) -> Result<()> {
        self.fan_out("dispose_from_memory", |group| group.dispose_from_memory())
    }

    pub fn stats(&self) -> Result<Vec<GroupStats>> {
        self.groups()?.iter().map(|group| group.stats()).collect()
    }
}

impl<D> std::fmt::Debug for PsfManager<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PsfManager")
            .field("dir", &self.config.dir)
            .field("next_group_id", &self.next_group_id.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[derive(Debug, Clone)]
    struct Row {
        id: u32,
        tag: u8,
    }

    fn manager(temp_dir: &TempDir) -> PsfManager<Row> {
        PsfManager::new(PsfConfig::new(temp_dir.path())).expect("Failed to create manager")
    }

    #[test]
    fn test_register_assigns_groups_and_ordinals() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let manager = manager(&temp_dir);

        let single = manager.register_psf("tag", |r: &Row| Some(r.tag)).unwrap();
        let batch = manager
            .register_psfs::<u32>(vec![
                ("even", Box::new(|r: &Row| (r.id % 2 == 0).then_some(r.id)) as PsfFn<Row, u32>),
                ("odd", Box::new(|r: &Row| (r.id % 2 == 1).then_some(r.id)) as PsfFn<Row, u32>),
            ])
            .unwrap();

        assert_eq!(single.group_id(), 0);
        assert_eq!(single.ordinal(), 0);
        assert_eq!(batch[0].group_id(), 1);
        assert_eq!(batch[1].group_id(), 1);
        assert_eq!(batch[1].ordinal(), 1);
        assert_eq!(batch[1].name(), "odd");
        assert_eq!(manager.group_count(), 2);
        assert!(temp_dir.path().join("group-1").exists());
    }

    #[test]
    fn test_registration_errors() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let manager = manager(&temp_dir);
        manager.register_psf("tag", |r: &Row| Some(r.tag)).unwrap();

        let duplicate = manager.register_psf("tag", |r: &Row| Some(r.id));
        assert!(matches!(duplicate, Err(Error::InvalidArgument(_))));

        let in_batch = manager.register_psfs::<u8>(vec![
            ("a", Box::new(|r: &Row| Some(r.tag)) as PsfFn<Row, u8>),
            ("a", Box::new(|r: &Row| Some(r.tag)) as PsfFn<Row, u8>),
        ]);
        assert!(matches!(in_batch, Err(Error::InvalidArgument(_))));

        let empty = manager.register_psfs::<u8>(Vec::new());
        assert!(matches!(empty, Err(Error::InvalidArgument(_))));

        let unnamed = manager.register_psf("", |r: &Row| Some(r.tag));
        assert!(matches!(unnamed, Err(Error::InvalidArgument(_))));

        let oversized = manager.register_psf("blob", |_: &Row| Some([0u8; 300]));
        assert!(matches!(oversized, Err(Error::InvalidArgument(_))));

        // Failed registrations leave no trace
        assert_eq!(manager.group_count(), 1);
        manager.register_psf("a", |r: &Row| Some(r.tag)).unwrap();
    }

    #[test]
    fn test_foreign_psf_rejected() {
        let dir_a = TempDir::new().expect("Failed to create temp dir");
        let dir_b = TempDir::new().expect("Failed to create temp dir");
        let a = manager(&dir_a);
        let b = manager(&dir_b);

        let psf_a = a.register_psf("tag", |r: &Row| Some(r.tag)).unwrap();
        b.register_psf("tag", |r: &Row| Some(r.tag)).unwrap();

        assert!(a.verify_is_our_psf(&psf_a).is_ok());
        assert!(matches!(
            b.verify_is_our_psf(&psf_a),
            Err(Error::InvalidArgument(_))
        ));
        assert!(b.query(&psf_a, &1, QuerySettings::new()).is_err());
    }

    #[test]
    fn test_checkpoint_tokens_increase() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let manager = manager(&temp_dir);
        manager.register_psf("tag", |r: &Row| Some(r.tag)).unwrap();

        let first = manager.take_index_checkpoint().unwrap().unwrap();
        assert_eq!(manager.take_full_checkpoint().unwrap(), None);
        assert_eq!(manager.complete_checkpoint().unwrap(), Some(first));

        let second = manager.take_hybrid_log_checkpoint().unwrap().unwrap();
        assert!(second > first);
        assert_eq!(manager.complete_checkpoint().unwrap(), Some(second));
        assert_eq!(manager.complete_checkpoint().unwrap(), None);
    }

    #[test]
    fn test_failed_checkpoint_start_leaves_no_group_pending() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        {
            let manager = manager(&temp_dir);
            manager.register_psf("tag", |r: &Row| Some(r.tag)).unwrap();
            manager.register_psf("id", |r: &Row| Some(r.id)).unwrap();
            manager.upsert(&Row { id: 1, tag: 2 }, RecordId::new(1, 1), None).unwrap();
            manager.take_full_checkpoint().unwrap().unwrap();
            manager.complete_checkpoint().unwrap();
        }
        // Group 0 loses its checkpoints and starts empty; group 1 awaits recovery
        std::fs::remove_dir_all(temp_dir.path().join("group-0").join("checkpoints")).unwrap();

        let manager = manager(&temp_dir);
        manager.register_psf("tag", |r: &Row| Some(r.tag)).unwrap();
        manager.register_psf("id", |r: &Row| Some(r.id)).unwrap();

        assert!(matches!(
            manager.take_full_checkpoint(),
            Err(Error::InvalidState(_))
        ));
        let groups = manager.groups().unwrap();
        assert!(!groups[0].checkpoint_in_progress().unwrap());
        assert_eq!(manager.complete_checkpoint().unwrap(), None);
    }

    #[test]
    fn test_update_without_before_data_fails() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let manager = manager(&temp_dir);
        manager.register_psf("tag", |r: &Row| Some(r.tag)).unwrap();

        let mut tracker = ChangeTracker::new();
        tracker.set_op(UpdateOp::Ipu);
        assert!(matches!(manager.update(&mut tracker), Err(Error::Internal(_))));
    }
}
