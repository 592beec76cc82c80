use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use super::checkpoint::{
    CheckpointDir, CheckpointKind, CheckpointToken, IndexCheckpoint, LogCheckpoint,
    PendingCheckpoint,
};
use super::index::HashIndex;
use super::log::{HybridLog, PendingRead, LOG_BEGIN_ADDRESS};
use super::record::LogRecord;
use super::session::{PooledSession, Session, SessionPool};
use crate::config::PsfConfig;
use crate::error::Result;
use crate::flock::FileLock;
use crate::psf::{CompositeKey, RecordId, INVALID_ADDRESS};
use crate::Error;

const LOCK_FILE: &str = "psf.lock";

/// Outcome of reading one log address.
#[derive(Debug)]
pub enum ReadStatus {
    Found(LogRecord),
    NotFound,
    /// The record was evicted; complete the read before using it.
    Pending(PendingRead),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub begin_address: u64,
    pub head_address: u64,
    pub tail_address: u64,
    pub resident_bytes: usize,
    pub chains: usize,
    pub idle_sessions: usize,
    pub last_checkpoint: Option<CheckpointToken>,
}

/// Composite-key store of one predicate group: an append-only log of
/// records plus the chain-head index over it.
#[derive(Debug)]
pub struct SecondaryStore {
    dir: PathBuf,
    _lock: FileLock,
    log: RwLock<HybridLog>,
    index: HashIndex,
    sessions: SessionPool,
    checkpoints: CheckpointDir,
    pending_checkpoint: Mutex<Option<PendingCheckpoint>>,
    last_checkpoint: Mutex<Option<CheckpointToken>>,
    /// Set while `dir` holds a checkpointed log that has not been recovered.
    awaiting_recovery: AtomicBool,
    log_memory_size: usize,
    sync_on_checkpoint: bool,
}

impl SecondaryStore {
    pub fn open(dir: &Path, config: &PsfConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let lock = FileLock::lock(dir.join(LOCK_FILE))?;
        let mut log = HybridLog::open(dir)?;
        let checkpoints = CheckpointDir::new(dir);

        let awaiting_recovery = checkpoints.latest_log()?.is_some();
        if !awaiting_recovery && log.file_len()? > LOG_BEGIN_ADDRESS {
            // Nothing of it was committed by a log checkpoint
            tracing::warn!(dir = %dir.display(), "Discarding log without a checkpoint");
            log.restore(LOG_BEGIN_ADDRESS, LOG_BEGIN_ADDRESS)?;
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            log: RwLock::new(log),
            index: HashIndex::new(),
            sessions: SessionPool::new(config.session_pool_size),
            checkpoints,
            pending_checkpoint: Mutex::new(None),
            last_checkpoint: Mutex::new(None),
            awaiting_recovery: AtomicBool::new(awaiting_recovery),
            log_memory_size: config.log_memory_size,
            sync_on_checkpoint: config.sync_on_checkpoint,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn session(&self) -> Result<PooledSession<'_>> {
        self.sessions.acquire()
    }

    pub fn sessions(&self) -> &SessionPool {
        &self.sessions
    }

    /// Whether the directory holds checkpointed data that [`Self::recover`]
    /// has to restore before the store accepts writes or checkpoints.
    pub fn awaiting_recovery(&self) -> bool {
        self.awaiting_recovery.load(Ordering::Acquire)
    }

    fn check_recovered(&self) -> Result<()> {
        if self.awaiting_recovery() {
            return Err(Error::InvalidState(format!(
                "{} holds checkpointed data; recover before writing",
                self.dir.display()
            )));
        }
        Ok(())
    }

    /// Appends `key -> record_id` and makes the record the head of every
    /// chain its non-null slots belong to. Returns the record's address.
    pub fn upsert(
        &self,
        session: &mut Session,
        key: &CompositeKey,
        record_id: RecordId,
        tombstone: bool,
    ) -> Result<u64> {
        let mut log = self.log.write()?;
        self.check_recovered()?;

        let mut stored = key.clone();
        for kp in stored.pointers.iter_mut() {
            if let Some(chain_key) = kp.chain_key() {
                kp.previous_address = self.index.head(&chain_key);
            }
        }

        let bytes = LogRecord::new(record_id, stored.clone(), tombstone).encode()?;
        let address = log.append(&bytes);

        for kp in &stored.pointers {
            if let Some(chain_key) = kp.chain_key() {
                self.index.set_head(chain_key, address);
            }
        }
        session.complete_op();

        if log.resident_bytes() > self.log_memory_size {
            log.evict()?;
            tracing::debug!(
                dir = %self.dir.display(),
                head_address = log.head_address(),
                "Evicted resident log region"
            );
        }

        Ok(address)
    }

    pub fn chain_head(&self, chain_key: &[u8]) -> u64 {
        self.index.head(chain_key)
    }

    pub fn read(&self, session: &mut Session, address: u64) -> Result<ReadStatus> {
        if address == INVALID_ADDRESS {
            return Ok(ReadStatus::NotFound);
        }
        let log = self.log.read()?;
        match log.resident(address)? {
            Some(bytes) => Ok(ReadStatus::Found(LogRecord::decode(bytes)?)),
            None => {
                session.record_pending();
                Ok(ReadStatus::Pending(log.pending_read(address)))
            }
        }
    }

    pub fn flush(&self, wait: bool) -> Result<u64> {
        self.log.write()?.flush(wait)
    }

    pub fn flush_and_evict(&self, wait: bool) -> Result<()> {
        let mut log = self.log.write()?;
        log.flush(wait)?;
        log.evict()
    }

    pub fn dispose_from_memory(&self) -> Result<()> {
        self.log.write()?.evict()
    }

    /// Captures a checkpoint. Returns `false` if one is already in progress.
    pub fn take_checkpoint(&self, kind: CheckpointKind, token: CheckpointToken) -> Result<bool> {
        self.check_recovered()?;
        let mut pending = self.pending_checkpoint.lock()?;
        if let Some(current) = pending.as_ref() {
            tracing::warn!(
                dir = %self.dir.display(),
                in_progress = %current.token,
                "Checkpoint already in progress"
            );
            return Ok(false);
        }

        // Writers hold the write lock across append + relink, so heads and tail agree
        let log = self.log.read()?;
        let index = kind.includes_index().then(|| IndexCheckpoint {
            token,
            log_tail: log.tail_address(),
            heads: self.index.snapshot(),
        });
        let log_checkpoint = if kind.includes_log() {
            Some(LogCheckpoint {
                token,
                begin_address: log.begin_address(),
                tail_address: log.tail_address(),
                commit_points: self.sessions.commit_points()?,
            })
        } else {
            None
        };

        *pending = Some(PendingCheckpoint {
            token,
            index,
            log: log_checkpoint,
        });
        Ok(true)
    }

    /// Drops the captured checkpoint `token` without persisting it.
    pub fn abort_checkpoint(&self, token: CheckpointToken) -> Result<()> {
        let mut pending = self.pending_checkpoint.lock()?;
        if pending.as_ref().is_some_and(|p| p.token == token) {
            *pending = None;
            tracing::debug!(dir = %self.dir.display(), token = %token, "Checkpoint aborted");
        }
        Ok(())
    }

    pub fn checkpoint_in_progress(&self) -> Result<bool> {
        Ok(self.pending_checkpoint.lock()?.is_some())
    }

    /// Persists the captured checkpoint, if any, and returns its token.
    pub fn complete_checkpoint(&self) -> Result<Option<CheckpointToken>> {
        let mut guard = self.pending_checkpoint.lock()?;
        let Some(pending) = guard.as_ref() else {
            return Ok(None);
        };

        if pending.log.is_some() {
            self.log.write()?.flush(self.sync_on_checkpoint)?;
        }
        if let Some(index) = &pending.index {
            self.checkpoints.write_index(index, self.sync_on_checkpoint)?;
        }
        if let Some(log) = &pending.log {
            self.checkpoints.write_log(log, self.sync_on_checkpoint)?;
        }

        let token = pending.token;
        *guard = None;
        *self.last_checkpoint.lock()? = Some(token);
        tracing::info!(dir = %self.dir.display(), token = %token, "Checkpoint completed");
        Ok(Some(token))
    }

    /// Restores the store from checkpoints; `None` selects the latest. The
    /// index checkpoint defaults to the newest one not newer than the log
    /// checkpoint; chains appended after it are rebuilt from the log.
    pub fn recover(
        &self,
        index_token: Option<CheckpointToken>,
        log_token: Option<CheckpointToken>,
    ) -> Result<CheckpointToken> {
        let mut log = self.log.write()?;
        if !log.is_empty() {
            return Err(Error::InvalidState(
                "recovery requires a store without writes".to_string(),
            ));
        }

        let log_token = match log_token {
            Some(token) => token,
            None => self.checkpoints.latest_log()?.ok_or_else(|| {
                Error::CheckpointNotFound(format!("no log checkpoint in {}", self.dir.display()))
            })?,
        };
        let log_checkpoint = self.checkpoints.read_log(log_token)?;
        let index_token = match index_token {
            Some(token) => Some(token),
            None => self.checkpoints.latest_index_before(log_token)?,
        };

        let (heads, replay_from) = match index_token {
            Some(token) => {
                let index = self.checkpoints.read_index(token)?;
                if index.log_tail > log_checkpoint.tail_address {
                    return Err(Error::CheckpointMismatch(format!(
                        "index checkpoint {} covers log up to {}, past log checkpoint {} tail {}",
                        token, index.log_tail, log_token, log_checkpoint.tail_address
                    )));
                }
                (index.heads, index.log_tail)
            }
            None => (Vec::new(), log_checkpoint.begin_address),
        };

        log.restore(log_checkpoint.begin_address, log_checkpoint.tail_address)?;
        self.index.restore(heads);

        let replayed = log.scan_disk(replay_from, log_checkpoint.tail_address)?;
        let replayed_count = replayed.len();
        for (address, record) in replayed {
            for kp in &record.key.pointers {
                if let Some(chain_key) = kp.chain_key() {
                    self.index.set_head(chain_key, address);
                }
            }
        }

        self.sessions
            .restore_commit_points(&log_checkpoint.commit_points)?;
        *self.last_checkpoint.lock()? = Some(log_token);
        self.awaiting_recovery.store(false, Ordering::Release);

        tracing::info!(
            dir = %self.dir.display(),
            log_token = %log_token,
            index_token = ?index_token.map(|t| t.to_string()),
            replayed = replayed_count,
            "Secondary store recovered"
        );
        Ok(log_token)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let log = self.log.read()?;
        Ok(StoreStats {
            begin_address: log.begin_address(),
            head_address: log.head_address(),
            tail_address: log.tail_address(),
            resident_bytes: log.resident_bytes(),
            chains: self.index.len(),
            idle_sessions: self.sessions.idle_count(),
            last_checkpoint: *self.last_checkpoint.lock()?,
        })
    }
}
