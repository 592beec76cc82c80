//! Checkpoint files of a secondary store.
//!
//! ```text
//! <group dir>/checkpoints/<token>/index.bin   chain heads + log tail they cover
//! <group dir>/checkpoints/<token>/log.meta    log begin/tail + session commit points
//! ```
//!
//! Both files are bincode payloads framed with a length and CRC-64.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::encoding::bincode;
use crate::error::Result;
use crate::Error;

const CHECKPOINT_DIR: &str = "checkpoints";
const INDEX_FILE: &str = "index.bin";
const LOG_FILE: &str = "log.meta";

/// Identifies one checkpoint across every group of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CheckpointToken(pub u64);

impl CheckpointToken {
    fn from_dir_name(name: &str) -> Option<Self> {
        u64::from_str_radix(name, 16).ok().map(CheckpointToken)
    }
}

impl fmt::Display for CheckpointToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    Index,
    HybridLog,
    Full,
}

impl CheckpointKind {
    pub fn includes_index(&self) -> bool {
        matches!(self, CheckpointKind::Index | CheckpointKind::Full)
    }

    pub fn includes_log(&self) -> bool {
        matches!(self, CheckpointKind::HybridLog | CheckpointKind::Full)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexCheckpoint {
    pub token: CheckpointToken,
    /// Log tail at capture time; every head points below it.
    pub log_tail: u64,
    pub heads: Vec<(Vec<u8>, u64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogCheckpoint {
    pub token: CheckpointToken,
    pub begin_address: u64,
    pub tail_address: u64,
    pub commit_points: Vec<(u64, u64)>,
}

/// A captured checkpoint waiting for `complete_checkpoint`.
#[derive(Debug)]
pub(crate) struct PendingCheckpoint {
    pub token: CheckpointToken,
    pub index: Option<IndexCheckpoint>,
    pub log: Option<LogCheckpoint>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDir {
    root: PathBuf,
}

impl CheckpointDir {
    pub fn new(store_dir: &Path) -> Self {
        Self {
            root: store_dir.join(CHECKPOINT_DIR),
        }
    }

    fn token_dir(&self, token: CheckpointToken) -> PathBuf {
        self.root.join(token.to_string())
    }

    pub fn write_index(&self, checkpoint: &IndexCheckpoint, sync: bool) -> Result<()> {
        self.write_file(checkpoint.token, INDEX_FILE, checkpoint, sync)
    }

    pub fn write_log(&self, checkpoint: &LogCheckpoint, sync: bool) -> Result<()> {
        self.write_file(checkpoint.token, LOG_FILE, checkpoint, sync)
    }

    pub fn read_index(&self, token: CheckpointToken) -> Result<IndexCheckpoint> {
        self.read_file(token, INDEX_FILE)
    }

    pub fn read_log(&self, token: CheckpointToken) -> Result<LogCheckpoint> {
        self.read_file(token, LOG_FILE)
    }

    /// Newest token that has an index checkpoint.
    pub fn latest_index(&self) -> Result<Option<CheckpointToken>> {
        self.latest_with(INDEX_FILE)
    }

    /// Newest token that has a hybrid-log checkpoint.
    pub fn latest_log(&self) -> Result<Option<CheckpointToken>> {
        self.latest_with(LOG_FILE)
    }

    /// Newest index checkpoint not newer than `bound`.
    pub fn latest_index_before(&self, bound: CheckpointToken) -> Result<Option<CheckpointToken>> {
        Ok(self
            .tokens_with(INDEX_FILE)?
            .into_iter()
            .filter(|token| *token <= bound)
            .max())
    }

    fn latest_with(&self, file: &str) -> Result<Option<CheckpointToken>> {
        Ok(self.tokens_with(file)?.into_iter().max())
    }

    fn tokens_with(&self, file: &str) -> Result<Vec<CheckpointToken>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut tokens = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(token) = name.to_str().and_then(CheckpointToken::from_dir_name) else {
                continue;
            };
            if entry.path().join(file).exists() {
                tokens.push(token);
            }
        }
        Ok(tokens)
    }

    fn write_file<T: Serialize>(
        &self,
        token: CheckpointToken,
        name: &str,
        value: &T,
        sync: bool,
    ) -> Result<()> {
        let dir = self.token_dir(token);
        fs::create_dir_all(&dir)?;

        // Write-then-rename so a torn write never looks like a checkpoint
        let tmp_path = dir.join(format!("{}.tmp", name));
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(&file);
            bincode::serialize_framed(&mut writer, value)?;
            writer.flush()?;
            drop(writer);
            if sync {
                file.sync_all()?;
            }
        }
        fs::rename(&tmp_path, dir.join(name))?;
        Ok(())
    }

    fn read_file<T: for<'a> Deserialize<'a>>(&self, token: CheckpointToken, name: &str) -> Result<T> {
        let path = self.token_dir(token).join(name);
        let file = File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::CheckpointNotFound(format!("{} for token {}", name, token))
            }
            _ => Error::IoError(e),
        })?;
        bincode::deserialize_framed(BufReader::new(file))
    }
}
