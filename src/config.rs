use std::path::PathBuf;

/// Configuration for a PSF manager and the secondary stores of its groups
#[derive(Debug, Clone)]
pub struct PsfConfig {
    /// Root directory; each predicate group lives in `<dir>/group-<id>`
    pub dir: PathBuf,

    /// Maximum number of idle sessions kept per group (default: 16)
    pub session_pool_size: usize,

    /// Resident log bytes per group before the log is flushed and evicted (default: 64MB)
    pub log_memory_size: usize,

    /// fsync checkpoint files and the log on checkpoint completion (default: true)
    pub sync_on_checkpoint: bool,
}

impl Default for PsfConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./psfdb"),
            session_pool_size: 16,
            log_memory_size: 64 * 1024 * 1024, // 64MB
            sync_on_checkpoint: true,
        }
    }
}

impl PsfConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the per-group session pool size
    pub fn session_pool_size(mut self, size: usize) -> Self {
        self.session_pool_size = size;
        self
    }

    /// Set the resident log budget per group
    pub fn log_memory_size(mut self, size: usize) -> Self {
        self.log_memory_size = size;
        self
    }

    /// Enable or disable fsync on checkpoint completion
    pub fn sync_on_checkpoint(mut self, enabled: bool) -> Self {
        self.sync_on_checkpoint = enabled;
        self
    }

    /// Directory of the secondary store for `group_id`
    pub fn group_dir(&self, group_id: u64) -> PathBuf {
        self.dir.join(format!("group-{}", group_id))
    }
}
