//! Per-group secondary store: hybrid log, chain-head index, sessions and
//! checkpoints.

pub mod checkpoint;
pub mod index;
pub mod log;
pub mod record;
pub mod secondary;
pub mod session;

pub use checkpoint::{CheckpointKind, CheckpointToken};
pub use log::PendingRead;
pub use record::LogRecord;
pub use secondary::{ReadStatus, SecondaryStore, StoreStats};
pub use session::{PooledSession, Session, SessionPool};
