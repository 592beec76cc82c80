//! Predicate-based secondary indexing: predicate definitions, composite
//! keys, per-update change tracking, predicate groups and the manager that
//! fans operations out to them.

pub mod change_tracker;
pub mod composite;
pub mod group;
pub mod key;
pub mod manager;
pub mod record_id;

pub use change_tracker::{BeforeKeys, ChangeTracker, GroupKeys, Phase, UpdateOp};
pub use composite::{chain_key, CompositeKey, KeyPointer};
pub use group::{GroupStats, PredicateGroup};
pub use key::{KeyKind, Psf, PsfKey, MAX_KEY_SIZE};
pub use manager::{PsfFn, PsfManager, MAX_PSFS_PER_GROUP};
pub use record_id::{RecordId, INVALID_ADDRESS};
