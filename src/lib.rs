//! Predicate-based secondary indexes over an append-only log-structured
//! store.
//!
//! Predicates are registered with a [`PsfManager`] in groups; each group
//! keeps its own composite-key secondary store whose chains link every
//! record a predicate maps to the same key. The manager keeps groups in
//! sync with the primary store's inserts, updates and deletes, and answers
//! boolean combinations of predicate queries with a lazy merge-join.

pub mod config;
pub mod encoding;
pub mod error;
pub mod flock;
pub mod hasher;
pub mod primary;
pub mod psf;
pub mod query;
pub mod store;
#[doc(hidden)]
pub mod tmpfs;

pub use config::PsfConfig;
pub use error::{Error, Result};
pub use hasher::Hasher;
pub use primary::{PrimaryStore, ProviderData};
pub use psf::{ChangeTracker, Psf, PsfFn, PsfKey, PsfManager, RecordId, UpdateOp};
pub use query::{CancelToken, Query, QueryIterator, QuerySegment, QuerySettings, QueryStream};
pub use store::CheckpointToken;
