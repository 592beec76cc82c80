//! Query engine: chain walks feeding a cancellable merge-join.

pub mod chain;
pub mod merge;
pub mod settings;

pub use chain::{ChainReader, ChainSource, DeadRecords};
pub use merge::{Combinator, Query, QueryIterator, QuerySegment, QueryStream};
pub use settings::{CancelOnEos, CancelToken, QuerySettings};
