use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    /// Registration-time validation failure (duplicate name, empty definition, bad key layout).
    InvalidArgument(String),
    /// A logical address outside the log's `[begin, tail)` range.
    InvalidAddress(u64),
    InvalidHeader,
    ChecksumMismatch,
    CorruptedRecord(String),
    MutexPoisoned,
    InvalidState(String),
    InvalidOperation(String),
    CheckpointNotFound(String),
    CheckpointMismatch(String),
    /// Integration error: a hook was invoked where it is never valid.
    Internal(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::InvalidAddress(address) => write!(f, "Invalid log address: {}", address),
            Error::InvalidHeader => write!(f, "Invalid header"),
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::CorruptedRecord(msg) => write!(f, "Corrupted record: {}", msg),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::CheckpointNotFound(msg) => write!(f, "Checkpoint not found: {}", msg),
            Error::CheckpointMismatch(msg) => write!(f, "Checkpoint mismatch: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            _ => None,
        }
    }
}
