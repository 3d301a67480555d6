use std::fmt::{self, Display, Formatter};

pub type CResult<T> = Result<T, Error>;

/// Errors raised by the store. `NotFound` and `TxnFull` are the two a caller is
/// expected to branch on; the rest are reported up as opaque failures.
#[derive(Debug)]
pub enum Error {
    /// No value for the given key in the given sub-database.
    NotFound,
    /// A single transaction would exceed an internal size limit. The concrete
    /// log-backed store never raises this itself (it has no fixed per-commit
    /// entry cap), but the variant exists so callers can match on it.
    TxnFull,
    /// The store directory is already locked by another process.
    Locked(String),
    /// The on-disk log is not well-formed (bad frame header/trailer, truncated
    /// entry that doesn't look like an in-progress write).
    Corrupt(String),
    Internal(String),
    Io(std::io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "key not found"),
            Error::TxnFull => write!(f, "transaction exceeds size limit"),
            Error::Locked(path) => write!(f, "store already locked: {}", path),
            Error::Corrupt(msg) => write!(f, "corrupt store: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
            Error::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}
