use std::fmt::{self, Display, Formatter};

pub type CResult<T> = Result<T, Error>;

/// Error kinds a caller of the public API can see. Kept as an owned,
/// `Clone`-able enum (rather than wrapping `kv::error::Error` by reference) so a
/// poisoned transaction can hand the same error back out of every subsequent
/// call without re-borrowing anything.
#[derive(Debug, Clone)]
pub enum Error {
    /// Caller precondition violated: bad path, wrong state, zero-length name.
    Inval(String),
    /// Requested serial or key absent.
    NotFound,
    /// Space is exhausted and progress requires the external flusher.
    Busy,
    /// Space exhausted even after attempted flush/merge; insertion aborted.
    NoSpace,
    /// On-disk data violates an invariant; not recoverable without operator action.
    Malformed(String),
    /// Persisted version incompatible with this implementation.
    UnsupportedVersion(u32),
    /// Open must be retried after the external flusher persists the zone.
    RetryAfterFlush,
    /// Stored zone name differs from the requested one. Not a failure by itself.
    SemCheck,
    /// Catch-all, propagated from the kv store or the changeset codec.
    Err(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::Inval(msg) => write!(f, "invalid argument: {}", msg),
            Error::NotFound => write!(f, "not found"),
            Error::Busy => write!(f, "busy, flush required"),
            Error::NoSpace => write!(f, "no space left"),
            Error::Malformed(msg) => write!(f, "malformed on-disk data: {}", msg),
            Error::UnsupportedVersion(v) => write!(f, "unsupported journal version {}", v),
            Error::RetryAfterFlush => write!(f, "retry after flush"),
            Error::SemCheck => write!(f, "stored zone name differs from requested"),
            Error::Err(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<kv::error::Error> for Error {
    fn from(err: kv::error::Error) -> Self {
        match err {
            kv::error::Error::NotFound => Error::NotFound,
            other => Error::Err(other.to_string()),
        }
    }
}
