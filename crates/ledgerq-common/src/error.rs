use std::io;
use std::sync::Arc;

/// Errors surfaced by LedgerQ's journal and queue primitives.
///
/// `Timeout` is deliberately not a variant here: a `get` that times out is a
/// normal empty result, not a failure, and is represented as `None` by the
/// callers that can time out.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("journal io error: {0}")]
    Io(Arc<io::Error>),

    /// A record failed to decode. `tail` distinguishes a torn write at the
    /// end of the currently-open file (recoverable by truncation) from
    /// corruption found in an already-rotated, closed file (fatal).
    #[error("corrupt journal at {path} offset {offset} (tail={tail}): {reason}")]
    CorruptJournal {
        path: String,
        offset: u64,
        tail: bool,
        reason: String,
    },

    #[error("unknown reader: {0}")]
    UnknownReader(String),

    #[error("unknown item id: {0}")]
    UnknownId(u64),
}

impl Error {
    pub fn corrupt_interior(
        path: impl Into<String>,
        offset: u64,
        reason: impl Into<String>,
    ) -> Self {
        Error::CorruptJournal {
            path: path.into(),
            offset,
            tail: false,
            reason: reason.into(),
        }
    }

    /// Whether this error leaves the journal in a state where a caller might
    /// reasonably retry the operation (as opposed to one that requires
    /// operator intervention).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::CorruptJournal { .. })
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
