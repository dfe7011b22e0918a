use std::fmt;

use backtrace::Backtrace;

/// The taxonomy of errors the storage core can surface. Every fallible
/// operation returns one of these, never a bare string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A requested table, record, or page does not exist.
    NotFound,
    /// A value's runtime variant does not match the column/operation it
    /// was used with.
    TypeMismatch,
    /// The lock manager could not grant a lock under its no-wait policy.
    LockConflict,
    /// An operation was attempted in a state that does not allow it
    /// (e.g. committing a transaction twice).
    InvalidState,
    /// The WAL could not be parsed during recovery.
    CorruptLog,
    /// A page's on-disk layout failed validation.
    CorruptPage,
    /// The underlying filesystem returned an error.
    IoError,
    /// An invariant the engine depends on was violated (buffer pool
    /// exhaustion, an invalid frame state). Not expected to be handled
    /// by callers.
    Fatal,
}

pub struct SmallError {
    kind: ErrorKind,
    details: String,
    backtrace: Option<Backtrace>,
}

impl SmallError {
    pub fn new(msg: &str) -> SmallError {
        Self::with_kind(ErrorKind::InvalidState, msg)
    }

    pub fn with_kind(kind: ErrorKind, msg: &str) -> SmallError {
        let backtrace = match kind {
            ErrorKind::Fatal => Some(Backtrace::new()),
            _ => None,
        };

        SmallError {
            kind,
            details: msg.to_string(),
            backtrace,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn show_backtrace(&self) {
        if let Some(bt) = &self.backtrace {
            log::error!("{}\n{:?}", self.details, bt);
        } else {
            log::error!("{}", self.details);
        }
    }
}

impl From<std::io::Error> for SmallError {
    fn from(e: std::io::Error) -> Self {
        SmallError::with_kind(ErrorKind::IoError, &e.to_string())
    }
}

impl fmt::Display for SmallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.details)
    }
}

impl fmt::Debug for SmallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::error::Error for SmallError {}
