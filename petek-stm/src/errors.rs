//! Transaction errors.

use core::fmt;

/// Why a transaction attempt must be retried.
///
/// Every kind is handled the same way (abort, roll back, re-run), but the
/// distinction helps diagnostics: a `Locked` or `Stale` conflict is transient
/// contention, while `Truncated` means a reader outlived the retained
/// history of a multi-version variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// The variable's lock stripe is held by another transaction.
    Locked,
    /// A newer version was committed after this transaction began.
    Stale,
    /// No version at or below the read timestamp is retained.
    Truncated,
    /// This transaction was forcibly aborted by an older writer.
    Wounded,
}

/// Error raised by transactional operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StmError {
    /// The attempt conflicted and must be retried. `atomically` catches this
    /// and re-runs the closure; it never escapes to the caller.
    Conflict(ConflictKind),
}

/// Result of a transactional operation.
pub type StmResult<T> = Result<T, StmError>;

impl fmt::Display for StmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StmError::Conflict(ConflictKind::Locked) => {
                write!(f, "conflict: variable locked by another transaction")
            }
            StmError::Conflict(ConflictKind::Stale) => {
                write!(f, "conflict: a newer version was committed concurrently")
            }
            StmError::Conflict(ConflictKind::Truncated) => {
                write!(f, "conflict: no visible version retained for this read timestamp")
            }
            StmError::Conflict(ConflictKind::Wounded) => {
                write!(f, "conflict: transaction was wounded by an older writer")
            }
        }
    }
}

impl std::error::Error for StmError {}
