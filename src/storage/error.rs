/// Storage-level error with retry classification.
///
/// Backends return this to tell the engine whether an operation is worth
/// retrying. Etag mismatches (optimistic-concurrency contention) are
/// retryable conflicts; duplicate-key inserts are permanent conflicts that
/// the client layer maps to `AlreadyExists`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageError {
    /// Operation that failed (e.g. "update_workflow", "poll_due").
    pub operation: String,
    pub message: String,
    pub retryable: bool,
    /// True when the failure was a version or key conflict rather than an
    /// infrastructure fault.
    pub conflict: bool,
}

impl StorageError {
    /// Transient fault: timeouts, busy backends, exhausted lock retries.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
            conflict: false,
        }
    }

    /// Permanent fault: corruption, invalid input, missing records.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
            conflict: false,
        }
    }

    /// Etag mismatch. Retryable: another writer won, the caller should
    /// reload and reapply a bounded number of times.
    pub fn contention(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
            conflict: true,
        }
    }

    /// Insert hit an existing key. Not retryable; the record is already there.
    pub fn already_exists(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
            conflict: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn is_conflict(&self) -> bool {
        self.conflict
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for StorageError {}
