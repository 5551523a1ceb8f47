/// Category of a store error. Lets the engine decide between retrying
/// with backoff and failing the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connectivity, auth refresh or timeout. Retried with backoff.
    Unavailable,
    /// The remote API throttled the call. Retried with backoff.
    RateLimited,
    /// Credentials lack access to the spreadsheet. Fatal.
    PermissionDenied,
    /// Hard quota exhausted (not per-minute throttling). Fatal.
    QuotaExceeded,
    /// The request itself is wrong (missing spreadsheet, bad range). Fatal.
    Rejected,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Unavailable | ErrorKind::RateLimited)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Unavailable => f.write_str("StoreUnavailable"),
            ErrorKind::RateLimited => f.write_str("StoreRateLimited"),
            ErrorKind::PermissionDenied => f.write_str("StorePermissionDenied"),
            ErrorKind::QuotaExceeded => f.write_str("StoreQuotaExceeded"),
            ErrorKind::Rejected => f.write_str("StoreRejected"),
        }
    }
}

/// Unified error type for all `TabularStore` methods.
///
/// Carries an `ErrorKind` for retry classification and a human-readable
/// message. `From` impls assign the kind automatically so adapters can use `?`.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreError {
    kind: ErrorKind,
    message: String,
}

impl StoreError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, msg)
    }

    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, msg)
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, msg)
    }

    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::QuotaExceeded, msg)
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Rejected, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Add context to the error, preserving the original kind.
    ///
    /// Produces: `"context: original message"`.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }
}

impl std::fmt::Debug for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StoreError {}
