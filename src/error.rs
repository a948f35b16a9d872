//! Error types for quota enforcement, rule loading and pagination
use std::fmt;

/// Error returned by the throttling transport layer.
#[derive(Debug, Clone)]
pub enum ClientError<E> {
    /// A matching quota is exhausted and the caller is not configured to wait it out.
    ///
    /// `retry_at` is the epoch-millisecond instant after which every exhausted quota has
    /// cleared. `None` means no recovery time is defined (a zero-count rule matched).
    QuotaExceeded { retry_at: Option<u64> },
    /// Waiting for quota recovery was cancelled through a [`CancelHandle`](crate::CancelHandle).
    Cancelled,
    /// The underlying transport failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ClientError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuotaExceeded { retry_at: Some(at) } => {
                write!(f, "quota exceeded; retry after {} ms since epoch", at)
            }
            Self::QuotaExceeded { retry_at: None } => {
                write!(f, "quota exceeded; no recovery time is defined")
            }
            Self::Cancelled => write!(f, "wait for quota recovery was cancelled"),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ClientError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> ClientError<E> {
    /// Check if this error is a quota rejection
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
    /// Check if the wait was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
    /// Recovery instant carried by a quota rejection. The outer `Option` is `None` for other
    /// variants.
    pub fn retry_at(&self) -> Option<Option<u64>> {
        match self {
            Self::QuotaExceeded { retry_at } => Some(*retry_at),
            _ => None,
        }
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors raised while stepping through a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaginationError<E> {
    /// No continuation cursor is available past `page_number`.
    #[error("no further page after page {page_number}")]
    Exhausted { page_number: usize },
    /// `get_previous_page` was called on a walker built without a previous-parameters function.
    #[error("walker has no previous-page function")]
    NoPreviousPage,
    /// The page fetch itself failed.
    #[error("page fetch failed: {0}")]
    Fetch(E),
}

impl<E> PaginationError<E> {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Errors produced while loading a quota rule table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("unknown http method `{0}`")]
    UnknownMethod(String),
    #[error("unknown limitation class `{0}`")]
    UnknownLimitation(String),
    #[error("invalid url pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("rule {index} must list at least one method and one limitation class")]
    EmptyRule { index: usize },
    #[error("rule {index} has a zero-length window")]
    ZeroWindow { index: usize },
    #[error("malformed rule table: {0}")]
    Json(String),
}

impl From<serde_json::Error> for RuleError {
    fn from(e: serde_json::Error) -> Self {
        RuleError::Json(e.to_string())
    }
}
