//! Client-side quota coordination.
//!
//! This module provides the building blocks for staying inside externally imposed limits:
//! - [`QuotaRuleTable`]: the static list of limits, each scoped by method, URL pattern and
//!   caller category.
//! - [`QuotaLimiter`]: tracks counters per subject and decides whether a request may go out.
//! - [`QuotaLayer`]: Tower middleware that asks the limiter before every request and records
//!   usage after every response.
//!
//! # Architecture
//!
//! - **Rules** (`rule`, `pattern`): immutable description of the upstream limits.
//! - **State** (`store`): subjects and their windowed counters, purged lazily.
//! - **Logic** (`limiter`): request matching, availability and retry-time computation.
//! - **Middleware** (`middleware`): fail-fast or wait-and-retry behavior on exhaustion.

pub mod limiter;
pub mod middleware;
pub mod pattern;
pub mod rule;
pub mod store;

pub use limiter::{QuotaLimiter, QuotaLimiterBuilder};
pub use middleware::{CancelHandle, QuotaLayer, QuotaService, ThrottleMode};
pub use pattern::{PatternMatch, UrlPattern};
pub use rule::{ClassSet, LimitationClass, MethodSet, QuotaRule, QuotaRuleTable};
pub use store::{QuotaCounter, SubjectCategory, SubjectId};

/// The decision returned by [`QuotaLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Every matching quota has room left.
    Allowed,
    /// At least one matching quota is exhausted.
    Denied {
        /// Epoch millis after which all exhausted quotas have cleared. `None` when an
        /// exhausted rule allows zero requests and therefore never clears.
        retry_at: Option<u64>,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}
