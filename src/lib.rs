#![forbid(unsafe_code)]

//! # cloudpace
//!
//! Client-side request pacing for cloud REST API SDKs: quota bookkeeping that keeps a client
//! inside the upstream's published rate limits, and cursor pagination for list endpoints.
//!
//! ## Features
//!
//! - **Quota rules** scoped by HTTP method, URL pattern and caller category
//! - **Per-resource buckets** keyed by path placeholders or query parameters
//! - **Global and per-credential counters** evaluated together
//! - **Tower middleware** that fails fast or waits out exhausted quotas
//! - **Immutable page walkers** threading continuation cursors between calls
//!
//! ## Quick Start
//!
//! ```rust
//! use cloudpace::{QuotaLimiter, QuotaRuleTable, SubjectCategory};
//! use http::Method;
//!
//! let limiter = QuotaLimiter::new(QuotaRuleTable::open_cloud());
//! let key = limiter.register_subject(SubjectCategory::Authenticated);
//!
//! let url = "/messaging-service/v1/universes/42/topics/news";
//! if limiter.is_request_allowed(&Method::POST, url, Some(key)) {
//!     // send the request, then record it
//!     limiter.increment(&Method::POST, url, Some(key));
//! }
//! ```

pub mod clock;
pub mod error;
pub mod pagination;
pub mod prelude;
pub mod rate_limit;
pub mod sleeper;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ClientError, PaginationError, RuleError};
pub use pagination::{PageFetcher, PageWalker, PageWalkerBuilder};
pub use rate_limit::{
    CancelHandle, ClassSet, Decision, LimitationClass, MethodSet, QuotaLayer, QuotaLimiter,
    QuotaRule, QuotaRuleTable, QuotaService, SubjectCategory, SubjectId, ThrottleMode,
};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
