//! Convenient re-exports for common cloudpace types.
pub use crate::{
    clock::{Clock, SystemClock},
    error::{ClientError, PaginationError},
    pagination::{PageFetcher, PageWalker},
    rate_limit::{
        CancelHandle, Decision, QuotaLayer, QuotaLimiter, QuotaRuleTable, SubjectCategory,
        SubjectId, ThrottleMode,
    },
};
