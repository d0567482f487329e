// Admission control for the tailoring endpoint.
// Counters are process-local: a sliding log per key, no external store.

pub mod admission;
pub mod identity;
pub mod limiter;
pub mod quota;
pub mod window;

pub use admission::AdmissionGate;
pub use limiter::{LimitType, RateLimitConfig, RateLimiter};
pub use quota::{GlobalQuotaTracker, QuotaLimits};
pub use window::{Window, WindowLimits};
