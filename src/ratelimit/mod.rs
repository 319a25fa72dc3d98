//! Rate limiting over the shared store.

mod limiter;
mod rules;

pub use limiter::{PermitDecision, RateLimiter, SLIDING_WINDOW_EXPIRY_MARGIN};
pub use rules::{Algorithm, RateLimiterConfig};
