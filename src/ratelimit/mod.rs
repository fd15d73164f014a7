pub mod limiter;

pub use limiter::{LimitAction, RateDecision, RateLimiter};
