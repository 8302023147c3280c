//! HTTP intake: auth, parsing, suppression, rate limiting, admission.

pub mod ratelimit;
pub mod server;
pub mod suppress;

pub use ratelimit::RateLimiter;
pub use server::{build_router, IntakeState};
pub use suppress::SuppressionMap;
