//! Rate limiting logic and state management.

mod bucket;
mod quota;
mod store;

pub use bucket::TokenBucket;
pub use quota::{Quota, DEFAULT_CLEANUP_INTERVAL, DEFAULT_EXPIRY};
pub use store::LimiterStore;
