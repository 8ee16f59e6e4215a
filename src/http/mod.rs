//! HTTP admission middleware and server.

mod key;
mod layer;
mod reject;
mod server;

pub use key::{ClientAddr, HeaderKey, KeyExtractor, UNKNOWN_CLIENT};
pub use layer::{
    by_addr, by_custom_key, LimiterFactory, QuotaFactory, RateLimitLayer, RateLimitService,
};
pub use reject::{RejectHandler, TooManyRequests};
pub use server::HttpServer;
