//! Turnstile - Per-Key Request Admission Control
//!
//! This crate decides, for every incoming HTTP request, whether the entity
//! identified by a request-derived key still has budget left. Each key owns a
//! token bucket kept in an expiring in-process store, and a tower middleware
//! rejects requests with `429 Too Many Requests` once a bucket runs dry.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
