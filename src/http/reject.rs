//! Responses for denied requests.

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Builds the response returned in place of a denied request.
///
/// The inner service is never invoked for a rejected request.
pub trait RejectHandler: Send + Sync + 'static {
    fn reject(&self, req: &Request) -> Response;
}

impl<F> RejectHandler for F
where
    F: Fn(&Request) -> Response + Send + Sync + 'static,
{
    fn reject(&self, req: &Request) -> Response {
        self(req)
    }
}

/// Rejects with an empty `429 Too Many Requests`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TooManyRequests;

impl RejectHandler for TooManyRequests {
    fn reject(&self, _req: &Request) -> Response {
        StatusCode::TOO_MANY_REQUESTS.into_response()
    }
}
