//! Admission middleware.
//!
//! [`RateLimitLayer`] wraps any tower service taking an axum [`Request`]. For
//! each request it derives a key, fetches (or creates) that key's token bucket
//! from the shared [`LimiterStore`], and either forwards the request or
//! answers it with the configured rejection.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::Request;
use axum::response::Response;
use futures::future::{ready, Either, Ready};
use tower::{Layer, Service};
use tracing::{debug, trace};

use super::key::{ClientAddr, KeyExtractor};
use super::reject::{RejectHandler, TooManyRequests};
use crate::error::Result;
use crate::ratelimit::{LimiterStore, Quota, TokenBucket};

/// Builds the limiter for a key seen for the first time, together with how
/// long the store should keep it.
pub trait LimiterFactory: Send + Sync + 'static {
    fn create(&self, req: &Request) -> (TokenBucket, Duration);
}

impl<F> LimiterFactory for F
where
    F: Fn(&Request) -> (TokenBucket, Duration) + Send + Sync + 'static,
{
    fn create(&self, req: &Request) -> (TokenBucket, Duration) {
        self(req)
    }
}

/// Gives every key the same quota, kept for [`Quota::expiry`].
#[derive(Debug, Clone, Copy)]
pub struct QuotaFactory {
    quota: Quota,
}

impl QuotaFactory {
    pub fn new(quota: Quota) -> Self {
        Self { quota }
    }

    pub fn quota(&self) -> Quota {
        self.quota
    }
}

impl LimiterFactory for QuotaFactory {
    fn create(&self, _req: &Request) -> (TokenBucket, Duration) {
        (TokenBucket::new(self.quota), self.quota.expiry())
    }
}

/// Allow `num_requests` every `per` for each caller address.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use turnstile::http::by_addr;
/// # use turnstile::ratelimit::LimiterStore;
/// # async fn run() -> turnstile::error::Result<()> {
/// let store = Arc::new(LimiterStore::with_default_cleanup()?);
/// let router = axum::Router::<()>::new().layer(by_addr(store, 100, Duration::from_secs(60))?);
/// # Ok(())
/// # }
/// ```
pub fn by_addr(
    store: Arc<LimiterStore>,
    num_requests: u32,
    per: Duration,
) -> Result<RateLimitLayer<ClientAddr, QuotaFactory, TooManyRequests>> {
    by_custom_key(store, num_requests, per, ClientAddr::new())
}

/// Allow `num_requests` every `per` for each key produced by `key`.
///
/// Like [`by_addr`], pair it with a store built by
/// [`LimiterStore::with_default_cleanup`] so keys that go quiet are dropped.
pub fn by_custom_key<K: KeyExtractor>(
    store: Arc<LimiterStore>,
    num_requests: u32,
    per: Duration,
    key: K,
) -> Result<RateLimitLayer<K, QuotaFactory, TooManyRequests>> {
    let quota = Quota::new(num_requests, per)?;
    Ok(RateLimitLayer::new(
        store,
        key,
        QuotaFactory::new(quota),
        TooManyRequests,
    ))
}

struct Gate<K, F, R> {
    store: Arc<LimiterStore>,
    key: K,
    factory: F,
    reject: R,
}

impl<K: KeyExtractor, F: LimiterFactory, R: RejectHandler> Gate<K, F, R> {
    fn admit(&self, req: &Request) -> bool {
        let key = self.key.extract(req);
        let limiter = self
            .store
            .get_or_create(&key, || self.factory.create(req));

        let allowed = limiter.allow();
        if allowed {
            trace!(key = %key, "Request admitted");
        } else {
            debug!(
                key = %key,
                method = %req.method(),
                path = req.uri().path(),
                "Rate limit exceeded"
            );
        }
        allowed
    }
}

/// Tower layer applying per-key admission control.
///
/// Cloning the layer is cheap; all clones and the services they produce share
/// one store and one set of strategies.
pub struct RateLimitLayer<K, F, R> {
    gate: Arc<Gate<K, F, R>>,
}

impl<K: KeyExtractor, F: LimiterFactory, R: RejectHandler> RateLimitLayer<K, F, R> {
    /// Create a layer from a store and the three strategies.
    pub fn new(store: Arc<LimiterStore>, key: K, factory: F, reject: R) -> Self {
        Self {
            gate: Arc::new(Gate {
                store,
                key,
                factory,
                reject,
            }),
        }
    }

    /// Run the admission check for `req`, consuming a token when allowed.
    pub fn check(&self, req: &Request) -> bool {
        self.gate.admit(req)
    }

    pub fn store(&self) -> &Arc<LimiterStore> {
        &self.gate.store
    }
}

impl<K, F, R> Clone for RateLimitLayer<K, F, R> {
    fn clone(&self) -> Self {
        Self {
            gate: Arc::clone(&self.gate),
        }
    }
}

impl<S, K, F, R> Layer<S> for RateLimitLayer<K, F, R> {
    type Service = RateLimitService<S, K, F, R>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            gate: Arc::clone(&self.gate),
        }
    }
}

/// Service produced by [`RateLimitLayer`].
pub struct RateLimitService<S, K, F, R> {
    inner: S,
    gate: Arc<Gate<K, F, R>>,
}

impl<S: Clone, K, F, R> Clone for RateLimitService<S, K, F, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            gate: Arc::clone(&self.gate),
        }
    }
}

impl<S, K, F, R> Service<Request> for RateLimitService<S, K, F, R>
where
    S: Service<Request, Response = Response>,
    K: KeyExtractor,
    F: LimiterFactory,
    R: RejectHandler,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Either<S::Future, Ready<std::result::Result<Response, S::Error>>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        if self.gate.admit(&req) {
            Either::Left(self.inner.call(req))
        } else {
            Either::Right(ready(Ok(self.gate.reject.reject(&req))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TurnstileError;
    use crate::http::key::HeaderKey;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{HeaderName, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::advance;
    use tower::ServiceExt;

    fn keyed(client: &str) -> Request {
        axum::http::Request::builder()
            .uri("/")
            .header("x-client", client)
            .body(Body::empty())
            .unwrap()
    }

    fn from_peer(peer: &str) -> Request {
        let mut req = axum::http::Request::builder()
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let addr: SocketAddr = peer.parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        req
    }

    fn client_key() -> HeaderKey {
        HeaderKey::new(HeaderName::from_static("x-client"))
    }

    fn app<L>(layer: L) -> (Router, Arc<AtomicUsize>)
    where
        L: Layer<axum::routing::Route> + Clone + Send + Sync + 'static,
        L::Service: Service<Request, Response = Response, Error = std::convert::Infallible>
            + Clone
            + Send
            + Sync
            + 'static,
        <L::Service as Service<Request>>::Future: Send + 'static,
    {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let router = Router::new()
            .route(
                "/",
                get(move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        "ok"
                    }
                }),
            )
            .layer(layer);
        (router, hits)
    }

    async fn status(router: &Router, req: Request) -> StatusCode {
        router.clone().oneshot(req).await.unwrap().status()
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_per_second_scenario() {
        let store = Arc::new(LimiterStore::with_default_cleanup().unwrap());
        let layer = by_custom_key(store, 3, Duration::from_secs(1), client_key()).unwrap();
        let (router, _) = app(layer);

        let mut statuses = Vec::new();
        for _ in 0..4 {
            statuses.push(status(&router, keyed("A")).await);
        }
        assert_eq!(
            statuses,
            vec![
                StatusCode::OK,
                StatusCode::OK,
                StatusCode::OK,
                StatusCode::TOO_MANY_REQUESTS
            ]
        );

        // B is unaffected by A's exhaustion
        assert_eq!(status(&router, keyed("B")).await, StatusCode::OK);

        advance(Duration::from_secs(1)).await;
        assert_eq!(status(&router, keyed("A")).await, StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_request_skips_handler() {
        let store = Arc::new(LimiterStore::new());
        let layer = by_custom_key(store, 2, Duration::from_secs(60), client_key()).unwrap();
        let (router, hits) = app(layer);

        for _ in 0..5 {
            status(&router, keyed("A")).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_has_empty_body() {
        let store = Arc::new(LimiterStore::with_default_cleanup().unwrap());
        let layer = by_custom_key(store, 1, Duration::from_secs(60), client_key()).unwrap();
        let (router, _) = app(layer);

        status(&router, keyed("A")).await;
        let response = router.clone().oneshot(keyed("A")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_by_addr_keys_on_peer() {
        let store = Arc::new(LimiterStore::with_default_cleanup().unwrap());
        let layer = by_addr(Arc::clone(&store), 1, Duration::from_secs(60)).unwrap();
        let (router, _) = app(layer);

        assert_eq!(status(&router, from_peer("192.0.2.1:1000")).await, StatusCode::OK);
        // Same address, different port
        assert_eq!(
            status(&router, from_peer("192.0.2.1:2000")).await,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(status(&router, from_peer("192.0.2.2:1000")).await, StatusCode::OK);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_presets_reject_invalid_quota() {
        let store = Arc::new(LimiterStore::new());

        let err = by_addr(Arc::clone(&store), 0, Duration::from_secs(1)).err().unwrap();
        assert!(matches!(err, TurnstileError::Config(_)));

        let err = by_custom_key(store, 5, Duration::ZERO, client_key()).err().unwrap();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_general_constructor_with_custom_strategies() {
        let store = Arc::new(LimiterStore::new());
        let factory = |req: &Request| {
            let num_requests = if req.headers().contains_key("x-premium") { 3 } else { 1 };
            let quota = Quota::per_minute(num_requests).unwrap();
            (TokenBucket::new(quota), quota.expiry())
        };
        let reject = |_req: &Request| (StatusCode::IM_A_TEAPOT, "slow down").into_response();
        let layer = RateLimitLayer::new(store, client_key(), factory, reject);
        let (router, _) = app(layer);

        assert_eq!(status(&router, keyed("basic")).await, StatusCode::OK);
        assert_eq!(status(&router, keyed("basic")).await, StatusCode::IM_A_TEAPOT);

        let premium = || {
            let mut req = keyed("premium");
            req.headers_mut()
                .insert("x-premium", axum::http::HeaderValue::from_static("1"));
            req
        };
        for _ in 0..3 {
            assert_eq!(status(&router, premium()).await, StatusCode::OK);
        }
        assert_eq!(status(&router, premium()).await, StatusCode::IM_A_TEAPOT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_resets_budget() {
        let store = Arc::new(LimiterStore::new());
        let factory = |_req: &Request| {
            let quota = Quota::per_hour(2).unwrap();
            (TokenBucket::new(quota), Duration::from_secs(60))
        };
        let layer = RateLimitLayer::new(Arc::clone(&store), client_key(), factory, TooManyRequests);

        assert!(layer.check(&keyed("A")));
        assert!(layer.check(&keyed("A")));
        assert!(!layer.check(&keyed("A")));

        advance(Duration::from_secs(60)).await;
        assert_eq!(store.sweep(), 1);

        // A returns as a new key with a full bucket rather than the
        // fraction of a token an hourly refill would have produced
        assert!(layer.check(&keyed("A")));
        assert!(layer.check(&keyed("A")));
        assert!(!layer.check(&keyed("A")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_use_does_not_extend_ttl() {
        let store = Arc::new(LimiterStore::new());
        let factory = |_req: &Request| {
            let quota = Quota::per_hour(1).unwrap();
            (TokenBucket::new(quota), Duration::from_secs(60))
        };
        let layer = RateLimitLayer::new(store, client_key(), factory, TooManyRequests);

        assert!(layer.check(&keyed("A")));
        for _ in 0..5 {
            advance(Duration::from_secs(10)).await;
            assert!(!layer.check(&keyed("A")));
        }

        // Still throttled and active, yet the entry inserted 60s ago expires
        // and the key is granted a fresh bucket.
        advance(Duration::from_secs(10)).await;
        assert!(layer.check(&keyed("A")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_layers_share_store() {
        let store = Arc::new(LimiterStore::new());
        let first = by_custom_key(Arc::clone(&store), 1, Duration::from_secs(60), client_key())
            .unwrap();
        let second = by_custom_key(Arc::clone(&store), 1, Duration::from_secs(60), client_key())
            .unwrap();

        assert!(first.check(&keyed("A")));
        assert!(!second.check(&keyed("A")));
        assert!(Arc::ptr_eq(first.store(), second.store()));
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_respect_budget() {
        let store = Arc::new(LimiterStore::new());
        let layer = by_custom_key(Arc::clone(&store), 5, Duration::from_secs(3600), client_key())
            .unwrap();
        let (router, hits) = app(layer);

        let mut handles = Vec::new();
        for _ in 0..40 {
            let router = router.clone();
            handles.push(tokio::spawn(async move {
                router.oneshot(keyed("burst")).await.unwrap().status()
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() == StatusCode::OK {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 5);
        assert_eq!(hits.load(Ordering::SeqCst), 5);
        assert_eq!(store.len(), 1);
    }
}
