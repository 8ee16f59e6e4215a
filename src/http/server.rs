//! HTTP server wiring the rate limit layer in front of a small router.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::key::{ClientAddr, HeaderKey};
use super::layer::{QuotaFactory, RateLimitLayer};
use super::reject::TooManyRequests;
use crate::config::{KeyStrategy, TurnstileConfig};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::LimiterStore;

/// HTTP server whose every route is behind per-key admission control.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    router: Router,
}

impl HttpServer {
    /// Create a server from an already layered router.
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Build the router described by `config`, limiting with `store`.
    ///
    /// Invalid quotas or key settings fail here, before anything is bound.
    pub fn from_config(config: &TurnstileConfig, store: Arc<LimiterStore>) -> Result<Self> {
        let limits = &config.rate_limiting;
        let factory = QuotaFactory::new(limits.quota()?);

        let router = match limits.key {
            KeyStrategy::ClientAddr => routes().layer(RateLimitLayer::new(
                store,
                ClientAddr::new(),
                factory,
                TooManyRequests,
            )),
            KeyStrategy::PeerAddr => routes().layer(RateLimitLayer::new(
                store,
                ClientAddr::direct(),
                factory,
                TooManyRequests,
            )),
            KeyStrategy::Header => routes().layer(RateLimitLayer::new(
                store,
                HeaderKey::new(limits.header_name()?),
                factory,
                TooManyRequests,
            )),
        };

        info!(
            num_requests = factory.quota().num_requests(),
            per_ms = factory.quota().per().as_millis() as u64,
            key = ?limits.key,
            "Rate limit layer configured"
        );

        Ok(Self::new(config.server.addr, router))
    }

    /// Serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }
}

fn routes() -> Router {
    Router::new()
        .route("/", get(|| async { "ok" }))
        .route("/health", get(health_handler))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
