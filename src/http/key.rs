//! Key derivation strategies.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderName;

/// Key used when a request carries no usable address.
pub const UNKNOWN_CLIENT: &str = "unknown";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Derives the rate limit key for a request.
///
/// Requests that map to the same key share one budget.
pub trait KeyExtractor: Send + Sync + 'static {
    fn extract(&self, req: &Request) -> String;
}

impl<F> KeyExtractor for F
where
    F: Fn(&Request) -> String + Send + Sync + 'static,
{
    fn extract(&self, req: &Request) -> String {
        self(req)
    }
}

/// Keys requests by the caller's network address.
///
/// By default the leftmost entry of `X-Forwarded-For` wins, then
/// `X-Real-IP`, then the socket peer recorded by axum's
/// [`ConnectInfo<SocketAddr>`](ConnectInfo). An `X-Forwarded-For` header with
/// any entry that is not an IP address is ignored as a whole. Only trust
/// forwarded headers when a proxy you control sets them.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr {
    trust_forwarded: bool,
}

impl ClientAddr {
    pub fn new() -> Self {
        Self {
            trust_forwarded: true,
        }
    }

    /// Ignore forwarding headers and key by the socket peer only.
    pub fn direct() -> Self {
        Self {
            trust_forwarded: false,
        }
    }

    /// Resolve the caller address, if the request carries one.
    pub fn resolve(&self, req: &Request) -> Option<IpAddr> {
        if self.trust_forwarded {
            if let Some(ip) = forwarded_for(req).or_else(|| real_ip(req)) {
                return Some(ip);
            }
        }
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    }
}

impl Default for ClientAddr {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyExtractor for ClientAddr {
    fn extract(&self, req: &Request) -> String {
        self.resolve(req)
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }
}

/// Leftmost address of `X-Forwarded-For`, or `None` if any entry is malformed.
fn forwarded_for(req: &Request) -> Option<IpAddr> {
    let value = req.headers().get(X_FORWARDED_FOR)?.to_str().ok()?;
    let mut hops = value.split(',').map(|hop| hop.trim().parse::<IpAddr>());
    let client = hops.next()?.ok()?;
    // A single unparsable hop makes the whole chain untrustworthy
    hops.all(|hop| hop.is_ok()).then_some(client)
}

fn real_ip(req: &Request) -> Option<IpAddr> {
    req.headers()
        .get(X_REAL_IP)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Keys requests by a header value such as an API token, falling back to
/// the caller address when the header is absent or not valid text.
#[derive(Debug, Clone)]
pub struct HeaderKey {
    name: HeaderName,
    fallback: ClientAddr,
}

impl HeaderKey {
    pub fn new(name: HeaderName) -> Self {
        Self {
            name,
            fallback: ClientAddr::new(),
        }
    }

    pub fn with_fallback(mut self, fallback: ClientAddr) -> Self {
        self.fallback = fallback;
        self
    }
}

impl KeyExtractor for HeaderKey {
    fn extract(&self, req: &Request) -> String {
        match req.headers().get(&self.name).and_then(|v| v.to_str().ok()) {
            Some(value) if !value.is_empty() => format!("{}:{}", self.name.as_str(), value),
            _ => self.fallback.extract(req),
        }
    }
}
