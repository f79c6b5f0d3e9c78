//! Client identity resolution for rate limiting.

use axum::http::HeaderMap;
use std::net::SocketAddr;

const UNKNOWN_CLIENT: &str = "unknown";

/// Resolves the key that partitions rate-limit state, which is the
/// originating address of the request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIdentityResolver {
    trust_proxy_headers: bool,
}

impl ClientIdentityResolver {
    pub fn new(trust_proxy_headers: bool) -> Self {
        Self {
            trust_proxy_headers,
        }
    }

    /// Proxy headers are consulted only when trusted; otherwise the peer
    /// socket address is the identity.
    pub fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        if self.trust_proxy_headers {
            if let Some(ip) = Self::forwarded_ip(headers) {
                return ip;
            }
        }

        match peer {
            Some(addr) => addr.ip().to_string(),
            None => UNKNOWN_CLIENT.to_string(),
        }
    }

    fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());

        forwarded
            .or_else(|| {
                headers
                    .get("x-real-ip")
                    .and_then(|value| value.to_str().ok())
                    .map(str::trim)
                    .filter(|ip| !ip.is_empty())
            })
            .map(str::to_string)
    }
}
