use std::collections::HashMap;
use std::net::SocketAddr;

/// Everything the plugin chain and the balancers need to know about one
/// inbound request, extracted once by the handler.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub query: String,
    /// Header map with lowercase names, first value wins.
    pub headers: HashMap<String, String>,
    pub peer_addr: SocketAddr,
    /// Client address resolved through X-Forwarded-For / X-Real-IP with the
    /// peer address as fallback.
    pub client_ip: String,

    /// Filled by the rate-limit plugin on an allowed request so the
    /// response can carry the X-RateLimit-* headers.
    pub rate_limit: Option<RateLimitInfo>,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitInfo {
    pub limit: i64,
    pub remaining: i64,
    /// Unix seconds at which the window resets.
    pub reset: i64,
}

impl RequestContext {
    pub fn new(method: String, path: String, query: String, peer_addr: SocketAddr) -> Self {
        Self {
            method,
            path,
            query,
            headers: HashMap::new(),
            peer_addr,
            client_ip: peer_addr.ip().to_string(),
            rate_limit: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }
}
