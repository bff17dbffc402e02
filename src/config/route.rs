use std::collections::HashMap;

use serde::Deserialize;

use super::service::Service;

/// Maps a matched route onto a backend service declaration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Backend {
    pub service: Service,
}

/// A routing rule. `path_type` selects prefix (default) or regex matching;
/// declaration order decides precedence.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Route {
    pub name: String,
    pub path: String,
    pub path_type: String,
    pub backend: Backend,
    pub rate_limit: RateLimit,
}

/// Rate-limit policy, either global or attached to a route.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RateLimit {
    pub enable: bool,

    /// `fixed-window` (default), `token-bucket` or `leaky-bucket`.
    pub algorithm: String,
    /// `memory` (default) or `redis`.
    pub storage: String,
    /// `ip` (default), `user`, `apikey` or `header`.
    pub key_type: String,
    /// Header name consulted by the `header` key type.
    pub key_header: String,

    /// Allowed requests per window.
    pub limit: i64,
    /// Window length in seconds.
    pub window: i64,
    /// Token-bucket capacity; falls back to `limit` when zero.
    pub burst: i64,

    /// Body of the 429 response.
    pub message: String,
    /// Extra headers stamped on the 429 response.
    pub headers: HashMap<String, String>,
}

impl RateLimit {
    pub fn resolved_message(&self) -> &str {
        if self.message.is_empty() {
            "Too Many Requests"
        } else {
            &self.message
        }
    }
}
