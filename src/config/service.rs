use std::collections::HashMap;

use serde::Deserialize;

/// A backend service declaration shared by one or more server instances.
///
/// Supports two shapes: a single upstream (`name`/`port`/`protocol`) or a
/// pool (`servers` + `algorithm`). The transform and health-check sections
/// apply to every server unless a server carries its own override.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Service {
    // Single-server mode
    pub name: String,
    pub port: u16,
    pub protocol: String,

    // Multi-server mode
    pub algorithm: String,
    pub servers: Vec<Server>,

    // Shared configuration
    pub request: RequestTransform,
    pub response: ResponseTransform,
    pub auth: Auth,
    pub health_check: HealthCheck,
}

/// A single upstream server instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Server {
    pub name: String,
    pub port: u16,

    pub protocol: String,
    pub weight: i64,
    pub disabled: bool,

    // Per-server overrides of the shared sections.
    pub request: Option<RequestTransform>,
    pub response: Option<ResponseTransform>,
    pub auth: Option<Auth>,
    pub health_check: Option<HealthCheck>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            name: String::new(),
            port: 0,
            protocol: String::new(),
            weight: 1,
            disabled: false,
            request: None,
            response: None,
            auth: None,
            health_check: None,
        }
    }
}

/// Request-side transforms applied before forwarding.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RequestTransform {
    pub path: RequestPath,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RequestPath {
    pub disable_prefix_rewrite: bool,
    /// Ordered `pattern:replacement` rules. `None` means "inherit" when this
    /// appears in a per-server override.
    pub rewrites: Option<Vec<String>>,
}

/// Response-side transforms applied before returning to the client.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ResponseTransform {
    pub headers: HashMap<String, String>,
}

/// Upstream authentication material. Carried through the effective-config
/// merge (an override replaces the whole record); the gateway itself does
/// not act on it.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Auth {
    #[serde(rename = "type")]
    pub kind: String,
    pub username: String,
    pub password: String,
    pub token: String,
    pub secret: String,
}

/// Active health-check specification.
///
/// All fields default to their zero value; the probe scheduler resolves the
/// operational defaults (GET, `/health`, `[200]`, 30s/5s) at check time so
/// that a per-server override with unset fields keeps the backend values.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HealthCheck {
    pub enable: bool,

    pub method: String,
    pub path: String,
    pub status: Option<Vec<u16>>,

    /// Probe interval in seconds.
    pub interval: u64,
    /// Per-probe timeout in seconds.
    pub timeout: u64,

    /// Treat the server as healthy without probing.
    pub ok: bool,
}

impl HealthCheck {
    pub fn resolved_method(&self) -> &str {
        if self.method.is_empty() {
            "GET"
        } else {
            &self.method
        }
    }

    pub fn resolved_path(&self) -> &str {
        if self.path.is_empty() {
            "/health"
        } else {
            &self.path
        }
    }

    pub fn accepts(&self, status: u16) -> bool {
        match &self.status {
            Some(list) => list.contains(&status),
            None => status == 200,
        }
    }
}

/// Merge a per-server request override over the shared section. Rewrites
/// replace wholesale when set; header and query maps merge with the
/// override winning per key; `disable_prefix_rewrite` only flips on.
pub fn merge_request(base: &RequestTransform, over: &RequestTransform) -> RequestTransform {
    let mut merged = base.clone();

    if over.path.rewrites.is_some() {
        merged.path.rewrites = over.path.rewrites.clone();
    }
    if over.path.disable_prefix_rewrite {
        merged.path.disable_prefix_rewrite = true;
    }

    for (k, v) in &over.headers {
        merged.headers.insert(k.clone(), v.clone());
    }
    for (k, v) in &over.query {
        merged.query.insert(k.clone(), v.clone());
    }

    merged
}

pub fn merge_response(base: &ResponseTransform, over: &ResponseTransform) -> ResponseTransform {
    let mut merged = base.clone();
    for (k, v) in &over.headers {
        merged.headers.insert(k.clone(), v.clone());
    }
    merged
}

/// Merge a per-server health-check override over the backend spec. A field
/// overrides only when explicitly set: booleans when true, strings when
/// non-empty, numerics when positive, the status list when present.
pub fn merge_health_check(base: &HealthCheck, over: &HealthCheck) -> HealthCheck {
    let mut merged = base.clone();

    if over.enable {
        merged.enable = true;
    }
    if !over.method.is_empty() {
        merged.method = over.method.clone();
    }
    if !over.path.is_empty() {
        merged.path = over.path.clone();
    }
    if over.status.is_some() {
        merged.status = over.status.clone();
    }
    if over.interval > 0 {
        merged.interval = over.interval;
    }
    if over.timeout > 0 {
        merged.timeout = over.timeout;
    }
    if over.ok {
        merged.ok = true;
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_health_check_keeps_base_zero_values() {
        let base = HealthCheck {
            enable: true,
            method: "HEAD".into(),
            path: "/ping".into(),
            status: Some(vec![200, 204]),
            interval: 10,
            timeout: 2,
            ok: false,
        };
        let over = HealthCheck {
            interval: 5,
            ..Default::default()
        };

        let merged = merge_health_check(&base, &over);
        assert!(merged.enable);
        assert_eq!(merged.method, "HEAD");
        assert_eq!(merged.path, "/ping");
        assert_eq!(merged.status, Some(vec![200, 204]));
        assert_eq!(merged.interval, 5);
        assert_eq!(merged.timeout, 2);
    }

    #[test]
    fn test_merge_request_headers_override_wins() {
        let mut base = RequestTransform::default();
        base.headers.insert("X-Env".into(), "base".into());
        base.headers.insert("X-Keep".into(), "yes".into());

        let mut over = RequestTransform::default();
        over.headers.insert("X-Env".into(), "server".into());

        let merged = merge_request(&base, &over);
        assert_eq!(merged.headers["X-Env"], "server");
        assert_eq!(merged.headers["X-Keep"], "yes");
    }

    #[test]
    fn test_merge_request_rewrites_replace_wholesale() {
        let mut base = RequestTransform::default();
        base.path.rewrites = Some(vec!["^/a(.*)$:$1".into()]);

        let mut over = RequestTransform::default();
        over.path.rewrites = Some(vec![]);

        let merged = merge_request(&base, &over);
        assert_eq!(merged.path.rewrites, Some(vec![]));

        let keep = merge_request(&base, &RequestTransform::default());
        assert_eq!(keep.path.rewrites, Some(vec!["^/a(.*)$:$1".into()]));
    }

    #[test]
    fn test_health_check_resolved_defaults() {
        let hc = HealthCheck::default();
        assert_eq!(hc.resolved_method(), "GET");
        assert_eq!(hc.resolved_path(), "/health");
        assert!(hc.accepts(200));
        assert!(!hc.accepts(500));
    }
}
