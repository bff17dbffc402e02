use std::collections::HashSet;
use std::fs;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use super::defaults;
use super::route::{Backend, RateLimit, Route};

/// Top-level gateway configuration, deserialized from a YAML file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    #[serde(default = "defaults::default_port")]
    pub port: u16,

    /// TCP accept backlog for the listener socket.
    #[serde(default = "defaults::default_backlog")]
    pub backlog: u32,

    /// When set, only requests whose path begins with this prefix are
    /// served; the prefix is stripped before route matching.
    pub baseuri: String,

    /// Default backend used when no route matches.
    pub backend: Backend,

    /// Ordered routing rules; first match wins.
    pub routes: Vec<Route>,

    /// Remote KV connection shared by the route-decision cache and the
    /// redis rate-limit storage.
    pub cache: CacheConfig,

    pub healthcheck: HealthCheckSettings,

    /// Global rate-limit policy, applied when no route-specific policy
    /// matches the request path.
    pub rate_limit: RateLimit,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub host: String,
    #[serde(default = "defaults::default_cache_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    pub db: i64,
    pub prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: defaults::default_cache_port(),
            username: String::new(),
            password: String::new(),
            db: 0,
            prefix: String::new(),
        }
    }
}

impl CacheConfig {
    pub fn configured(&self) -> bool {
        !self.host.is_empty()
    }

    pub fn resolved_prefix(&self) -> &str {
        if self.prefix.is_empty() {
            "gozoox-api-gateway:"
        } else {
            &self.prefix
        }
    }

    /// Connection URL for the redis client.
    pub fn url(&self) -> String {
        let auth = match (self.username.is_empty(), self.password.is_empty()) {
            (true, true) => String::new(),
            (true, false) => format!(":{}@", self.password),
            (false, _) => format!("{}:{}@", self.username, self.password),
        };
        format!("redis://{}{}:{}/{}", auth, self.host, self.port, self.db)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HealthCheckSettings {
    pub outer: OuterHealthCheck,
    pub inner: InnerHealthCheck,
}

/// Liveness endpoint served by the gateway itself, ahead of routing.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OuterHealthCheck {
    pub enable: bool,
    pub path: String,
    pub ok: bool,
}

/// Defaults for the background upstream probes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InnerHealthCheck {
    pub enable: bool,
    #[serde(default = "defaults::default_inner_interval")]
    pub interval: u64,
    #[serde(default = "defaults::default_inner_timeout")]
    pub timeout: u64,
}

impl Default for InnerHealthCheck {
    fn default() -> Self {
        Self {
            enable: true,
            interval: defaults::default_inner_interval(),
            timeout: defaults::default_inner_timeout(),
        }
    }
}

impl Settings {
    /// Load and validate the configuration file.
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        let settings: Settings = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {path}"))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject configurations the request path could only fail on later:
    /// unknown path types, malformed route regexes, unknown rate-limit
    /// discriminators, redis storage without a cache host.
    pub fn validate(&self) -> Result<()> {
        for route in &self.routes {
            match route.path_type.as_str() {
                "" | "prefix" => {}
                "regex" => {
                    regex::Regex::new(&route.path).with_context(|| {
                        format!("route {:?}: invalid regex path {:?}", route.name, route.path)
                    })?;
                }
                other => {
                    bail!("route {:?}: unsupported path type {:?}", route.name, other);
                }
            }

            self.validate_rate_limit(&route.rate_limit, &route.name)?;
        }

        self.validate_rate_limit(&self.rate_limit, "global")?;

        Ok(())
    }

    fn validate_rate_limit(&self, rl: &RateLimit, scope: &str) -> Result<()> {
        if !rl.enable {
            return Ok(());
        }

        let algorithms: HashSet<&str> =
            ["", "fixed-window", "token-bucket", "leaky-bucket"].into();
        if !algorithms.contains(rl.algorithm.as_str()) {
            bail!("rate limit ({scope}): unknown algorithm {:?}", rl.algorithm);
        }

        match rl.storage.as_str() {
            "" | "memory" => {}
            "redis" => {
                if !self.cache.configured() {
                    bail!("rate limit ({scope}): redis storage selected but no cache host configured");
                }
            }
            other => bail!("rate limit ({scope}): unknown storage {other:?}"),
        }

        let key_types: HashSet<&str> = ["", "ip", "user", "apikey", "header"].into();
        if !key_types.contains(rl.key_type.as_str()) {
            bail!("rate limit ({scope}): unknown key type {:?}", rl.key_type);
        }

        Ok(())
    }
}
