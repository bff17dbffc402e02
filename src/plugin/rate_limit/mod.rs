//! Rate limiting as a request plugin.
//!
//! Two-dimensional: an identity extractor derives the bucket key, an
//! algorithm consults a storage to decide allow/deny. All three are picked
//! by configuration strings. Extractor and storage failures fail open; a
//! deny surfaces as a 429 with the configured message.

pub mod algorithm;
pub mod extractor;
pub mod leaky_bucket;
pub mod storage;
pub mod storage_memory;
pub mod storage_redis;
pub mod token_bucket;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::Full;
use hyper::header::HeaderValue;
use hyper::Response;
use tracing::{debug, warn};

use crate::config::route::RateLimit;
use crate::config::settings::Settings;
use crate::error::GatewayError;
use crate::models::request::{RateLimitInfo, RequestContext};
use crate::plugin::Plugin;

use algorithm::{new_algorithm, Algorithm};
use extractor::new_extractor;
use storage::Storage;
use storage_memory::MemoryStorage;
use storage_redis::RedisStorage;

pub struct RateLimitPlugin {
    global: RateLimit,
    /// Route policies ordered longest path first, so the most specific
    /// route wins.
    route_configs: Vec<(String, RateLimit)>,
    storages: HashMap<String, Arc<dyn Storage>>,
    /// One algorithm instance per discriminator; the bucket algorithms
    /// accumulate per-key state here across requests.
    algorithms: DashMap<String, Arc<dyn Algorithm>>,
}

impl RateLimitPlugin {
    pub fn new(settings: &Settings, redis: Option<redis::aio::ConnectionManager>) -> Self {
        let mut route_configs: Vec<(String, RateLimit)> = settings
            .routes
            .iter()
            .filter(|r| r.rate_limit.enable)
            .map(|r| (r.path.clone(), r.rate_limit.clone()))
            .collect();
        route_configs.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let mut storages: HashMap<String, Arc<dyn Storage>> = HashMap::new();
        storages.insert("memory".to_string(), MemoryStorage::new());
        if let Some(conn) = redis {
            storages.insert(
                "redis".to_string(),
                Arc::new(RedisStorage::new(
                    conn,
                    settings.cache.resolved_prefix().to_string(),
                )),
            );
        }

        Self {
            global: settings.rate_limit.clone(),
            route_configs,
            storages,
            algorithms: DashMap::new(),
        }
    }

    /// Whether any policy is enabled at all; the plugin is only registered
    /// when this holds.
    pub fn required(settings: &Settings) -> bool {
        settings.rate_limit.enable || settings.routes.iter().any(|r| r.rate_limit.enable)
    }

    /// Route policies are searched longest path first. A policy applies on
    /// an exact path match or a prefix match that ends on a path-segment
    /// boundary; otherwise the global policy applies if enabled.
    fn config_for(&self, path: &str) -> Option<&RateLimit> {
        for (route_path, config) in &self.route_configs {
            if path == route_path {
                return Some(config);
            }
            if path.len() > route_path.len()
                && path.starts_with(route_path.as_str())
                && path.as_bytes()[route_path.len()] == b'/'
            {
                return Some(config);
            }
        }

        if self.global.enable {
            Some(&self.global)
        } else {
            None
        }
    }
}

#[async_trait]
impl Plugin for RateLimitPlugin {
    fn name(&self) -> &'static str {
        "ratelimit"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let Some(config) = self.config_for(&ctx.path) else {
            return Ok(());
        };

        if config.limit <= 0 {
            warn!(limit = config.limit, "invalid rate limit, skipping");
            return Ok(());
        }
        if config.window <= 0 {
            warn!(window = config.window, "invalid rate limit window, skipping");
            return Ok(());
        }

        let key = new_extractor(&config.key_type, &config.key_header).extract(ctx);

        let storage_name = if config.storage.is_empty() {
            "memory"
        } else {
            config.storage.as_str()
        };
        let storage = match self.storages.get(storage_name) {
            Some(storage) => storage.clone(),
            None => {
                warn!(storage = %storage_name, "storage not available, falling back to memory");
                match self.storages.get("memory") {
                    Some(storage) => storage.clone(),
                    None => return Ok(()),
                }
            }
        };

        let algorithm_name = if config.algorithm.is_empty() {
            "fixed-window"
        } else {
            config.algorithm.as_str()
        };
        let algorithm = self
            .algorithms
            .entry(algorithm_name.to_string())
            .or_insert_with(|| new_algorithm(algorithm_name))
            .clone();

        let window = Duration::from_secs(config.window as u64);
        let decision = match algorithm
            .allow(storage.as_ref(), &key, config.limit, window, config.burst)
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                // Fail open: a broken storage must not take traffic down.
                warn!(key = %key, error = %err, "rate limit check failed, allowing request");
                return Ok(());
            }
        };

        ctx.rate_limit = Some(RateLimitInfo {
            limit: config.limit,
            remaining: decision.remaining,
            reset: decision.reset_unix(),
        });

        if !decision.allowed {
            warn!(key = %key, path = %ctx.path, "rate limit exceeded");
            return Err(GatewayError::RateLimitExceeded {
                message: config.resolved_message().to_string(),
                limit: config.limit,
                reset: decision.reset_unix(),
                retry_after: decision.retry_after(),
                headers: config
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            });
        }

        debug!(key = %key, remaining = decision.remaining, "rate limit check passed");
        Ok(())
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut Response<Full<Bytes>>,
    ) -> Result<(), GatewayError> {
        if let Some(info) = &ctx.rate_limit {
            let headers = response.headers_mut();
            if let Ok(value) = HeaderValue::from_str(&info.limit.to_string()) {
                headers.insert("X-RateLimit-Limit", value);
            }
            if let Ok(value) = HeaderValue::from_str(&info.remaining.to_string()) {
                headers.insert("X-RateLimit-Remaining", value);
            }
            if let Ok(value) = HeaderValue::from_str(&info.reset.to_string()) {
                headers.insert("X-RateLimit-Reset", value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::route::Route;

    fn ctx_for(path: &str) -> RequestContext {
        RequestContext::new(
            "GET".into(),
            path.into(),
            String::new(),
            "192.0.2.10:40000".parse().unwrap(),
        )
    }

    fn limited_route(path: &str, limit: i64) -> Route {
        Route {
            name: path.trim_matches('/').to_string(),
            path: path.into(),
            rate_limit: RateLimit {
                enable: true,
                limit,
                window: 60,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn plugin_with(routes: Vec<Route>, global: RateLimit) -> RateLimitPlugin {
        let settings = Settings {
            routes,
            rate_limit: global,
            ..Default::default()
        };
        RateLimitPlugin::new(&settings, None)
    }

    #[tokio::test]
    async fn test_sixth_request_is_denied() {
        let global = RateLimit {
            enable: true,
            limit: 5,
            window: 60,
            key_type: "ip".into(),
            ..Default::default()
        };
        let plugin = plugin_with(Vec::new(), global);

        for _ in 0..5 {
            let mut ctx = ctx_for("/api/x");
            plugin.on_request(&mut ctx).await.unwrap();
            assert!(ctx.rate_limit.is_some());
        }

        let mut ctx = ctx_for("/api/x");
        let err = plugin.on_request(&mut ctx).await.unwrap_err();
        match err {
            GatewayError::RateLimitExceeded {
                retry_after, limit, ..
            } => {
                assert!(retry_after > 0);
                assert_eq!(limit, 5);
            }
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_path_boundary_rule() {
        let plugin = plugin_with(vec![limited_route("/users", 1)], RateLimit::default());

        assert!(plugin.config_for("/users").is_some());
        assert!(plugin.config_for("/users/42").is_some());
        assert!(plugin.config_for("/usersadmin").is_none());
        assert!(plugin.config_for("/users-admin/x").is_none());
    }

    #[tokio::test]
    async fn test_longest_route_path_wins() {
        let mut v2 = limited_route("/api/v2", 100);
        v2.rate_limit.message = "v2".into();
        let mut api = limited_route("/api", 1);
        api.rate_limit.message = "api".into();

        let plugin = plugin_with(vec![api, v2], RateLimit::default());
        assert_eq!(plugin.config_for("/api/v2/users").unwrap().message, "v2");
        assert_eq!(plugin.config_for("/api/other").unwrap().message, "api");
    }

    #[tokio::test]
    async fn test_global_config_is_fallback() {
        let global = RateLimit {
            enable: true,
            limit: 10,
            window: 60,
            message: "global".into(),
            ..Default::default()
        };
        let plugin = plugin_with(vec![limited_route("/users", 1)], global);

        assert_eq!(plugin.config_for("/other").unwrap().message, "global");
    }

    #[tokio::test]
    async fn test_invalid_limit_skips_check() {
        let global = RateLimit {
            enable: true,
            limit: 0,
            window: 60,
            ..Default::default()
        };
        let plugin = plugin_with(Vec::new(), global);

        let mut ctx = ctx_for("/x");
        plugin.on_request(&mut ctx).await.unwrap();
        assert!(ctx.rate_limit.is_none());
    }

    #[tokio::test]
    async fn test_separate_clients_have_separate_budgets() {
        let global = RateLimit {
            enable: true,
            limit: 1,
            window: 60,
            ..Default::default()
        };
        let plugin = plugin_with(Vec::new(), global);

        let mut a = ctx_for("/x");
        a.headers
            .insert("x-forwarded-for".into(), "203.0.113.1".into());
        plugin.on_request(&mut a).await.unwrap();
        assert!(plugin.on_request(&mut a.clone()).await.is_err());

        let mut b = ctx_for("/x");
        b.headers
            .insert("x-forwarded-for".into(), "203.0.113.2".into());
        plugin.on_request(&mut b).await.unwrap();
    }

    #[tokio::test]
    async fn test_response_headers_stamped_on_allow() {
        let global = RateLimit {
            enable: true,
            limit: 5,
            window: 60,
            ..Default::default()
        };
        let plugin = plugin_with(Vec::new(), global);

        let mut ctx = ctx_for("/x");
        plugin.on_request(&mut ctx).await.unwrap();

        let mut response = Response::new(Full::new(Bytes::new()));
        plugin.on_response(&ctx, &mut response).await.unwrap();

        assert_eq!(response.headers()["X-RateLimit-Limit"], "5");
        assert_eq!(response.headers()["X-RateLimit-Remaining"], "4");
        assert!(response.headers().contains_key("X-RateLimit-Reset"));
    }

    #[tokio::test]
    async fn test_disabled_plugin_is_inert() {
        let plugin = plugin_with(Vec::new(), RateLimit::default());
        let mut ctx = ctx_for("/x");
        plugin.on_request(&mut ctx).await.unwrap();
        assert!(ctx.rate_limit.is_none());

        let settings = Settings::default();
        assert!(!RateLimitPlugin::required(&settings));
    }
}
