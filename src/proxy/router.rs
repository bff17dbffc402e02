use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::rewrite::{prefix_strip_rule, RewriteEngine};
use crate::config::route::{Backend, RateLimit, Route};
use crate::error::GatewayError;
use crate::models::backend::NormalizedBackend;
use crate::storage::cache::KvCache;

/// How long one path→route decision stays memoized. Stale positives are
/// acceptable because routes are immutable after startup.
const DECISION_TTL: Duration = Duration::from_secs(60);

/// A routing rule bound to its normalized backend and rewrite state.
pub struct RouteEntry {
    pub name: String,
    pub path: String,
    pub path_type: String,
    pub rate_limit: RateLimit,
    pub backend: Option<Arc<NormalizedBackend>>,
    regex: Option<regex::Regex>,
    rewrites: RewriteEngine,
}

impl RouteEntry {
    fn from_route(route: &Route) -> Result<Self, GatewayError> {
        let regex = match route.path_type.as_str() {
            "regex" => Some(
                regex::Regex::new(&route.path)
                    .map_err(|e| GatewayError::Config(format!("route {:?}: {e}", route.name)))?,
            ),
            _ => None,
        };

        let backend = NormalizedBackend::from_backend(&route.backend);
        let initial_rules = backend
            .as_ref()
            .and_then(|b| b.base.request.path.rewrites.clone())
            .unwrap_or_default();

        Ok(Self {
            name: route.name.clone(),
            path: route.path.clone(),
            path_type: route.path_type.clone(),
            rate_limit: route.rate_limit.clone(),
            backend,
            regex,
            rewrites: RewriteEngine::new(initial_rules),
        })
    }

    fn matches(&self, path: &str) -> Result<bool, GatewayError> {
        match self.path_type.as_str() {
            "" | "prefix" => Ok(path.starts_with(&self.path)),
            "regex" => Ok(self
                .regex
                .as_ref()
                .map(|re| re.is_match(path))
                .unwrap_or(false)),
            other => Err(GatewayError::UnsupportedPathType(other.to_string())),
        }
    }

    /// Rewrite a request path for forwarding. The effective rule list is
    /// the per-server override when one is set, else the route's shared
    /// list; the prefix-strip rule is ensured in whichever list is in
    /// effect before the rules are applied.
    pub fn rewrite(
        &self,
        path: &str,
        disable_prefix_rewrite: bool,
        override_rules: Option<&Vec<String>>,
    ) -> String {
        let is_prefix = self.path_type.is_empty() || self.path_type == "prefix";
        let strip_prefix =
            !disable_prefix_rewrite && is_prefix && self.path != "/" && !self.path.is_empty();
        if strip_prefix {
            self.rewrites.ensure_prefix_rule(&self.path);
        }

        let mut rules = match override_rules {
            Some(rules) => rules.clone(),
            None => self.rewrites.rules(),
        };
        if strip_prefix {
            let rule = prefix_strip_rule(&self.path);
            if !rules.contains(&rule) {
                rules.push(rule);
            }
        }

        RewriteEngine::apply(&rules, path)
    }
}

/// First-match-wins path router with a TTL decision cache in front.
pub struct Router {
    routes: Vec<Arc<RouteEntry>>,
    default_route: Option<Arc<RouteEntry>>,
    cache: Arc<dyn KvCache>,
}

impl Router {
    pub fn new(
        routes: &[Route],
        default_backend: &Backend,
        cache: Arc<dyn KvCache>,
    ) -> Result<Self, GatewayError> {
        let routes = routes
            .iter()
            .map(|r| RouteEntry::from_route(r).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        // The default backend becomes a synthetic catch-all route, but only
        // when it actually normalizes to a server pool.
        let default_route = NormalizedBackend::from_backend(default_backend).map(|backend| {
            let initial_rules = backend
                .base
                .request
                .path
                .rewrites
                .clone()
                .unwrap_or_default();
            Arc::new(RouteEntry {
                name: "default".to_string(),
                path: String::new(),
                path_type: String::new(),
                rate_limit: RateLimit::default(),
                backend: Some(backend),
                regex: None,
                rewrites: RewriteEngine::new(initial_rules),
            })
        });

        Ok(Self {
            routes,
            default_route,
            cache,
        })
    }

    /// Every route entry, declaration order, plus the synthetic default.
    /// Used at startup to begin health checking.
    pub fn entries(&self) -> Vec<Arc<RouteEntry>> {
        let mut all = self.routes.clone();
        if let Some(default) = &self.default_route {
            all.push(default.clone());
        }
        all
    }

    /// Resolve a request path to its route. Decisions are memoized for
    /// [`DECISION_TTL`]; misses are not cached.
    pub async fn resolve(&self, path: &str) -> Result<Arc<RouteEntry>, GatewayError> {
        let key = format!("match.path:{path}");

        if let Some(cached) = self.cache.get(&key).await {
            if let Some(entry) = cached
                .parse::<usize>()
                .ok()
                .and_then(|idx| self.routes.get(idx))
            {
                debug!(path = %path, route = %entry.name, "route decision from cache");
                return Ok(entry.clone());
            }
        }

        if let Some((idx, entry)) = self.match_path(path)? {
            self.cache.set(&key, &idx.to_string(), DECISION_TTL).await;
            return Ok(entry);
        }

        match &self.default_route {
            Some(default) => Ok(default.clone()),
            None => Err(GatewayError::RouteNotFound),
        }
    }

    fn match_path(&self, path: &str) -> Result<Option<(usize, Arc<RouteEntry>)>, GatewayError> {
        for (idx, entry) in self.routes.iter().enumerate() {
            if entry.matches(path)? {
                return Ok(Some((idx, entry.clone())));
            }
        }
        Ok(None)
    }
}
