//! Upstream selection strategies.
//!
//! One strategy instance exists per algorithm name, created lazily by the
//! [`Manager`] and shared by every backend using that algorithm; per-backend
//! state inside a strategy is keyed by backend identity. Every strategy
//! filters the pool down to eligible servers (enabled and live) before
//! selecting.

pub mod ip_hash;
pub mod least_conn;
pub mod round_robin;
pub mod weighted;

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::GatewayError;
use crate::models::backend::{NormalizedBackend, ServerInstance};
use crate::proxy::health_check::HealthCheckManager;

pub trait LoadBalancer: Send + Sync {
    /// Pick one eligible server, or fail with `NoHealthyServer`.
    fn select(
        &self,
        client_ip: &str,
        backend: &NormalizedBackend,
    ) -> Result<Arc<ServerInstance>, GatewayError>;

    /// Called by the pipeline when a request is handed to a server.
    fn on_request_start(&self, _backend: &NormalizedBackend, _server: &ServerInstance) {}

    /// Called by the pipeline when the request finishes or is cancelled.
    fn on_request_end(&self, _backend: &NormalizedBackend, _server: &ServerInstance) {}
}

/// Owns the strategy instances and the probe scheduler.
pub struct Manager {
    balancers: DashMap<String, Arc<dyn LoadBalancer>>,
    health: Arc<HealthCheckManager>,
}

impl Manager {
    pub fn new(health: Arc<HealthCheckManager>) -> Self {
        Self {
            balancers: DashMap::new(),
            health,
        }
    }

    /// Resolve an algorithm name to its shared strategy instance. Unknown
    /// names fall back to round-robin.
    pub fn get(&self, algorithm: &str) -> Arc<dyn LoadBalancer> {
        self.balancers
            .entry(algorithm.to_string())
            .or_insert_with(|| match algorithm {
                "weighted" => Arc::new(weighted::WeightedRoundRobin::new()),
                "least-connections" => Arc::new(least_conn::LeastConnections::new()),
                "ip-hash" => Arc::new(ip_hash::IpHash::new()),
                _ => Arc::new(round_robin::RoundRobin::new()),
            })
            .clone()
    }

    pub fn health(&self) -> Arc<HealthCheckManager> {
        self.health.clone()
    }
}

/// Single-shot connection accounting for least-connections: increments the
/// server's active count on creation and decrements exactly once on drop,
/// whether the request completed or its future was cancelled mid-flight.
pub struct ConnectionGuard {
    lb: Arc<dyn LoadBalancer>,
    backend: Arc<NormalizedBackend>,
    server: Arc<ServerInstance>,
}

impl ConnectionGuard {
    pub fn new(
        lb: Arc<dyn LoadBalancer>,
        backend: Arc<NormalizedBackend>,
        server: Arc<ServerInstance>,
    ) -> Self {
        lb.on_request_start(&backend, &server);
        Self {
            lb,
            backend,
            server,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.lb.on_request_end(&self.backend, &self.server);
    }
}
