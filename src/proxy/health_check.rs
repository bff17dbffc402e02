use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::service::{merge_health_check, HealthCheck};
use crate::config::settings::InnerHealthCheck;
use crate::models::backend::{NormalizedBackend, ServerInstance};

/// Drives one background probe loop per backend and flips each server's
/// liveness flag with the probe outcome. Request handling only ever reads
/// the flag; it never waits on a probe.
pub struct HealthCheckManager {
    checkers: DashMap<String, JoinHandle<()>>,
    client: reqwest::Client,
    defaults: InnerHealthCheck,
}

impl HealthCheckManager {
    pub fn new(defaults: InnerHealthCheck) -> Self {
        Self {
            checkers: DashMap::new(),
            client: reqwest::Client::new(),
            defaults,
        }
    }

    /// Begin probing a backend. No-ops when probing is disabled globally,
    /// when the backend's spec is disabled or pinned ok, or when this
    /// backend is already being probed.
    pub fn start(&self, backend: Arc<NormalizedBackend>) {
        if !self.defaults.enable {
            return;
        }

        let spec = &backend.base.health_check;
        if !spec.enable || spec.ok {
            return;
        }

        let key = backend.id();
        if self.checkers.contains_key(&key) {
            return;
        }

        let interval = resolve_seconds(spec.interval, self.defaults.interval, 30);
        let timeout = resolve_seconds(spec.timeout, self.defaults.timeout, 5);
        let client = self.client.clone();

        debug!(
            backend = %key,
            interval_secs = interval.as_secs(),
            timeout_secs = timeout.as_secs(),
            "health checks started"
        );

        let handle = tokio::spawn(async move {
            // The first tick fires immediately, so the initial check runs
            // right at startup.
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                check_all(&client, &backend, timeout).await;
            }
        });

        self.checkers.insert(key, handle);
    }

    /// Stop probing a backend. Stopping an unknown backend is a no-op.
    pub fn stop(&self, backend_id: &str) {
        if let Some((_, handle)) = self.checkers.remove(backend_id) {
            handle.abort();
            debug!(backend = %backend_id, "health checks stopped");
        }
    }

    pub fn stop_all(&self) {
        let keys: Vec<String> = self.checkers.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.stop(&key);
        }
    }

    #[cfg(test)]
    fn active_count(&self) -> usize {
        self.checkers.len()
    }
}

fn resolve_seconds(own: u64, fallback: u64, hard_default: u64) -> Duration {
    let secs = if own > 0 {
        own
    } else if fallback > 0 {
        fallback
    } else {
        hard_default
    };
    Duration::from_secs(secs)
}

/// Probe every server of the backend concurrently.
async fn check_all(client: &reqwest::Client, backend: &NormalizedBackend, timeout: Duration) {
    let checks = backend.servers.iter().map(|server| {
        let server = server.clone();
        async move {
            if server.config.disabled {
                server.set_healthy(false);
                return;
            }
            check_server(client, backend, &server, timeout).await;
        }
    });
    join_all(checks).await;
}

async fn check_server(
    client: &reqwest::Client,
    backend: &NormalizedBackend,
    server: &Arc<ServerInstance>,
    timeout: Duration,
) {
    // Per-server override merged over the backend spec; unset override
    // fields keep the backend values.
    let resolved: HealthCheck = match &server.config.health_check {
        Some(over) => merge_health_check(&backend.base.health_check, over),
        None => backend.base.health_check.clone(),
    };

    if !resolved.enable || resolved.ok {
        server.set_healthy(true);
        return;
    }

    let url = format!(
        "{}://{}{}",
        server.protocol(&backend.base),
        server.host(),
        resolved.resolved_path()
    );

    let method = reqwest::Method::from_bytes(resolved.resolved_method().as_bytes())
        .unwrap_or(reqwest::Method::GET);

    match client.request(method, &url).timeout(timeout).send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let healthy = resolved.accepts(status);
            if healthy {
                debug!(server = %server.id(), status = status, "server is healthy");
            } else {
                debug!(
                    server = %server.id(),
                    status = status,
                    expected = ?resolved.status,
                    "server is unhealthy"
                );
            }
            server.set_healthy(healthy);
        }
        Err(err) => {
            debug!(server = %server.id(), error = %err, "server is unhealthy");
            server.set_healthy(false);
        }
    }
}
