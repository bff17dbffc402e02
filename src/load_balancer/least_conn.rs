use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::LoadBalancer;
use crate::error::GatewayError;
use crate::models::backend::{NormalizedBackend, ServerInstance};

/// Selects the eligible server with the fewest in-flight requests; ties go
/// to the first one encountered. The pipeline drives the counters through
/// `on_request_start`/`on_request_end`.
#[derive(Debug, Default)]
pub struct LeastConnections {
    /// backend id -> server id -> active request count
    connections: Mutex<HashMap<String, HashMap<String, i64>>>,
}

impl LeastConnections {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn count(&self, backend: &NormalizedBackend, server: &ServerInstance) -> i64 {
        self.connections
            .lock()
            .get(&backend.id())
            .and_then(|m| m.get(&server.id()).copied())
            .unwrap_or(0)
    }
}

impl LoadBalancer for LeastConnections {
    fn select(
        &self,
        _client_ip: &str,
        backend: &NormalizedBackend,
    ) -> Result<Arc<ServerInstance>, GatewayError> {
        let eligible = backend.eligible();
        if eligible.is_empty() {
            return Err(GatewayError::NoHealthyServer);
        }

        let mut table = self.connections.lock();
        let counts = table.entry(backend.id()).or_default();

        let mut selected: Option<&Arc<ServerInstance>> = None;
        let mut min = i64::MAX;
        for server in &eligible {
            let count = counts.get(&server.id()).copied().unwrap_or(0);
            if count < min {
                min = count;
                selected = Some(server);
            }
        }

        Ok(selected.expect("eligible set is non-empty").clone())
    }

    fn on_request_start(&self, backend: &NormalizedBackend, server: &ServerInstance) {
        let mut table = self.connections.lock();
        let counts = table.entry(backend.id()).or_default();
        *counts.entry(server.id()).or_default() += 1;
    }

    fn on_request_end(&self, backend: &NormalizedBackend, server: &ServerInstance) {
        let mut table = self.connections.lock();
        if let Some(counts) = table.get_mut(&backend.id()) {
            if let Some(count) = counts.get_mut(&server.id()) {
                if *count > 0 {
                    *count -= 1;
                }
            }
        }
    }
}
