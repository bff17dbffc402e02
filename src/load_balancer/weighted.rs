use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::LoadBalancer;
use crate::error::GatewayError;
use crate::models::backend::{NormalizedBackend, ServerInstance};

/// Smooth weighted round-robin.
///
/// Each server carries a current weight, seeded with its configured weight
/// on first observation. Every selection picks the eligible server with the
/// highest current weight, then raises every eligible server by its
/// configured weight and lowers the winner by the sum of configured
/// weights. Over any full cycle this hands each server exactly its weight's
/// share of selections without long runs on one server.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    /// backend id -> server id -> current weight
    weights: Mutex<HashMap<String, HashMap<String, i64>>>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

fn configured_weight(server: &ServerInstance) -> i64 {
    server.config.weight.max(1)
}

impl LoadBalancer for WeightedRoundRobin {
    fn select(
        &self,
        _client_ip: &str,
        backend: &NormalizedBackend,
    ) -> Result<Arc<ServerInstance>, GatewayError> {
        let eligible = backend.eligible();
        if eligible.is_empty() {
            return Err(GatewayError::NoHealthyServer);
        }

        let total_weight: i64 = eligible.iter().map(|s| configured_weight(s)).sum();

        let mut table = self.weights.lock();
        let weights = table.entry(backend.id()).or_default();

        for server in &eligible {
            weights
                .entry(server.id())
                .or_insert_with(|| configured_weight(server));
        }

        // First server wins ties, keeping selection deterministic.
        let mut selected: Option<&Arc<ServerInstance>> = None;
        let mut max_weight = i64::MIN;
        for server in &eligible {
            let current = weights[&server.id()];
            if current > max_weight {
                max_weight = current;
                selected = Some(server);
            }
        }
        let selected = selected.expect("eligible set is non-empty").clone();

        let selected_id = selected.id();
        for server in &eligible {
            let id = server.id();
            let entry = weights.get_mut(&id).expect("seeded above");
            *entry += configured_weight(server);
            if id == selected_id {
                *entry -= total_weight;
            }
        }

        Ok(selected)
    }
}
