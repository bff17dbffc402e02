use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::LoadBalancer;
use crate::error::GatewayError;
use crate::models::backend::{NormalizedBackend, ServerInstance};

/// Rotates through the eligible servers of each backend with a lock-free
/// monotonic counter.
#[derive(Debug, Default)]
pub struct RoundRobin {
    indices: DashMap<String, AtomicU64>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn select(
        &self,
        _client_ip: &str,
        backend: &NormalizedBackend,
    ) -> Result<Arc<ServerInstance>, GatewayError> {
        let eligible = backend.eligible();
        if eligible.is_empty() {
            return Err(GatewayError::NoHealthyServer);
        }

        let counter = self
            .indices
            .entry(backend.id())
            .or_insert_with(|| AtomicU64::new(0));
        let current = counter.fetch_add(1, Ordering::Relaxed);

        Ok(eligible[(current % eligible.len() as u64) as usize].clone())
    }
}
