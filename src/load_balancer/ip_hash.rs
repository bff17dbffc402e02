use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::LoadBalancer;
use crate::error::GatewayError;
use crate::models::backend::{NormalizedBackend, ServerInstance};

/// Pins each client to a server by hashing its IP: SHA-256 of the address,
/// first 8 bytes as a big-endian u64, modulo the eligible pool size. The
/// same client lands on the same server for as long as the eligible set is
/// unchanged.
#[derive(Debug, Default)]
pub struct IpHash;

impl IpHash {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for IpHash {
    fn select(
        &self,
        client_ip: &str,
        backend: &NormalizedBackend,
    ) -> Result<Arc<ServerInstance>, GatewayError> {
        let eligible = backend.eligible();
        if eligible.is_empty() {
            return Err(GatewayError::NoHealthyServer);
        }

        let digest = Sha256::digest(client_ip.as_bytes());
        let hash = u64::from_be_bytes(digest[..8].try_into().expect("sha256 yields 32 bytes"));

        Ok(eligible[(hash % eligible.len() as u64) as usize].clone())
    }
}
