use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::route::Backend;
use crate::config::service::{
    merge_health_check, merge_request, merge_response, Server, Service,
};

/// Runtime record for one upstream server: the configured declaration plus
/// the liveness flag written by the probe scheduler and read on every
/// selection. The flag is the only field that changes after startup.
#[derive(Debug)]
pub struct ServerInstance {
    pub config: Server,
    healthy: AtomicBool,
}

impl ServerInstance {
    pub fn new(config: Server) -> Self {
        Self {
            config,
            healthy: AtomicBool::new(true),
        }
    }

    /// Unique identity, `name:port` with the port as declared.
    pub fn id(&self) -> String {
        format!("{}:{}", self.config.name, self.config.port)
    }

    /// Dial address, with port 0 resolving to 80.
    pub fn host(&self) -> String {
        let port = if self.config.port == 0 {
            80
        } else {
            self.config.port
        };
        format!("{}:{}", self.config.name, port)
    }

    /// Full target URL against the given base service, for logging.
    pub fn target(&self, base: &Service) -> String {
        format!("{}://{}", self.protocol(base), self.host())
    }

    /// Effective protocol: the server's own if set, else the base's, else
    /// plain http.
    pub fn protocol<'a>(&'a self, base: &'a Service) -> &'a str {
        if !self.config.protocol.is_empty() {
            &self.config.protocol
        } else if !base.protocol.is_empty() {
            &base.protocol
        } else {
            "http"
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// A server takes traffic only when it is both enabled and live.
    pub fn is_eligible(&self) -> bool {
        !self.config.disabled && self.is_healthy()
    }

    /// Merge this server's overrides over the base service configuration.
    pub fn effective_config(&self, base: &Service) -> Service {
        let mut effective = base.clone();

        if !self.config.protocol.is_empty() {
            effective.protocol = self.config.protocol.clone();
        }
        if let Some(request) = &self.config.request {
            effective.request = merge_request(&base.request, request);
        }
        if let Some(response) = &self.config.response {
            effective.response = merge_response(&base.response, response);
        }
        if let Some(auth) = &self.config.auth {
            effective.auth = auth.clone();
        }
        if let Some(health_check) = &self.config.health_check {
            effective.health_check = merge_health_check(&base.health_check, health_check);
        }

        effective
    }
}

/// Uniform view of a backend declaration: one algorithm name, a non-empty
/// server pool, and the shared base service. Built once per backend at
/// startup so the probe scheduler and the balancers observe the same
/// liveness flags.
#[derive(Debug)]
pub struct NormalizedBackend {
    pub algorithm: String,
    pub servers: Vec<Arc<ServerInstance>>,
    pub base: Arc<Service>,
}

impl NormalizedBackend {
    /// Normalize a backend declaration. A declaration with servers uses
    /// them as-is; one with only a base name synthesizes a single server;
    /// one with neither produces nothing and the route is dropped.
    pub fn from_backend(backend: &Backend) -> Option<Arc<Self>> {
        let service = &backend.service;

        if !service.servers.is_empty() {
            let servers = service
                .servers
                .iter()
                .map(|s| Arc::new(ServerInstance::new(s.clone())))
                .collect();

            let algorithm = if service.algorithm.is_empty() {
                "round-robin".to_string()
            } else {
                service.algorithm.clone()
            };

            let mut base = service.clone();
            base.servers = Vec::new();

            return Some(Arc::new(Self {
                algorithm,
                servers,
                base: Arc::new(base),
            }));
        }

        if !service.name.is_empty() {
            let server = Server {
                name: service.name.clone(),
                port: service.port,
                protocol: service.protocol.clone(),
                weight: 1,
                ..Default::default()
            };

            let mut base = service.clone();
            base.servers = Vec::new();

            return Some(Arc::new(Self {
                algorithm: "round-robin".to_string(),
                servers: vec![Arc::new(ServerInstance::new(server))],
                base: Arc::new(base),
            }));
        }

        None
    }

    /// Backend identity, keyed by the first server.
    pub fn id(&self) -> String {
        match self.servers.first() {
            Some(server) => server.id(),
            None => "empty".to_string(),
        }
    }

    /// Servers currently able to take traffic.
    pub fn eligible(&self) -> Vec<Arc<ServerInstance>> {
        self.servers
            .iter()
            .filter(|s| s.is_eligible())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::service::HealthCheck;

    fn single_backend(name: &str, port: u16) -> Backend {
        Backend {
            service: Service {
                name: name.into(),
                port,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_normalize_single_server() {
        let backend = single_backend("a.internal", 8080);
        let normalized = NormalizedBackend::from_backend(&backend).unwrap();
        assert_eq!(normalized.algorithm, "round-robin");
        assert_eq!(normalized.servers.len(), 1);
        assert_eq!(normalized.servers[0].id(), "a.internal:8080");
        assert_eq!(normalized.servers[0].config.weight, 1);
        assert!(normalized.servers[0].is_healthy());
    }

    #[test]
    fn test_normalize_multi_server() {
        let backend = Backend {
            service: Service {
                algorithm: "weighted".into(),
                servers: vec![
                    Server {
                        name: "a".into(),
                        port: 80,
                        weight: 2,
                        ..Default::default()
                    },
                    Server {
                        name: "b".into(),
                        port: 80,
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
        };
        let normalized = NormalizedBackend::from_backend(&backend).unwrap();
        assert_eq!(normalized.algorithm, "weighted");
        assert_eq!(normalized.servers.len(), 2);
        assert!(normalized.base.servers.is_empty());
        assert_eq!(normalized.id(), "a:80");
    }

    #[test]
    fn test_normalize_empty_backend() {
        let backend = Backend::default();
        assert!(NormalizedBackend::from_backend(&backend).is_none());
    }

    #[test]
    fn test_host_defaults_port_80() {
        let server = ServerInstance::new(Server {
            name: "a.internal".into(),
            ..Default::default()
        });
        assert_eq!(server.host(), "a.internal:80");
        assert_eq!(server.id(), "a.internal:0");
    }

    #[test]
    fn test_protocol_precedence() {
        let base = Service {
            protocol: "https".into(),
            ..Default::default()
        };
        let own = ServerInstance::new(Server {
            name: "a".into(),
            protocol: "http".into(),
            ..Default::default()
        });
        let inherit = ServerInstance::new(Server {
            name: "b".into(),
            ..Default::default()
        });
        assert_eq!(own.protocol(&base), "http");
        assert_eq!(inherit.protocol(&base), "https");
        assert_eq!(inherit.protocol(&Service::default()), "http");
    }

    #[test]
    fn test_eligibility_tracks_disabled_and_liveness() {
        let server = ServerInstance::new(Server {
            name: "a".into(),
            ..Default::default()
        });
        assert!(server.is_eligible());
        server.set_healthy(false);
        assert!(!server.is_eligible());
        server.set_healthy(true);

        let disabled = ServerInstance::new(Server {
            name: "b".into(),
            disabled: true,
            ..Default::default()
        });
        assert!(!disabled.is_eligible());
    }

    #[test]
    fn test_effective_config_merges_health_check() {
        let base = Service {
            health_check: HealthCheck {
                enable: true,
                path: "/ping".into(),
                interval: 30,
                ..Default::default()
            },
            ..Default::default()
        };
        let server = ServerInstance::new(Server {
            name: "a".into(),
            health_check: Some(HealthCheck {
                interval: 5,
                ..Default::default()
            }),
            ..Default::default()
        });

        let effective = server.effective_config(&base);
        assert!(effective.health_check.enable);
        assert_eq!(effective.health_check.path, "/ping");
        assert_eq!(effective.health_check.interval, 5);
    }
}
