mod config;
mod error;
mod load_balancer;
mod models;
mod plugin;
mod proxy;
mod storage;

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::settings::{CacheConfig, Settings};
use crate::load_balancer::Manager;
use crate::proxy::health_check::HealthCheckManager;
use crate::proxy::http_handler::GatewayHandler;
use crate::proxy::server::GatewayServer;

/// An easy self-hosted API gateway.
#[derive(Parser, Debug)]
#[command(name = "api-gateway", version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/etc/api-gateway/config.yaml")]
    config: String,

    /// Port to listen on; overrides the configuration file.
    #[arg(short, long)]
    port: Option<u16>,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,api_gateway=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

async fn connect_redis(cache: &CacheConfig) -> anyhow::Result<redis::aio::ConnectionManager> {
    let client = redis::Client::open(cache.url())?;
    Ok(client.get_connection_manager().await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    // ---------------------------------------------------------------
    // 1. Configuration
    // ---------------------------------------------------------------
    let mut settings = Settings::load(&cli.config)?;
    if let Some(port) = cli.port {
        settings.port = port;
    }
    let settings = Arc::new(settings);

    info!("starting api-gateway");
    info!(config = %cli.config, routes = settings.routes.len(), "configuration loaded");

    // ---------------------------------------------------------------
    // 2. Shared KV (route-decision cache + redis rate-limit storage)
    // ---------------------------------------------------------------
    let redis = if settings.cache.configured() {
        match connect_redis(&settings.cache).await {
            Ok(conn) => {
                info!(host = %settings.cache.host, port = settings.cache.port, "cache connected");
                Some(conn)
            }
            Err(err) => {
                warn!(error = %err, "cache unavailable, using in-process state");
                None
            }
        }
    } else {
        None
    };

    // ---------------------------------------------------------------
    // 3. Gateway stack
    // ---------------------------------------------------------------
    let lb_manager = Arc::new(Manager::new(Arc::new(HealthCheckManager::new(
        settings.healthcheck.inner.clone(),
    ))));
    let health = lb_manager.health();
    let handler = Arc::new(GatewayHandler::from_settings(
        settings.clone(),
        lb_manager,
        redis,
    )?);

    // ---------------------------------------------------------------
    // 4. Background health checks, one probe loop per backend
    // ---------------------------------------------------------------
    for entry in handler.router().entries() {
        if let Some(backend) = &entry.backend {
            health.start(backend.clone());
        }
    }

    // ---------------------------------------------------------------
    // 5. Serve until failure or Ctrl+C
    // ---------------------------------------------------------------
    let server = GatewayServer::new(settings.clone(), handler);

    let result = tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    };

    health.stop_all();
    result
}
