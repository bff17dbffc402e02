use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::settings::Settings;
use crate::proxy::http_handler::GatewayHandler;

/// Plain-TCP accept loop feeding every connection into the request
/// pipeline.
pub struct GatewayServer {
    settings: Arc<Settings>,
    handler: Arc<GatewayHandler>,
}

impl GatewayServer {
    pub fn new(settings: Arc<Settings>, handler: Arc<GatewayHandler>) -> Self {
        Self { settings, handler }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.settings.port).parse()?;
        let listener = bind_tcp_listener(addr, self.settings.backlog)?;
        let listener = TcpListener::from_std(listener)?;
        info!(addr = %addr, backlog = self.settings.backlog, "gateway listening");

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(error = %err, "failed to accept connection");
                    continue;
                }
            };

            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler.handle(req, peer_addr).await) }
                });

                if let Err(err) = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await
                {
                    debug!(peer = %peer_addr, error = %err, "connection ended with error");
                }
            });
        }
    }
}

/// TCP listener with SO_REUSEADDR / SO_REUSEPORT so restarts do not trip
/// over lingering sockets. The accept backlog comes from the gateway's
/// `backlog` setting.
fn bind_tcp_listener(addr: SocketAddr, backlog: u32) -> anyhow::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    Ok(socket.into())
}
