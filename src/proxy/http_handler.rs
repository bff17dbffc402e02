use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, error, info, warn};

use crate::config::service::Service;
use crate::config::settings::Settings;
use crate::error::GatewayError;
use crate::load_balancer::{ConnectionGuard, Manager};
use crate::models::backend::ServerInstance;
use crate::models::request::RequestContext;
use crate::plugin::rate_limit::extractor::client_ip;
use crate::plugin::rate_limit::RateLimitPlugin;
use crate::plugin::Plugin;
use crate::proxy::router::Router;
use crate::storage::cache::{KvCache, MemoryCache, RedisCache};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Inbound headers never forwarded upstream: identity headers the gateway
/// sets itself, hop-by-hop headers, and the lengths hyper recomputes.
const SKIP_HEADERS: &[&str] = &[
    "host",
    "x-forwarded-for",
    "x-real-ip",
    "x-forwarded-proto",
    "x-forwarded-host",
    "x-forwarded-port",
    "transfer-encoding",
    "connection",
    "content-length",
];

/// Core request pipeline: liveness short-circuit, base-URI gate, route
/// match, plugin chain, server selection, rewrite, forward, response
/// transform.
pub struct GatewayHandler {
    settings: Arc<Settings>,
    router: Arc<Router>,
    lb_manager: Arc<Manager>,
    plugins: Vec<Arc<dyn Plugin>>,
    upstream_client: HyperClient<HttpConnector, Full<Bytes>>,
}

impl GatewayHandler {
    pub fn new(
        settings: Arc<Settings>,
        router: Arc<Router>,
        lb_manager: Arc<Manager>,
        redis: Option<redis::aio::ConnectionManager>,
    ) -> Self {
        let upstream_client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(std::time::Duration::from_secs(30))
            .pool_max_idle_per_host(128)
            .build_http();

        let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();
        if RateLimitPlugin::required(&settings) {
            plugins.push(Arc::new(RateLimitPlugin::new(&settings, redis)));
            info!("rate limit plugin enabled");
        }

        Self {
            settings,
            router,
            lb_manager,
            plugins,
            upstream_client,
        }
    }

    /// Build the full gateway stack from settings: decision cache (redis
    /// when a cache host is configured), router, balancer manager, plugins.
    pub fn from_settings(
        settings: Arc<Settings>,
        lb_manager: Arc<Manager>,
        redis: Option<redis::aio::ConnectionManager>,
    ) -> Result<Self, GatewayError> {
        let cache: Arc<dyn KvCache> = match &redis {
            Some(conn) => Arc::new(RedisCache::new(
                conn.clone(),
                settings.cache.resolved_prefix().to_string(),
            )),
            None => MemoryCache::new(),
        };

        let router = Arc::new(Router::new(&settings.routes, &settings.backend, cache)?);
        Ok(Self::new(settings, router, lb_manager, redis))
    }

    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    /// Process a single inbound request end-to-end. Every response leaves
    /// with the X-Powered-By stamp, error paths included.
    pub async fn handle<B>(&self, req: Request<B>, peer_addr: SocketAddr) -> Response<Full<Bytes>>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let mut response = self.dispatch(req, peer_addr).await;
        set_header(
            &mut response,
            "X-Powered-By",
            &format!("gozoox-api-gateway/{VERSION}"),
        );
        response
    }

    async fn dispatch<B>(&self, req: Request<B>, peer_addr: SocketAddr) -> Response<Full<Bytes>>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let method = req.method().to_string();
        let mut path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();

        // Liveness endpoint answers ahead of routing.
        let outer = &self.settings.healthcheck.outer;
        if outer.enable && path == outer.path && outer.ok {
            return text_response(StatusCode::OK, "ok");
        }

        // Base-URI gate: foreign prefixes are not served, matching
        // requests are matched against the stripped path.
        if !self.settings.baseuri.is_empty() {
            match path.strip_prefix(&self.settings.baseuri) {
                Some(stripped) => path = stripped.to_string(),
                None => {
                    debug!(path = %path, baseuri = %self.settings.baseuri, "outside base uri");
                    return text_response(StatusCode::NOT_FOUND, "Not Found");
                }
            }
        }

        let route = match self.router.resolve(&path).await {
            Ok(route) => route,
            Err(err) => {
                // Every matcher failure is a routing failure to the client.
                error!(path = %path, error = %err, "failed to match route");
                return text_response(StatusCode::NOT_FOUND, &err.to_string());
            }
        };

        let Some(backend) = route.backend.clone() else {
            error!(path = %path, route = %route.name, "no backend configured");
            return GatewayError::NoBackendConfigured.into_response();
        };

        let mut ctx = RequestContext::new(method.clone(), path.clone(), query, peer_addr);
        ctx.headers = collect_headers(&req);
        ctx.client_ip = client_ip(&ctx);

        for plugin in &self.plugins {
            if let Err(err) = plugin.on_request(&mut ctx).await {
                debug!(plugin = plugin.name(), error = %err, "request rejected by plugin");
                return err.into_response();
            }
        }

        let lb = self.lb_manager.get(&backend.algorithm);
        let server = match lb.select(&ctx.client_ip, &backend) {
            Ok(server) => server,
            Err(err) => {
                error!(path = %path, route = %route.name, error = %err, "failed to select server");
                return err.into_response();
            }
        };

        let effective = server.effective_config(&backend.base);

        // The upstream must resolve before we commit a connection slot.
        let host = server.host();
        if !resolves(&host).await {
            error!(server = %server.id(), "dns resolution failed");
            return GatewayError::DnsFailure(host).into_response();
        }

        // Holds the least-connections slot for exactly the lifetime of this
        // request future, including cancellation.
        let _guard = if backend.algorithm == "least-connections" {
            Some(ConnectionGuard::new(
                lb.clone(),
                backend.clone(),
                server.clone(),
            ))
        } else {
            None
        };

        let override_rules = server
            .config
            .request
            .as_ref()
            .and_then(|r| r.path.rewrites.clone());
        let rewritten = route.rewrite(
            &path,
            effective.request.path.disable_prefix_rewrite,
            override_rules.as_ref(),
        );

        info!(
            route = %route.name,
            method = %method,
            path = %path,
            target = %server.target(&backend.base),
            rewritten = %rewritten,
            algorithm = %backend.algorithm,
            "forwarding request"
        );

        let mut response = match self
            .forward(req, &ctx, &effective, &server, &rewritten)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                error!(server = %server.id(), error = %err, "upstream request failed");
                return err.into_response();
            }
        };

        for (name, value) in &effective.response.headers {
            set_header(&mut response, name, value);
        }

        for plugin in &self.plugins {
            if let Err(err) = plugin.on_response(&ctx, &mut response).await {
                warn!(plugin = plugin.name(), error = %err, "response rejected by plugin");
                return err.into_response();
            }
        }

        response
    }

    /// Rebuild the request against the chosen server and send it through
    /// the pooled client.
    async fn forward<B>(
        &self,
        req: Request<B>,
        ctx: &RequestContext,
        effective: &Service,
        server: &Arc<ServerInstance>,
        rewritten_path: &str,
    ) -> Result<Response<Full<Bytes>>, GatewayError>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let scheme = if effective.protocol.is_empty() {
            "http"
        } else {
            effective.protocol.as_str()
        };

        let query = merged_query(&ctx.query, &effective.request.query);
        let uri = match &query {
            Some(q) => format!("{scheme}://{}{rewritten_path}?{q}", server.host()),
            None => format!("{scheme}://{}{rewritten_path}", server.host()),
        };

        let method = hyper::Method::from_bytes(ctx.method.as_bytes())
            .map_err(|_| GatewayError::Upstream(format!("invalid method {:?}", ctx.method)))?;

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                warn!(error = %err, "failed to read request body");
                Bytes::new()
            }
        };

        let mut upstream_req = Request::builder()
            .method(method)
            .uri(uri.as_str())
            .body(Full::new(body))
            .map_err(|err| GatewayError::Upstream(err.to_string()))?;

        {
            let headers = upstream_req.headers_mut();
            for (name, value) in &ctx.headers {
                if SKIP_HEADERS.contains(&name.as_str()) {
                    continue;
                }
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    headers.insert(name, value);
                }
            }

            if let Ok(ip) = HeaderValue::from_str(&ctx.client_ip) {
                headers.insert("X-Forwarded-For", ip.clone());
                headers.insert("X-Real-IP", ip);
            }

            // Configured overrides replace whatever the client sent.
            for (name, value) in &effective.request.headers {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    headers.insert(name, value);
                }
            }
        }

        let upstream_resp = self
            .upstream_client
            .request(upstream_req)
            .await
            .map_err(|err| GatewayError::Upstream(err.to_string()))?;

        let (parts, incoming) = upstream_resp.into_parts();
        let body = incoming
            .collect()
            .await
            .map_err(|err| GatewayError::Upstream(err.to_string()))?
            .to_bytes();

        Ok(Response::from_parts(parts, Full::new(body)))
    }
}

fn collect_headers<B>(req: &Request<B>) -> HashMap<String, String> {
    req.headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or("").to_string(),
            )
        })
        .collect()
}

async fn resolves(host: &str) -> bool {
    match tokio::net::lookup_host(host).await {
        Ok(mut addrs) => addrs.next().is_some(),
        Err(_) => false,
    }
}

/// Merge configured query overrides into the inbound query string, the
/// override winning per key. Returns `None` when the result is empty.
fn merged_query(original: &str, overrides: &HashMap<String, String>) -> Option<String> {
    if original.is_empty() && overrides.is_empty() {
        return None;
    }

    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(original.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    for (key, value) in overrides {
        match pairs.iter_mut().find(|(k, _)| k == key) {
            Some(pair) => pair.1 = value.clone(),
            None => pairs.push((key.clone(), value.clone())),
        }
    }

    if pairs.is_empty() {
        return None;
    }

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in &pairs {
        serializer.append_pair(k, v);
    }
    Some(serializer.finish())
}

fn set_header(response: &mut Response<Full<Bytes>>, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        response.headers_mut().insert(name, value);
    }
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::Settings;
    use crate::proxy::health_check::HealthCheckManager;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Minimal upstream that answers 200 and echoes the request head in
    /// the body, so tests can assert on the forwarded path and headers.
    async fn spawn_echo_upstream() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    let head = String::from_utf8_lossy(&buf[..n]).to_string();
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        head.len(),
                        head
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    fn handler_for(yaml: &str) -> GatewayHandler {
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        settings.validate().unwrap();
        let settings = Arc::new(settings);
        let health = Arc::new(HealthCheckManager::new(settings.healthcheck.inner.clone()));
        let lb_manager = Arc::new(Manager::new(health));
        GatewayHandler::from_settings(settings, lb_manager, None).unwrap()
    }

    fn request(path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method("GET")
            .uri(path)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:55555".parse().unwrap()
    }

    async fn body_text(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&bytes).to_string()
    }

    #[tokio::test]
    async fn test_forwards_with_prefix_stripped() {
        let upstream = spawn_echo_upstream().await;
        let handler = handler_for(&format!(
            r#"
routes:
  - name: api
    path: /api
    backend:
      service:
        name: {}
        port: {}
"#,
            upstream.ip(),
            upstream.port()
        ));

        let response = handler.handle(request("/api/x"), peer()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["X-Powered-By"],
            format!("gozoox-api-gateway/{VERSION}")
        );
        let head = body_text(response).await;
        assert!(head.starts_with("GET /x HTTP/1.1"), "head: {head}");
    }

    #[tokio::test]
    async fn test_outer_liveness_short_circuits() {
        let handler = handler_for(
            r#"
healthcheck:
  outer:
    enable: true
    path: /healthz
    ok: true
"#,
        );

        let response = handler.handle(request("/healthz"), peer()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }

    #[tokio::test]
    async fn test_unmatched_path_is_404() {
        let handler = handler_for(
            r#"
routes:
  - name: api
    path: /api
    backend:
      service:
        name: api.internal
"#,
        );

        let response = handler.handle(request("/nope"), peer()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_no_healthy_server_is_503() {
        let handler = handler_for(
            r#"
routes:
  - name: api
    path: /api
    backend:
      service:
        name: 127.0.0.1
        port: 1
"#,
        );
        // Flip the only server down, as the probe loop would.
        let entries = handler.router().entries();
        entries[0].backend.as_ref().unwrap().servers[0].set_healthy(false);

        let response = handler.handle(request("/api/x"), peer()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_502() {
        // Bind then drop for a dead port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let handler = handler_for(&format!(
            r#"
routes:
  - name: api
    path: /api
    backend:
      service:
        name: {}
        port: {}
"#,
            dead.ip(),
            dead.port()
        ));

        let response = handler.handle(request("/api/x"), peer()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_503() {
        let handler = handler_for(
            r#"
routes:
  - name: api
    path: /api
    backend:
      service:
        name: does-not-resolve.invalid
        port: 80
"#,
        );

        let response = handler.handle(request("/api/x"), peer()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_text(response).await, "service unavailable");
    }

    #[tokio::test]
    async fn test_header_and_query_overrides_forwarded() {
        let upstream = spawn_echo_upstream().await;
        let handler = handler_for(&format!(
            r#"
routes:
  - name: api
    path: /api
    backend:
      service:
        name: {}
        port: {}
        request:
          headers:
            X-Env: prod
          query:
            token: sekrit
"#,
            upstream.ip(),
            upstream.port()
        ));

        let response = handler.handle(request("/api/x?a=1"), peer()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let head = body_text(response).await;
        assert!(head.contains("x-env: prod") || head.contains("X-Env: prod"), "head: {head}");
        assert!(head.contains("a=1"), "head: {head}");
        assert!(head.contains("token=sekrit"), "head: {head}");
    }

    #[tokio::test]
    async fn test_response_header_overrides_applied() {
        let upstream = spawn_echo_upstream().await;
        let handler = handler_for(&format!(
            r#"
routes:
  - name: api
    path: /api
    backend:
      service:
        name: {}
        port: {}
        response:
          headers:
            X-Served-By: edge
"#,
            upstream.ip(),
            upstream.port()
        ));

        let response = handler.handle(request("/api/x"), peer()).await;
        assert_eq!(response.headers()["X-Served-By"], "edge");
    }

    #[tokio::test]
    async fn test_global_rate_limit_returns_429_on_sixth_request() {
        let upstream = spawn_echo_upstream().await;
        let handler = handler_for(&format!(
            r#"
routes:
  - name: api
    path: /api
    backend:
      service:
        name: {}
        port: {}
rate_limit:
  enable: true
  algorithm: fixed-window
  key_type: ip
  limit: 5
  window: 60
"#,
            upstream.ip(),
            upstream.port()
        ));

        for i in 0..5 {
            let response = handler.handle(request("/api/x"), peer()).await;
            assert_eq!(response.status(), StatusCode::OK, "request {i}");
            assert_eq!(
                response.headers()["X-RateLimit-Remaining"],
                (4 - i).to_string()
            );
        }

        let response = handler.handle(request("/api/x"), peer()).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["X-RateLimit-Remaining"], "0");
        let retry_after: i64 = response.headers()["Retry-After"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after > 0);
    }

    #[tokio::test]
    async fn test_baseuri_gates_and_strips() {
        let upstream = spawn_echo_upstream().await;
        let handler = handler_for(&format!(
            r#"
baseuri: /gw
routes:
  - name: api
    path: /api
    backend:
      service:
        name: {}
        port: {}
"#,
            upstream.ip(),
            upstream.port()
        ));

        let outside = handler.handle(request("/api/x"), peer()).await;
        assert_eq!(outside.status(), StatusCode::NOT_FOUND);

        let inside = handler.handle(request("/gw/api/x"), peer()).await;
        assert_eq!(inside.status(), StatusCode::OK);
        let head = body_text(inside).await;
        assert!(head.starts_with("GET /x HTTP/1.1"), "head: {head}");
    }

    #[tokio::test]
    async fn test_default_backend_serves_unmatched_paths() {
        let upstream = spawn_echo_upstream().await;
        let handler = handler_for(&format!(
            r#"
backend:
  service:
    name: {}
    port: {}
"#,
            upstream.ip(),
            upstream.port()
        ));

        let response = handler.handle(request("/anything"), peer()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let head = body_text(response).await;
        assert!(head.starts_with("GET /anything HTTP/1.1"), "head: {head}");
    }

    #[test]
    fn test_merged_query() {
        let mut overrides = HashMap::new();
        overrides.insert("token".to_string(), "abc".to_string());

        assert_eq!(
            merged_query("a=1&token=old", &overrides).unwrap(),
            "a=1&token=abc"
        );
        assert_eq!(merged_query("", &overrides).unwrap(), "token=abc");
        assert_eq!(merged_query("", &HashMap::new()), None);
    }
}
