use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Request-path failures. Each kind maps onto the HTTP status the gateway
/// returns to the client; none of them terminate the process.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("route not found")]
    RouteNotFound,

    #[error("unsupported path type: {0}")]
    UnsupportedPathType(String),

    #[error("no backend configured")]
    NoBackendConfigured,

    #[error("no healthy servers available")]
    NoHealthyServer,

    #[error("service unavailable")]
    DnsFailure(String),

    #[error("{message}")]
    RateLimitExceeded {
        message: String,
        limit: i64,
        /// Unix seconds at which the current window resets.
        reset: i64,
        /// Seconds until reset, clamped to >= 0.
        retry_after: i64,
        /// Custom response headers from the rate-limit config.
        headers: Vec<(String, String)>,
    },

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            // Unsupported path types are classified as routing failures.
            GatewayError::RouteNotFound | GatewayError::UnsupportedPathType(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::NoBackendConfigured
            | GatewayError::NoHealthyServer
            | GatewayError::DnsFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render the error as the client-facing response.
    pub fn into_response(self) -> Response<Full<Bytes>> {
        match self {
            GatewayError::RateLimitExceeded {
                message,
                limit,
                reset,
                retry_after,
                headers,
            } => {
                let mut builder = Response::builder()
                    .status(StatusCode::TOO_MANY_REQUESTS)
                    .header("X-RateLimit-Limit", limit.to_string())
                    .header("X-RateLimit-Remaining", "0")
                    .header("X-RateLimit-Reset", reset.to_string())
                    .header("Retry-After", retry_after.to_string());
                for (name, value) in &headers {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                builder
                    .body(Full::new(Bytes::from(message)))
                    .unwrap_or_else(|_| canned(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests"))
            }
            other => {
                let status = other.status();
                canned(status, &other.to_string())
            }
        }
    }
}

fn canned(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response")
}
