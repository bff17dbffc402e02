//! Ordered request/response extension points.
//!
//! Plugins run only after routing has resolved a route: `on_request` hooks
//! fire in registration order before the upstream call, `on_response` hooks
//! after it. A plugin error terminates the request with that error's HTTP
//! status. The chain is a precomputed slice of trait objects built once at
//! startup.

pub mod rate_limit;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::Response;

use crate::error::GatewayError;
use crate::models::request::RequestContext;

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_request(&self, _ctx: &mut RequestContext) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn on_response(
        &self,
        _ctx: &RequestContext,
        _response: &mut Response<Full<Bytes>>,
    ) -> Result<(), GatewayError> {
        Ok(())
    }
}
