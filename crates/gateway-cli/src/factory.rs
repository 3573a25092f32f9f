//! Default [`UpstreamClientFactory`](gateway_upstream::UpstreamClientFactory)
//! wired for standalone/demo operation: every server's `config_template`
//! is expected to carry a `baseUrl` entry and the factory hands back an
//! [`HttpUpstreamClient`] pointed at it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gateway_types::{GatewayError, GatewayResult, Server};
use gateway_upstream::{HttpUpstreamClient, HttpUpstreamClientConfig, UpstreamClient, UpstreamClientFactory};

pub struct HttpUpstreamClientFactory {
    request_timeout: Duration,
}

impl HttpUpstreamClientFactory {
    #[must_use]
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

#[async_trait]
impl UpstreamClientFactory for HttpUpstreamClientFactory {
    async fn build(&self, server: &Server) -> GatewayResult<Arc<dyn UpstreamClient>> {
        let base_url = server
            .config_template
            .get("baseUrl")
            .cloned()
            .ok_or_else(|| {
                GatewayError::InvalidRequest(format!(
                    "server {} has no baseUrl in its config template",
                    server.server_id
                ))
            })?;
        let config = HttpUpstreamClientConfig {
            base_url,
            request_timeout: self.request_timeout,
            ..HttpUpstreamClientConfig::default()
        };
        Ok(Arc::new(HttpUpstreamClient::new(config)))
    }
}
