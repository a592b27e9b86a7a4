//! HTTP proxy handler
//!
//! Default protocol handler: forwards MCP JSON-RPC payloads to the
//! upstream service's API with the instance's current bearer token.

use super::ProtocolHandler;
use crate::model::ServiceConfig;
use crate::{GatewayError, Result};
use parking_lot::RwLock;
use std::sync::Arc;

/// Forwards protocol requests to an upstream base URL with Bearer auth
pub struct HttpProxyHandler {
    client: reqwest::Client,
    base_url: String,
    service_name: String,
    bearer_token: RwLock<String>,
}

impl HttpProxyHandler {
    pub fn new(config: &ServiceConfig, bearer_token: &str) -> Result<Self> {
        let base_url = config.base_url.clone().ok_or_else(|| {
            GatewayError::config(format!(
                "service '{}' has no base_url configured",
                config.service_name
            ))
        })?;

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            service_name: config.service_name.clone(),
            bearer_token: RwLock::new(bearer_token.to_string()),
        })
    }

    /// Factory suitable for [`super::HandlerSessionRegistry::new`]
    pub fn factory() -> super::HandlerFactory {
        Arc::new(|config: &ServiceConfig, token: &str| {
            Ok(Arc::new(HttpProxyHandler::new(config, token)?) as Arc<dyn ProtocolHandler>)
        })
    }
}

#[async_trait::async_trait]
impl ProtocolHandler for HttpProxyHandler {
    fn set_bearer_token(&self, token: &str) {
        *self.bearer_token.write() = token.to_string();
    }

    async fn handle(&self, request: serde_json::Value) -> Result<serde_json::Value> {
        let token = self.bearer_token.read().clone();
        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                GatewayError::transient(format!(
                    "upstream call to '{}' failed: {}",
                    self.service_name, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::session(format!(
                "upstream '{}' returned {}",
                self.service_name, status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| GatewayError::session(format!("invalid upstream response: {}", e)))
    }
}
