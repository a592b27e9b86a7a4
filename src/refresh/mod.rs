//! Token refresh against OAuth providers
//!
//! Exchanges refresh tokens for new access credentials and classifies
//! failures at the boundary so both the request-time middleware and the
//! periodic watcher share one decision table.

pub mod coordinator;

use crate::config::OAuthConfig;
use crate::error::RefreshError;
use crate::model::{InstanceCredentials, RefreshedToken};
use crate::storage::CredentialStore;
use crate::{GatewayError, Result};
use oauth2::{
    AuthUrl, ClientId, ClientSecret, RefreshToken, TokenResponse, TokenUrl, basic::BasicClient,
};
use std::sync::Arc;
use uuid::Uuid;

pub use coordinator::{RefreshCoordinator, RefreshKind};

/// Stateless refresh-token exchanger
///
/// Holds only the HTTP client; provider endpoints and client
/// credentials arrive per call from the backing store.
#[derive(Clone)]
pub struct TokenRefresher {
    http_client: reqwest::Client,
}

impl TokenRefresher {
    /// Create a refresher with a bounded request timeout.
    ///
    /// Redirects are disabled to prevent token interception; a timed-out
    /// exchange is classified as a transient network error.
    pub fn new(config: &OAuthConfig) -> Result<Self> {
        let http_client = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(config.refresh_timeout_secs))
            .build()
            .map_err(|e| {
                GatewayError::config(format!("Failed to build HTTP client for OAuth: {}", e))
            })?;
        Ok(Self { http_client })
    }

    /// Exchange a refresh token for new access credentials
    pub async fn refresh(
        &self,
        creds: &InstanceCredentials,
        refresh_token: &str,
    ) -> std::result::Result<RefreshedToken, RefreshError> {
        // The auth endpoint is unused on this path but the client
        // builder requires one; fall back to the token URL.
        let auth_url = creds.auth_url.as_deref().unwrap_or(&creds.token_url);

        let client = BasicClient::new(ClientId::new(creds.client_id.clone()))
            .set_client_secret(ClientSecret::new(creds.client_secret.clone()))
            .set_auth_uri(
                AuthUrl::new(auth_url.to_string())
                    .map_err(|e| RefreshError::InvalidRequest(format!("invalid auth URL: {}", e)))?,
            )
            .set_token_uri(TokenUrl::new(creds.token_url.clone()).map_err(|e| {
                RefreshError::InvalidRequest(format!("invalid token URL: {}", e))
            })?);

        let token_result = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http_client)
            .await
            .map_err(classify_token_error)?;

        Ok(RefreshedToken {
            access_token: token_result.access_token().secret().clone(),
            refresh_token: token_result.refresh_token().map(|t| t.secret().clone()),
            expires_in: token_result
                .expires_in()
                .map(|d| d.as_secs())
                .unwrap_or(3600),
            scope: token_result.scopes().map(|scopes| {
                scopes
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            }),
        })
    }
}

/// Map the oauth2 crate's error shape onto the gateway taxonomy
fn classify_token_error<RE>(
    err: oauth2::RequestTokenError<RE, oauth2::basic::BasicErrorResponse>,
) -> RefreshError
where
    RE: std::error::Error + 'static,
{
    use oauth2::RequestTokenError;
    use oauth2::basic::BasicErrorResponseType;

    match err {
        RequestTokenError::ServerResponse(response) => {
            let detail = response
                .error_description()
                .map(|d| d.to_string())
                .unwrap_or_else(|| response.error().to_string());
            match response.error() {
                BasicErrorResponseType::InvalidGrant => RefreshError::InvalidGrant(detail),
                BasicErrorResponseType::InvalidClient => RefreshError::InvalidClient(detail),
                BasicErrorResponseType::InvalidRequest
                | BasicErrorResponseType::InvalidScope
                | BasicErrorResponseType::UnauthorizedClient
                | BasicErrorResponseType::UnsupportedGrantType => {
                    RefreshError::InvalidRequest(detail)
                }
                BasicErrorResponseType::Extension(code) => {
                    RefreshError::Unknown(format!("{}: {}", code, detail))
                }
            }
        }
        // Connection failures and timeouts
        RequestTokenError::Request(e) => RefreshError::Network(e.to_string()),
        // 5xx pages and malformed bodies land here
        RequestTokenError::Parse(e, _) => RefreshError::ServiceUnavailable(e.to_string()),
        RequestTokenError::Other(msg) => RefreshError::Unknown(msg),
    }
}

/// Capability interface one external service plugs into the engine
///
/// A single generic engine is parameterized by adapters instead of
/// cloning the cache/watcher/session subsystem per service.
#[async_trait::async_trait]
pub trait ServiceAdapter: Send + Sync {
    /// Service this adapter speaks for, or "*" for the generic fallback
    fn service_name(&self) -> &str;

    /// Fetch the instance row (client credentials, persisted tokens)
    async fn lookup_credentials(
        &self,
        instance_id: Uuid,
        service_name: &str,
    ) -> Result<Option<InstanceCredentials>>;

    /// Exchange the refresh token with the provider
    async fn refresh(
        &self,
        creds: &InstanceCredentials,
        refresh_token: &str,
    ) -> std::result::Result<RefreshedToken, RefreshError>;
}

/// Generic OAuth2 adapter: store-backed lookup plus the standard
/// refresh-token exchange. Covers every service whose provider follows
/// RFC 6749; services with bespoke token endpoints register their own.
pub struct OAuth2Adapter {
    store: Arc<dyn CredentialStore>,
    refresher: TokenRefresher,
}

impl OAuth2Adapter {
    pub fn new(store: Arc<dyn CredentialStore>, refresher: TokenRefresher) -> Self {
        Self { store, refresher }
    }
}

#[async_trait::async_trait]
impl ServiceAdapter for OAuth2Adapter {
    fn service_name(&self) -> &str {
        "*"
    }

    async fn lookup_credentials(
        &self,
        instance_id: Uuid,
        service_name: &str,
    ) -> Result<Option<InstanceCredentials>> {
        self.store
            .lookup_instance_credentials(instance_id, service_name)
            .await
    }

    async fn refresh(
        &self,
        creds: &InstanceCredentials,
        refresh_token: &str,
    ) -> std::result::Result<RefreshedToken, RefreshError> {
        self.refresher.refresh(creds, refresh_token).await
    }
}

#[cfg(test)]
mod refresh_test {
    include!("refresh_test.rs");
}
