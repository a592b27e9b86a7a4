//! Error types for Portico
//!
//! This module provides a comprehensive error hierarchy using thiserror.
//! All errors can be converted to GatewayError for unified error handling.

use thiserror::Error;

/// Main error type for gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Token invalid: {0}")]
    TokenInvalid(String),

    #[error("Provider temporarily unavailable: {0}")]
    TransientProvider(String),

    #[error("Cache consistency violation: {0}")]
    CacheConsistency(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Refresh error: {0}")]
    Refresh(#[from] RefreshError),

    #[error("Session error: {0}")]
    Session(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("UUID parse error: {0}")]
    UuidParse(#[from] uuid::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

// Implement From for sqlx::Error
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        GatewayError::Storage(StorageError::from(err))
    }
}

// Implement From for uuid::Error through StorageError
impl From<uuid::Error> for GatewayError {
    fn from(err: uuid::Error) -> Self {
        GatewayError::Storage(StorageError::UuidParse(err))
    }
}

/// Classified failure modes of a provider token refresh
///
/// Classification happens at the refresh boundary so the request-time
/// middleware and the periodic watcher share one decision table for
/// "retry vs. evict vs. escalate".
#[derive(Error, Debug)]
pub enum RefreshError {
    /// Refresh token rejected by the provider. Terminal for the
    /// instance; requires the user to re-authenticate.
    #[error("refresh token rejected by provider: {0}")]
    InvalidGrant(String),

    /// Client credentials rejected. Operator-visible misconfiguration.
    #[error("client credentials rejected by provider: {0}")]
    InvalidClient(String),

    /// Malformed refresh request. Terminal misconfiguration.
    #[error("refresh request rejected by provider: {0}")]
    InvalidRequest(String),

    /// Network-level failure or timeout. Eligible for bounded retry.
    #[error("network error during refresh: {0}")]
    Network(String),

    /// Provider returned an unusable response (5xx, malformed body).
    #[error("provider unavailable: {0}")]
    ServiceUnavailable(String),

    /// Anything else. Treated conservatively as non-retryable.
    #[error("unclassified refresh error: {0}")]
    Unknown(String),
}

impl RefreshError {
    /// Terminal errors must evict the cache entry and trigger
    /// re-authentication rather than being retried.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RefreshError::InvalidGrant(_)
                | RefreshError::InvalidClient(_)
                | RefreshError::InvalidRequest(_)
        )
    }

    /// Transient errors may be retried by the next watcher cycle or
    /// the next request.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RefreshError::Network(_) | RefreshError::ServiceUnavailable(_)
        )
    }
}

/// Convenient result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Create a configuration error
    #[inline]
    pub fn config<S: Into<String>>(msg: S) -> Self {
        GatewayError::Config(msg.into())
    }

    /// Create a not found error
    #[inline]
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        GatewayError::NotFound(msg.into())
    }

    /// Create an authorization error
    #[inline]
    pub fn authorization<S: Into<String>>(msg: S) -> Self {
        GatewayError::Authorization(msg.into())
    }

    /// Create a token invalid error
    #[inline]
    pub fn token_invalid<S: Into<String>>(msg: S) -> Self {
        GatewayError::TokenInvalid(msg.into())
    }

    /// Create a transient provider error
    #[inline]
    pub fn transient<S: Into<String>>(msg: S) -> Self {
        GatewayError::TransientProvider(msg.into())
    }

    /// Create a cache consistency error
    #[inline]
    pub fn cache_consistency<S: Into<String>>(msg: S) -> Self {
        GatewayError::CacheConsistency(msg.into())
    }

    /// Create a storage error
    #[inline]
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        GatewayError::Storage(StorageError::Database(msg.into()))
    }

    /// Create a session error
    #[inline]
    pub fn session<S: Into<String>>(msg: S) -> Self {
        GatewayError::Session(msg.into())
    }
}
