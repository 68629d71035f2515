//! Private Channel Authentication
//!
//! The private endpoint authenticates during the WebSocket handshake: every
//! connection attempt carries `Authorization: Bearer <token>` with a token
//! fetched fresh from the [`CredentialProvider`]. Tokens are never reused
//! across attempts.
//!
//! # Failure Handling
//!
//! - No token available: the private channel is parked until one appears
//! - HTTP 401 on handshake or an `INVALID_AUTH` fault: the provider is asked
//!   to refresh; if it cannot, the channel is parked

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use crate::application::ports::{BearerToken, CredentialProvider};

// =============================================================================
// Error Types
// =============================================================================

/// Errors obtaining or using a private-channel credential.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Provider has no valid token.
    #[error("no credential available")]
    Unavailable,

    /// Provider returned a blank token.
    #[error("credential is blank")]
    BlankToken,

    /// The exchange rejected the token and no refresh is possible.
    #[error("credential rejected by exchange")]
    Rejected,
}

impl AuthError {
    /// Label for logs and status reporting.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::BlankToken => "blank",
            Self::Rejected => "rejected",
        }
    }
}

// =============================================================================
// Handshake Headers
// =============================================================================

/// Build the handshake headers for a bearer token.
///
/// # Errors
///
/// Returns `BlankToken` if the token is empty.
pub fn bearer_headers(token: &BearerToken) -> Result<Vec<(String, String)>, AuthError> {
    if token.is_empty() {
        return Err(AuthError::BlankToken);
    }
    Ok(vec![(
        "Authorization".to_string(),
        format!("Bearer {}", token.expose()),
    )])
}

/// Fetch a fresh token and turn it into handshake headers.
///
/// # Errors
///
/// Returns `Unavailable` or `BlankToken`.
pub async fn fresh_headers(
    provider: &dyn CredentialProvider,
) -> Result<Vec<(String, String)>, AuthError> {
    let token = provider
        .get_valid_token()
        .await
        .ok_or(AuthError::Unavailable)?;
    bearer_headers(&token)
}

// =============================================================================
// Providers
// =============================================================================

/// Provider for hosts without account access. The private channel never
/// connects.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn get_valid_token(&self) -> Option<BearerToken> {
        None
    }

    async fn force_refresh(&self) -> bool {
        false
    }
}

/// Provider holding a token set by the host. Useful for pre-minted tokens
/// and tests.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    token: RwLock<Option<BearerToken>>,
}

impl StaticCredentials {
    /// Create a provider, optionally with a token.
    #[must_use]
    pub fn new(token: Option<BearerToken>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    /// Replace the token.
    pub fn set(&self, token: BearerToken) {
        *self.token.write() = Some(token);
    }

    /// Remove the token.
    pub fn clear(&self) {
        *self.token.write() = None;
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_valid_token(&self) -> Option<BearerToken> {
        self.token.read().clone()
    }

    /// A static token cannot be re-minted; a rejected one is dropped.
    async fn force_refresh(&self) -> bool {
        self.clear();
        false
    }
}

// =============================================================================
// Tests
// =============================================================================
