//! Credential Port (Driven Port)
//!
//! Source of bearer tokens for the private channel. Token minting lives
//! with the host; the multiplexer only asks for a currently valid one.

use std::fmt;

use async_trait::async_trait;

/// An opaque bearer token. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    /// Wrap a token string.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for building the `Authorization` header.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether the token is blank.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken([REDACTED])")
    }
}

/// Port for obtaining private-channel credentials.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// A token valid right now, or `None` to skip the private channel.
    async fn get_valid_token(&self) -> Option<BearerToken>;

    /// Discard any cached token after the exchange rejected it.
    ///
    /// Returns true if a new token is expected to be available.
    async fn force_refresh(&self) -> bool;
}
