//! Mock token verifier for tests.
//!
//! # Example
//!
//! ```ignore
//! let verifier = MockTokenVerifier::new().with_token("token-a", "alice");
//! let user = verifier.verify("token-a").await?;
//! ```

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::domain::foundation::{AuthError, UserId};
use crate::ports::TokenVerifier;

/// Stores a map of tokens to users. Unknown tokens return `InvalidToken`.
#[derive(Debug, Default)]
pub struct MockTokenVerifier {
    tokens: RwLock<HashMap<String, UserId>>,
    /// Optional error to return for all verifications (for error testing)
    force_error: RwLock<Option<AuthError>>,
}

impl MockTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a token that verifies as `user_id`.
    pub fn with_token(self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.add_token(token, user_id);
        self
    }

    /// Forces all verifications to return the specified error.
    pub fn with_error(self, error: AuthError) -> Self {
        *self.force_error.write().unwrap() = Some(error);
        self
    }

    pub fn clear_error(&self) {
        *self.force_error.write().unwrap() = None;
    }

    /// Registers a token at runtime.
    pub fn add_token(&self, token: impl Into<String>, user_id: impl Into<String>) {
        let user = UserId::new(user_id).unwrap();
        self.tokens.write().unwrap().insert(token.into(), user);
    }

    pub fn remove_token(&self, token: &str) {
        self.tokens.write().unwrap().remove(token);
    }
}

#[async_trait]
impl TokenVerifier for MockTokenVerifier {
    async fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        if let Some(error) = self.force_error.read().unwrap().clone() {
            return Err(error);
        }
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        self.tokens
            .read()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn known_token_verifies() {
        let verifier = MockTokenVerifier::new().with_token("t1", "alice");
        assert_eq!(verifier.verify("t1").await.unwrap().as_str(), "alice");
        assert_eq!(
            verifier.verify("t2").await.unwrap_err(),
            AuthError::InvalidToken
        );
    }

    #[tokio::test]
    async fn forced_error_wins() {
        let verifier = MockTokenVerifier::new()
            .with_token("t1", "alice")
            .with_error(AuthError::service_unavailable("down"));
        assert!(matches!(
            verifier.verify("t1").await,
            Err(AuthError::ServiceUnavailable(_))
        ));
        verifier.clear_error();
        assert!(verifier.verify("t1").await.is_ok());
    }
}
