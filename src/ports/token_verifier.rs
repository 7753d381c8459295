//! TokenVerifier port - validates bearer credentials presented on upgrade.
//!
//! Token issuance lives elsewhere; the gateway only needs to turn a
//! credential into a verified user id.

use async_trait::async_trait;

use crate::domain::foundation::{AuthError, UserId};

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verifies `token` (without the `Bearer ` prefix).
    ///
    /// * `Err(AuthError::InvalidToken)` - malformed or bad signature
    /// * `Err(AuthError::TokenExpired)` - valid signature, expired
    /// * `Err(AuthError::ServiceUnavailable)` - verifier backend unreachable
    async fn verify(&self, token: &str) -> Result<UserId, AuthError>;
}
