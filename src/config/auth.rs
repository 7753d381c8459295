//! Authentication configuration

use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;

use super::error::ValidationError;

/// Minimum HS256 key length.
const MIN_SECRET_BYTES: usize = 32;

/// Bearer token verification for the gateway handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Shared HS256 signing secret
    pub jwt_secret: Secret<String>,

    /// Expected `iss` claim, checked when set
    #[serde(default)]
    pub issuer: Option<String>,
}

impl AuthConfig {
    pub fn new(jwt_secret: impl Into<String>) -> Self {
        Self {
            jwt_secret: Secret::new(jwt_secret.into()),
            issuer: None,
        }
    }

    /// Validate authentication configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        let secret = self.jwt_secret.expose_secret();
        if secret.is_empty() {
            return Err(ValidationError::MissingRequired("auth.jwt_secret"));
        }
        if secret.len() < MIN_SECRET_BYTES {
            return Err(ValidationError::SecretTooShort("auth.jwt_secret"));
        }
        if self.issuer.as_deref().is_some_and(|i| i.trim().is_empty()) {
            return Err(ValidationError::MissingRequired("auth.issuer"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_missing_secret() {
        assert_eq!(
            AuthConfig::new("").validate(),
            Err(ValidationError::MissingRequired("auth.jwt_secret"))
        );
    }

    #[test]
    fn test_validation_short_secret() {
        assert_eq!(
            AuthConfig::new("too-short").validate(),
            Err(ValidationError::SecretTooShort("auth.jwt_secret"))
        );
    }

    #[test]
    fn test_validation_blank_issuer() {
        let config = AuthConfig {
            issuer: Some("  ".to_string()),
            ..AuthConfig::new("k".repeat(32))
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = AuthConfig::new("super-secret-signing-key-0123456789");
        assert!(!format!("{:?}", config).contains("super-secret"));
    }
}
