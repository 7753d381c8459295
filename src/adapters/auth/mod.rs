//! Authentication adapters implementing the `TokenVerifier` port.
//!
//! - `jwt` - HS256 shared-secret JWT verification
//! - `mock` - test implementation that doesn't require signed tokens

mod jwt;
mod mock;

pub use jwt::{Claims, JwtTokenVerifier};
pub use mock::MockTokenVerifier;
