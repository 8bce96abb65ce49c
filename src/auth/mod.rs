//! Inbound token validation.
//!
//! Callers present a bearer token issued by the identity provider. The
//! [`TokenValidator`] verifies it against the provider's published signing
//! keys (cached by [`JwksCache`]) and produces a [`UserIdentity`].
//!
//! ## Security Model
//!
//! - Only RS256 tokens signed by a key in the tenant's key set are accepted
//! - Issuer and audience must match the configured values (the service's own
//!   audience, plus one legacy audience during a migration window)
//! - Expiry is enforced with a small clock-skew tolerance
//! - Token material never appears in errors, `Debug` output or logs

pub mod identity;
pub mod jwks;
mod validator;

pub use identity::{IdentitySummary, UserIdentity};
pub use jwks::{DEFAULT_CACHE_TTL_SECONDS, JwksCache, JwksCacheConfig, JwksCacheError};
pub use validator::{AuthError, TokenValidator};
