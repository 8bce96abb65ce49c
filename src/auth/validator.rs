//! Inbound bearer token validation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation, decode, decode_header};
use serde_json::Value;
use tracing::debug;

use crate::auth::identity::UserIdentity;
use crate::auth::jwks::{JwksCache, JwksCacheConfig, JwksCacheError};
use crate::config::IdentityConfig;
use crate::types::SecretToken;

/// Token validation failures.
///
/// Messages never contain token material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No bearer token supplied.
    MissingToken,
    /// Not a structurally valid JWT (or not a bearer credential).
    InvalidFormat(String),
    /// `exp` is in the past beyond the clock tolerance.
    Expired,
    /// Signature did not verify, or the signing key is unknown.
    InvalidSignature(String),
    InvalidIssuer,
    InvalidAudience,
    /// Required identity claims are absent.
    MissingClaims(Vec<String>),
    /// The signing key set could not be fetched.
    NetworkError(String),
    Unknown(String),
}

impl AuthError {
    /// Stable machine-readable kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => "MISSING_TOKEN",
            Self::InvalidFormat(_) => "INVALID_FORMAT",
            Self::Expired => "EXPIRED",
            Self::InvalidSignature(_) => "INVALID_SIGNATURE",
            Self::InvalidIssuer => "INVALID_ISSUER",
            Self::InvalidAudience => "INVALID_AUDIENCE",
            Self::MissingClaims(_) => "MISSING_CLAIMS",
            Self::NetworkError(_) => "NETWORK_ERROR",
            Self::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingToken => write!(f, "Bearer token required"),
            Self::InvalidFormat(msg) => write!(f, "Malformed token: {}", msg),
            Self::Expired => write!(f, "Token has expired"),
            Self::InvalidSignature(msg) => write!(f, "Invalid token signature: {}", msg),
            Self::InvalidIssuer => write!(f, "Token issuer is not trusted"),
            Self::InvalidAudience => write!(f, "Token audience is not accepted"),
            Self::MissingClaims(claims) => {
                write!(f, "Token is missing required claims: {}", claims.join(", "))
            }
            Self::NetworkError(msg) => write!(f, "Could not fetch signing keys: {}", msg),
            Self::Unknown(msg) => write!(f, "Token validation failed: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<JwksCacheError> for AuthError {
    fn from(err: JwksCacheError) -> Self {
        match err {
            JwksCacheError::KeyNotFound(kid) => {
                Self::InvalidSignature(format!("unknown signing key {}", kid))
            }
            JwksCacheError::NoKeysAvailable => {
                Self::InvalidSignature("no signing key available".to_string())
            }
            other => Self::NetworkError(other.to_string()),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidAudience => Self::InvalidAudience,
            ErrorKind::InvalidIssuer => Self::InvalidIssuer,
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                Self::InvalidSignature(err.to_string())
            }
            ErrorKind::InvalidToken
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => Self::InvalidFormat(err.to_string()),
            ErrorKind::MissingRequiredClaim(claim) => Self::MissingClaims(vec![claim.clone()]),
            _ => Self::Unknown(err.to_string()),
        }
    }
}

/// Verifies inbound RS256 tokens against the identity provider's key set.
pub struct TokenValidator {
    jwks: Arc<JwksCache>,
    validation: Validation,
}

impl TokenValidator {
    pub fn new(config: &IdentityConfig) -> Result<Self, AuthError> {
        let jwks = JwksCache::new(JwksCacheConfig {
            jwks_url: config.jwks_url(),
            cache_ttl: std::time::Duration::from_secs(config.jwks_cache_seconds),
            min_refetch_interval: std::time::Duration::from_secs(config.min_refetch_seconds),
            allow_stale: config.allow_stale_keys,
            fetch_timeout: config.http_timeout(),
        })
        .map_err(|e| AuthError::Unknown(e.to_string()))?;

        Ok(Self::with_jwks(Arc::new(jwks), config))
    }

    /// Build a validator around an existing key cache.
    pub fn with_jwks(jwks: Arc<JwksCache>, config: &IdentityConfig) -> Self {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = config.clock_tolerance().as_secs();
        validation.validate_nbf = true;
        validation.set_audience(&config.accepted_audiences());
        validation.set_issuer(&config.accepted_issuers());
        validation.set_required_spec_claims(&["exp", "aud", "iss"]);

        Self { jwks, validation }
    }

    pub fn jwks(&self) -> &Arc<JwksCache> {
        &self.jwks
    }

    /// Validate a raw bearer token and extract the caller's identity.
    pub async fn validate(&self, bearer_token: &str) -> Result<UserIdentity, AuthError> {
        let token = bearer_token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        if token.split('.').count() != 3 {
            return Err(AuthError::InvalidFormat(
                "expected three dot-separated segments".to_string(),
            ));
        }

        let header = decode_header(token)
            .map_err(|e| AuthError::InvalidFormat(format!("invalid header: {}", e)))?;

        if header.alg != Algorithm::RS256 {
            return Err(AuthError::InvalidSignature(format!(
                "unsupported algorithm {:?}",
                header.alg
            )));
        }

        let decoding_key = self.jwks.get_key(header.kid.as_deref()).await?;

        let token_data =
            decode::<HashMap<String, Value>>(token, &decoding_key, &self.validation)?;

        let identity = UserIdentity::from_claims(token_data.claims, SecretToken::new(token))
            .map_err(|missing| {
                AuthError::MissingClaims(missing.into_iter().map(String::from).collect())
            })?;

        debug!(
            subject = %identity.subject_id(),
            tenant = %identity.tenant_id(),
            "Token validated"
        );

        Ok(identity)
    }
}
