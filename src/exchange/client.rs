//! On-behalf-of token endpoint client.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::types::SecretToken;

/// Grant type for the delegated (on-behalf-of) flow.
pub const GRANT_TYPE_JWT_BEARER: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// A downstream-scoped token and its absolute expiry.
#[derive(Debug, Clone)]
pub struct ExchangedToken {
    pub token: SecretToken,
    pub expires_at: DateTime<Utc>,
}

/// Delegated exchange failures.
///
/// `Clone` so that a single outcome can be handed to every caller waiting on
/// the same in-flight exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// The user must (re-)consent or complete an interactive step.
    ConsentRequired(String),
    /// The identity provider refused the exchange.
    Rejected { error: String, description: String },
    Network(String),
    Timeout,
    /// The token endpoint answered with something we could not use.
    InvalidResponse(String),
    Internal(String),
}

impl ExchangeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConsentRequired(_) => "CONSENT_REQUIRED",
            Self::Rejected { .. } => "EXCHANGE_REJECTED",
            Self::Network(_) => "EXCHANGE_NETWORK_ERROR",
            Self::Timeout => "EXCHANGE_TIMEOUT",
            Self::InvalidResponse(_) => "EXCHANGE_INVALID_RESPONSE",
            Self::Internal(_) => "EXCHANGE_INTERNAL",
        }
    }
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConsentRequired(msg) => write!(f, "Consent required: {}", msg),
            Self::Rejected { error, description } => {
                write!(f, "Token exchange rejected ({}): {}", error, description)
            }
            Self::Network(msg) => write!(f, "Token endpoint unreachable: {}", msg),
            Self::Timeout => write!(f, "Token exchange timed out"),
            Self::InvalidResponse(msg) => write!(f, "Invalid token endpoint response: {}", msg),
            Self::Internal(msg) => write!(f, "Token exchange failed: {}", msg),
        }
    }
}

impl std::error::Error for ExchangeError {}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    token_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    suberror: Option<String>,
}

/// Client for the identity provider's token endpoint.
pub struct OboClient {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: SecretToken,
    scope: String,
}

impl OboClient {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretToken,
        scope: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ExchangeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExchangeError::Internal(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
            scope: scope.into(),
        })
    }

    /// Exchange `assertion` (the caller's inbound token) for a token scoped to
    /// the downstream resource, on behalf of the same user.
    pub async fn exchange(&self, assertion: &SecretToken) -> Result<ExchangedToken, ExchangeError> {
        debug!(
            assertion = %assertion.fingerprint(),
            scope = %self.scope,
            "Requesting on-behalf-of token"
        );

        let form = [
            ("grant_type", GRANT_TYPE_JWT_BEARER),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose()),
            ("assertion", assertion.expose()),
            ("scope", self.scope.as_str()),
            ("requested_token_use", "on_behalf_of"),
        ];

        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExchangeError::Timeout
                } else {
                    ExchangeError::Network(e.without_url().to_string())
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                ExchangeError::Timeout
            } else {
                ExchangeError::Network(e.without_url().to_string())
            }
        })?;

        if !status.is_success() {
            return Err(Self::classify_error(status, &body));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;

        if parsed.access_token.is_empty() {
            return Err(ExchangeError::InvalidResponse(
                "empty access_token".to_string(),
            ));
        }
        if let Some(token_type) = &parsed.token_type
            && !token_type.eq_ignore_ascii_case("bearer")
        {
            return Err(ExchangeError::InvalidResponse(format!(
                "unexpected token_type {}",
                token_type
            )));
        }

        let expires_at = chrono::Duration::try_seconds(parsed.expires_in.max(0))
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| {
                ExchangeError::InvalidResponse(format!(
                    "expires_in {} out of range",
                    parsed.expires_in
                ))
            })?;

        Ok(ExchangedToken {
            token: SecretToken::new(parsed.access_token),
            expires_at,
        })
    }

    fn classify_error(status: reqwest::StatusCode, body: &str) -> ExchangeError {
        let Ok(err) = serde_json::from_str::<TokenErrorResponse>(body) else {
            warn!(%status, "Token endpoint returned a non-OAuth error body");
            return ExchangeError::Rejected {
                error: format!("http_{}", status.as_u16()),
                description: status.canonical_reason().unwrap_or("error").to_string(),
            };
        };

        // Descriptions can run to several lines of trace ids; keep the first.
        let description = err
            .error_description
            .as_deref()
            .and_then(|d| d.lines().next())
            .unwrap_or("")
            .to_string();

        // AADSTS65001: the user or an admin has not consented to the app.
        let consent = matches!(
            err.error.as_str(),
            "interaction_required" | "consent_required"
        ) || err.suberror.as_deref() == Some("consent_required")
            || description.starts_with("AADSTS65001");

        if consent {
            ExchangeError::ConsentRequired(description)
        } else {
            ExchangeError::Rejected {
                error: err.error,
                description,
            }
        }
    }
}
