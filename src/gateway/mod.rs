//! Auth Gateway: turns an inbound `Authorization` header into a
//! [`RequestContext`].
//!
//! Per request: parse the bearer token, validate it, exchange it on behalf of
//! the caller for a database-scoped token, and bind a [`PoolAccessor`] for the
//! caller's own pool. Failures are rejected here, before any operation
//! handler runs.

mod context;

pub use context::{AuthenticatedContext, PoolAccessor, RequestContext};

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{AuthError, TokenValidator};
use crate::config::GatewayConfig;
use crate::db::{ConnectionFactory, PoolError, PoolManager};
use crate::exchange::{ExchangeError, OboClient, TokenExchangeService};
use crate::types::SecretToken;

/// Seconds a capacity-rejected caller is asked to wait before retrying.
pub const CAPACITY_RETRY_AFTER_SECONDS: u64 = 30;

/// Errors surfaced at the gateway boundary.
///
/// Authentication and exchange failures mean "re-authenticate"; capacity and
/// connection failures mean "retry later".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    Authentication(AuthError),
    Exchange(ExchangeError),
    Capacity(PoolError),
    Connection(PoolError),
}

impl GatewayError {
    pub fn category(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::Exchange(_) => "exchange",
            Self::Capacity(_) => "capacity",
            Self::Connection(_) => "connection",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Authentication(e) => e.code(),
            Self::Exchange(e) => e.code(),
            Self::Capacity(e) | Self::Connection(e) => e.code(),
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            Self::Authentication(e) => matches!(e, AuthError::NetworkError(_)),
            Self::Exchange(e) => matches!(e, ExchangeError::Network(_) | ExchangeError::Timeout),
            Self::Capacity(_) | Self::Connection(_) => true,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Exchange(ExchangeError::ConsentRequired(_)) => StatusCode::UNAUTHORIZED,
            Self::Exchange(_) => StatusCode::BAD_GATEWAY,
            Self::Capacity(_) | Self::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication(e) => write!(f, "Authentication failed: {}", e),
            Self::Exchange(e) => write!(f, "{}", e),
            Self::Capacity(e) => write!(f, "{}", e),
            Self::Connection(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<AuthError> for GatewayError {
    fn from(e: AuthError) -> Self {
        Self::Authentication(e)
    }
}

impl From<ExchangeError> for GatewayError {
    fn from(e: ExchangeError) -> Self {
        Self::Exchange(e)
    }
}

impl From<PoolError> for GatewayError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::CapacityExceeded { .. } => Self::Capacity(e),
            other => Self::Connection(other),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": {
                "code": self.code(),
                "category": self.category(),
                "message": self.to_string(),
                "retryable": self.retryable(),
            }
        }));

        let mut response = (self.status(), body).into_response();
        let headers = response.headers_mut();
        match &self {
            Self::Capacity(_) => {
                headers.insert(
                    header::RETRY_AFTER,
                    header::HeaderValue::from(CAPACITY_RETRY_AFTER_SECONDS),
                );
            }
            Self::Authentication(_) => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    header::HeaderValue::from_static("Bearer error=\"invalid_token\""),
                );
            }
            _ => {}
        }
        response
    }
}

/// Extract the token from an `Authorization` header value.
///
/// `Ok(None)` when no credentials were sent at all.
pub fn parse_bearer(authorization: Option<&str>) -> Result<Option<&str>, AuthError> {
    let Some(value) = authorization.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };

    let (scheme, token) = value.split_once(' ').unwrap_or((value, ""));
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidFormat(
            "expected the Bearer authorization scheme".to_string(),
        ));
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::InvalidFormat("empty bearer token".to_string()));
    }
    Ok(Some(token))
}

/// Builds a [`RequestContext`] for every inbound request.
pub struct AuthGateway {
    validator: TokenValidator,
    exchange: TokenExchangeService,
    pools: PoolManager,
    enforce_auth: bool,
    exempt_operations: HashSet<String>,
}

impl AuthGateway {
    pub fn new(
        validator: TokenValidator,
        exchange: TokenExchangeService,
        pools: PoolManager,
        enforce_auth: bool,
        exempt_operations: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            validator,
            exchange,
            pools,
            enforce_auth,
            exempt_operations: exempt_operations.into_iter().collect(),
        }
    }

    /// Wire up validator, exchange service and pool manager from config.
    pub fn from_config(
        config: &GatewayConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> anyhow::Result<Self> {
        let validator = TokenValidator::new(&config.identity)?;

        let secret = config.identity.client_secret.clone().ok_or_else(|| {
            anyhow::anyhow!("identity.client_secret is required for the on-behalf-of exchange")
        })?;
        let client = OboClient::new(
            config.token_url(),
            config.identity.client_id.clone(),
            SecretToken::new(secret),
            config.exchange.downstream_scope.clone(),
            config.identity.http_timeout(),
        )?;
        let exchange = TokenExchangeService::new(
            client,
            config.exchange.refresh_buffer(),
            config.exchange.retention(),
        );
        let pools = PoolManager::new(config.pool.clone(), factory);

        Ok(Self::new(
            validator,
            exchange,
            pools,
            config.enforce_auth,
            config.exempt_operations.iter().cloned(),
        ))
    }

    pub fn pools(&self) -> &PoolManager {
        &self.pools
    }

    pub fn exchange(&self) -> &TokenExchangeService {
        &self.exchange
    }

    pub fn enforces_auth(&self) -> bool {
        self.enforce_auth
    }

    pub fn is_exempt(&self, operation: &str) -> bool {
        self.exempt_operations.contains(operation)
    }

    /// Authenticate one request for `operation`.
    ///
    /// Without a usable token the caller gets `Anonymous` only when
    /// enforcement is off or the operation is exempt. A caller whose token
    /// validated but whose exchange failed is always rejected.
    pub async fn build_context(
        &self,
        authorization: Option<&str>,
        operation: &str,
    ) -> Result<RequestContext, GatewayError> {
        let lenient = !self.enforce_auth || self.is_exempt(operation);

        let token = match parse_bearer(authorization) {
            Ok(Some(token)) => token,
            Ok(None) if lenient => {
                debug!(operation, "No bearer token, continuing anonymously");
                return Ok(RequestContext::Anonymous);
            }
            Ok(None) => {
                warn!(operation, "Rejecting request without a bearer token");
                return Err(AuthError::MissingToken.into());
            }
            Err(e) => return self.reject_or_degrade(e, operation, lenient),
        };

        let identity = match self.validator.validate(token).await {
            Ok(identity) => identity,
            Err(e) => return self.reject_or_degrade(e, operation, lenient),
        };

        let exchanged = self.exchange.exchange(&identity).await.map_err(|e| {
            warn!(
                subject = %identity.subject_id(),
                operation,
                code = e.code(),
                "On-behalf-of exchange failed, rejecting request"
            );
            GatewayError::Exchange(e)
        })?;

        let request_id = Uuid::new_v4();
        info!(
            target: "audit",
            request_id = %request_id,
            subject = %identity.subject_id(),
            principal = identity.principal_name(),
            tenant = %identity.tenant_id(),
            operation,
            token = %identity.token().fingerprint(),
            "Authenticated request"
        );

        let pool = PoolAccessor::new(
            identity.subject_id().clone(),
            exchanged.token,
            exchanged.expires_at,
            self.pools.clone(),
        );
        Ok(RequestContext::Authenticated(AuthenticatedContext::new(
            request_id,
            Arc::new(identity),
            pool,
        )))
    }

    fn reject_or_degrade(
        &self,
        error: AuthError,
        operation: &str,
        lenient: bool,
    ) -> Result<RequestContext, GatewayError> {
        if lenient {
            warn!(
                operation,
                code = error.code(),
                "Token rejected, continuing anonymously outside row-level security"
            );
            Ok(RequestContext::Anonymous)
        } else {
            warn!(operation, code = error.code(), error = %error, "Rejecting request");
            Err(error.into())
        }
    }
}
