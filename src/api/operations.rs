//! Operation registry.
//!
//! Provides an `OperationHandler` trait for implementing operations and an
//! `OperationRegistry` for registering and invoking them. Every handler runs
//! with the [`RequestContext`] the gateway built for the request.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Value, json};

use crate::gateway::{GatewayError, RequestContext};

/// Name of the built-in discovery operation.
pub const LIST_CAPABILITIES: &str = "list_capabilities";

/// Errors returned from operation execution.
#[derive(Debug)]
pub enum OperationError {
    Gateway(GatewayError),
    UnknownOperation(String),
    InvalidArguments(String),
    Database(String),
}

impl OperationError {
    pub fn database(e: impl fmt::Display) -> Self {
        Self::Database(e.to_string())
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gateway(e) => write!(f, "{}", e),
            Self::UnknownOperation(name) => write!(f, "Unknown operation: {}", name),
            Self::InvalidArguments(msg) => write!(f, "Invalid arguments: {}", msg),
            Self::Database(msg) => write!(f, "Database error: {}", msg),
        }
    }
}

impl std::error::Error for OperationError {}

impl From<GatewayError> for OperationError {
    fn from(e: GatewayError) -> Self {
        Self::Gateway(e)
    }
}

impl IntoResponse for OperationError {
    fn into_response(self) -> Response {
        let (status, code) = match self {
            Self::Gateway(e) => return e.into_response(),
            Self::UnknownOperation(_) => (StatusCode::NOT_FOUND, "UNKNOWN_OPERATION"),
            Self::InvalidArguments(_) => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENTS"),
            Self::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string(),
                "retryable": false,
            }
        }));
        (status, body).into_response()
    }
}

/// Trait for handling gateway operations.
pub trait OperationHandler: Send + Sync {
    /// Returns the operation name used in `/operations/{name}`.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Executes the operation with the given arguments.
    fn execute<'a>(
        &'a self,
        args: Value,
        ctx: &'a RequestContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, OperationError>> + Send + 'a>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationInfo {
    pub name: String,
    pub description: String,
}

/// Registry for managing operation handlers.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    handlers: BTreeMap<String, Arc<dyn OperationHandler>>,
}

impl OperationRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in operations.
    pub fn with_builtins() -> Self {
        Self::new()
            .register_handler(WhoAmIHandler)
            .register_handler(PingDatabaseHandler)
    }

    /// Register an operation handler.
    pub fn register(mut self, handler: Arc<dyn OperationHandler>) -> Self {
        self.handlers.insert(handler.name().to_string(), handler);
        self
    }

    /// Register an operation handler from a type that implements `OperationHandler`.
    pub fn register_handler<T: OperationHandler + 'static>(self, handler: T) -> Self {
        self.register(Arc::new(handler))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        name == LIST_CAPABILITIES || self.handlers.contains_key(name)
    }

    /// Describe every operation, including `list_capabilities` itself.
    pub fn describe(&self) -> Vec<OperationInfo> {
        let mut ops = vec![OperationInfo {
            name: LIST_CAPABILITIES.to_string(),
            description: "List the operations this gateway exposes".to_string(),
        }];
        ops.extend(self.handlers.values().map(|h| OperationInfo {
            name: h.name().to_string(),
            description: h.description().to_string(),
        }));
        ops
    }

    /// Execute an operation by name.
    pub async fn call(
        &self,
        name: &str,
        args: Value,
        ctx: &RequestContext,
    ) -> Result<Value, OperationError> {
        if name == LIST_CAPABILITIES {
            return Ok(json!({ "operations": self.describe() }));
        }
        let handler = self
            .get(name)
            .ok_or_else(|| OperationError::UnknownOperation(name.to_string()))?;
        handler.execute(args, ctx).await
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Returns the caller's sanitized identity.
pub struct WhoAmIHandler;

impl OperationHandler for WhoAmIHandler {
    fn name(&self) -> &str {
        "whoami"
    }

    fn description(&self) -> &str {
        "Return the authenticated caller's identity"
    }

    fn execute<'a>(
        &'a self,
        _args: Value,
        ctx: &'a RequestContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, OperationError>> + Send + 'a>> {
        Box::pin(async move {
            let auth = ctx.require_authenticated()?;
            Ok(json!({
                "request_id": auth.request_id(),
                "identity": auth.identity().summary(),
                "database_token_expires_at": auth.pool().token_expires_at(),
            }))
        })
    }
}

/// Round-trips a trivial query through the caller's own pool.
pub struct PingDatabaseHandler;

impl OperationHandler for PingDatabaseHandler {
    fn name(&self) -> &str {
        "ping_database"
    }

    fn description(&self) -> &str {
        "Check that the caller's database connection is usable"
    }

    fn execute<'a>(
        &'a self,
        _args: Value,
        ctx: &'a RequestContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, OperationError>> + Send + 'a>> {
        Box::pin(async move {
            let auth = ctx.require_authenticated()?;
            let pool = auth.pool().get().await?;

            let mut res = pool
                .query("RETURN true")
                .await
                .map_err(OperationError::database)?;
            let ok: Option<bool> = res.take(0).map_err(OperationError::database)?;

            Ok(json!({
                "database": ok == Some(true),
                "pool_id": pool.pool_id(),
            }))
        })
    }
}
