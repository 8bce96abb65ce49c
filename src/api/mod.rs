// HTTP surface of the gateway

mod operations;

pub use operations::{
    LIST_CAPABILITIES, OperationError, OperationHandler, OperationInfo, OperationRegistry,
    PingDatabaseHandler, WhoAmIHandler,
};

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, header},
    response::Json,
    routing::{get, post},
};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::gateway::{AuthGateway, RequestContext};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<AuthGateway>,
    pub operations: Arc<OperationRegistry>,
}

impl AppState {
    pub fn new(gateway: Arc<AuthGateway>, operations: OperationRegistry) -> Self {
        Self {
            gateway,
            operations: Arc::new(operations),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/operations", get(list_operations))
        .route("/operations/{name}", post(invoke_operation))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let pools = state.gateway.pools().stats().await;
    let exchange = state.gateway.exchange().stats().await;

    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "enforce_auth": state.gateway.enforces_auth(),
        "pools": pools,
        "exchange": exchange,
    }))
}

async fn list_operations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, OperationError> {
    run_operation(&state, &headers, LIST_CAPABILITIES, Value::Null).await
}

async fn invoke_operation(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, OperationError> {
    // Unknown names are rejected before any token work happens.
    if !state.operations.contains(&name) {
        return Err(OperationError::UnknownOperation(name));
    }

    let args = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| OperationError::InvalidArguments(e.to_string()))?
    };

    run_operation(&state, &headers, &name, args).await
}

async fn run_operation(
    state: &AppState,
    headers: &HeaderMap,
    name: &str,
    args: Value,
) -> Result<Json<Value>, OperationError> {
    let authorization = match headers.get(header::AUTHORIZATION) {
        Some(value) => Some(value.to_str().map_err(|_| {
            OperationError::Gateway(
                crate::auth::AuthError::InvalidFormat(
                    "authorization header is not valid ASCII".to_string(),
                )
                .into(),
            )
        })?),
        None => None,
    };

    let ctx = state.gateway.build_context(authorization, name).await?;
    debug!(
        operation = name,
        authenticated = ctx.is_authenticated(),
        "Dispatching operation"
    );

    let result = state.operations.call(name, args, &ctx).await?;

    let request_id = match &ctx {
        RequestContext::Authenticated(auth) => Some(auth.request_id()),
        RequestContext::Anonymous => None,
    };

    Ok(Json(serde_json::json!({
        "operation": name,
        "request_id": request_id,
        "result": result,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MemoryConnectionFactory, MockIdentityProvider, TokenBuilder};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use tower::ServiceExt;

    async fn app(idp: &MockIdentityProvider, max_users: usize) -> Router {
        let mut config = idp.gateway_config();
        config.pool.max_concurrent_users = max_users;
        let gateway =
            AuthGateway::from_config(&config, MemoryConnectionFactory::new()).unwrap();
        create_router(AppState::new(
            Arc::new(gateway),
            OperationRegistry::with_builtins(),
        ))
    }

    fn post(uri: &str, user: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri(uri);
        if let Some(user) = user {
            builder = builder.header(
                header::AUTHORIZATION,
                format!("Bearer {}", TokenBuilder::for_user(user).build()),
            );
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_pool_stats() {
        let idp = MockIdentityProvider::start().await;
        let app = app(&idp, 10).await;

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["pools"]["active_pools"], 0);
        assert_eq!(body["pools"]["max_concurrent_users"], 10);
        assert_eq!(body["exchange"]["exchanges"], 0);
    }

    #[tokio::test]
    async fn test_operation_without_token_is_unauthorized() {
        let idp = MockIdentityProvider::start().await;
        let app = app(&idp, 10).await;

        let response = app.oneshot(post("/operations/whoami", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "MISSING_TOKEN");
        assert_eq!(body["error"]["retryable"], false);
    }

    #[tokio::test]
    async fn test_whoami_returns_sanitized_identity() {
        let idp = MockIdentityProvider::start().await;
        let app = app(&idp, 10).await;

        let response = app
            .oneshot(post("/operations/whoami", Some("alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["result"]["identity"]["subject_id"], "oid-alice");
        assert!(body["request_id"].is_string());
        assert!(!body.to_string().contains("downstream:"));
    }

    #[tokio::test]
    async fn test_discovery_is_exempt() {
        let idp = MockIdentityProvider::start().await;
        let app = app(&idp, 10).await;

        let response = app
            .oneshot(Request::get("/operations").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert!(body["request_id"].is_null());
        assert!(body["result"]["operations"].as_array().unwrap().len() >= 3);
    }

    #[tokio::test]
    async fn test_ping_database_uses_callers_pool() {
        let idp = MockIdentityProvider::start().await;
        let app = app(&idp, 10).await;

        let response = app
            .clone()
            .oneshot(post("/operations/ping_database", Some("alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let first = json_body(response).await;
        assert_eq!(first["result"]["database"], true);

        let response = app
            .oneshot(post("/operations/ping_database", Some("alice")))
            .await
            .unwrap();
        let second = json_body(response).await;
        assert_eq!(first["result"]["pool_id"], second["result"]["pool_id"]);
    }

    #[tokio::test]
    async fn test_capacity_returns_503_with_retry_after() {
        let idp = MockIdentityProvider::start().await;
        let app = app(&idp, 1).await;

        let response = app
            .clone()
            .oneshot(post("/operations/ping_database", Some("alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(post("/operations/ping_database", Some("bob")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().contains_key(header::RETRY_AFTER));

        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "CAPACITY_EXCEEDED");
        assert_eq!(body["error"]["retryable"], true);
    }

    #[tokio::test]
    async fn test_unknown_operation_is_404() {
        let idp = MockIdentityProvider::start().await;
        let app = app(&idp, 10).await;

        let response = app
            .oneshot(post("/operations/drop_everything", Some("alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(idp.token_requests(), 0);
    }

    #[tokio::test]
    async fn test_malformed_arguments_are_400() {
        let idp = MockIdentityProvider::start().await;
        let app = app(&idp, 10).await;

        let request = Request::builder()
            .method("POST")
            .uri("/operations/whoami")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
