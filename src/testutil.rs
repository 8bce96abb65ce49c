//! Shared fixtures for unit tests: token minting, an in-process identity
//! provider, and an in-memory connection factory.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Map, Value, json};

use crate::auth::UserIdentity;
use crate::config::{ExchangeConfig, GatewayConfig, IdentityConfig};
use crate::db::{ConnectionFactory, Db, PoolError, PoolResult};
use crate::exchange::GRANT_TYPE_JWT_BEARER;
use crate::types::{SecretToken, SubjectId};

pub const SIGNING_KID: &str = "test-signing-key";
pub const TEST_TENANT: &str = "test-tenant";
pub const TEST_CLIENT_ID: &str = "test-client";
pub const TEST_AUDIENCE: &str = "api://test-client";
pub const TEST_LEGACY_AUDIENCE: &str = "https://db.example.com";
pub const TEST_ISSUER: &str = "https://login.microsoftonline.com/test-tenant/v2.0";
pub const TEST_SCOPE: &str = "https://db.example.com/.default";

const SIGNING_KEY_PEM: &str = include_str!("../testdata/idp_signing_key.pem");
const SIGNING_KEY_N: &str = include_str!("../testdata/idp_signing_key.n");
const ROGUE_KEY_PEM: &str = include_str!("../testdata/rogue_signing_key.pem");

/// How the mock token endpoint should answer exchange requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdpFailure {
    None,
    ConsentRequired,
    ServerError,
}

struct IdpShared {
    jwks_requests: AtomicUsize,
    token_requests: AtomicUsize,
    expires_in: AtomicI64,
    failure: Mutex<IdpFailure>,
    keys_unavailable: AtomicBool,
    delay_ms: AtomicU64,
}

/// In-process identity provider serving a key set and a token endpoint.
pub struct MockIdentityProvider {
    base_url: String,
    shared: Arc<IdpShared>,
}

impl MockIdentityProvider {
    pub async fn start() -> Self {
        let shared = Arc::new(IdpShared {
            jwks_requests: AtomicUsize::new(0),
            token_requests: AtomicUsize::new(0),
            expires_in: AtomicI64::new(3600),
            failure: Mutex::new(IdpFailure::None),
            keys_unavailable: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
        });

        let app = Router::new()
            .route("/keys", get(jwks_handler))
            .route("/token", post(token_handler))
            .with_state(shared.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            shared,
        }
    }

    pub fn jwks_url(&self) -> String {
        format!("{}/keys", self.base_url)
    }

    pub fn token_url(&self) -> String {
        format!("{}/token", self.base_url)
    }

    pub fn identity_config(&self) -> IdentityConfig {
        let mut config = IdentityConfig::new(TEST_TENANT, TEST_CLIENT_ID);
        config.client_secret = Some("test-secret".to_string());
        config.audience = Some(TEST_AUDIENCE.to_string());
        config.legacy_audience = Some(TEST_LEGACY_AUDIENCE.to_string());
        config.issuers = vec![TEST_ISSUER.to_string()];
        config.jwks_url = Some(self.jwks_url());
        config.http_timeout_seconds = 5;
        config
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        let mut exchange = ExchangeConfig::new(TEST_SCOPE);
        exchange.token_url = Some(self.token_url());
        GatewayConfig::new(self.identity_config(), exchange)
    }

    pub fn jwks_requests(&self) -> usize {
        self.shared.jwks_requests.load(Ordering::SeqCst)
    }

    pub fn token_requests(&self) -> usize {
        self.shared.token_requests.load(Ordering::SeqCst)
    }

    pub fn fail_exchanges(&self, failure: IdpFailure) {
        *self.shared.failure.lock().unwrap() = failure;
    }

    /// Lifetime, in seconds, of downstream tokens issued from now on.
    pub fn set_expires_in(&self, seconds: i64) {
        self.shared.expires_in.store(seconds, Ordering::SeqCst);
    }

    /// Make the key endpoint answer 500 until switched back.
    pub fn fail_key_fetches(&self, fail: bool) {
        self.shared.keys_unavailable.store(fail, Ordering::SeqCst);
    }

    /// Extra latency added to every key and token response.
    pub fn set_response_delay(&self, delay: Duration) {
        self.shared
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

async fn injected_delay(shared: &IdpShared) {
    let delay = shared.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

async fn jwks_handler(State(shared): State<Arc<IdpShared>>) -> Response {
    shared.jwks_requests.fetch_add(1, Ordering::SeqCst);
    injected_delay(&shared).await;

    if shared.keys_unavailable.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "key service unavailable").into_response();
    }

    Json(json!({
        "keys": [{
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": SIGNING_KID,
            "n": SIGNING_KEY_N.trim(),
            "e": "AQAB",
        }]
    }))
    .into_response()
}

async fn token_handler(
    State(shared): State<Arc<IdpShared>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let issued = shared.token_requests.fetch_add(1, Ordering::SeqCst) + 1;
    // Long enough for concurrent callers to pile up behind one request.
    tokio::time::sleep(Duration::from_millis(50)).await;
    injected_delay(&shared).await;

    let failure = *shared.failure.lock().unwrap();
    match failure {
        IdpFailure::ConsentRequired => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "invalid_grant",
                    "error_description": "AADSTS65001: The user has not consented.\r\nTrace ID: 1",
                    "suberror": "consent_required",
                })),
            )
                .into_response();
        }
        IdpFailure::ServerError => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "temporarily_unavailable",
                    "error_description": "try again later",
                })),
            )
                .into_response();
        }
        IdpFailure::None => {}
    }

    if form.get("grant_type").map(String::as_str) != Some(GRANT_TYPE_JWT_BEARER)
        || form.get("requested_token_use").map(String::as_str) != Some("on_behalf_of")
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "unsupported_grant_type" })),
        )
            .into_response();
    }

    let Some(oid) = form.get("assertion").and_then(|a| assertion_oid(a)) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid_grant",
                "error_description": "malformed assertion",
            })),
        )
            .into_response();
    };

    Json(json!({
        "token_type": "Bearer",
        "access_token": format!("downstream:{}:{}", oid, issued),
        "expires_in": shared.expires_in.load(Ordering::SeqCst),
        "scope": form.get("scope"),
    }))
    .into_response()
}

fn assertion_oid(assertion: &str) -> Option<String> {
    let payload = assertion.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("oid")?.as_str().map(str::to_string)
}

/// Mints RS256 tokens that the mock identity provider's keys verify.
pub struct TokenBuilder {
    claims: Map<String, Value>,
    kid: String,
    rogue: bool,
}

impl TokenBuilder {
    pub fn for_user(name: &str) -> Self {
        let now = chrono::Utc::now().timestamp();
        let mut claims = Map::new();
        claims.insert("oid".into(), json!(format!("oid-{}", name)));
        claims.insert("sub".into(), json!(format!("sub-{}", name)));
        claims.insert("upn".into(), json!(format!("{}@contoso.com", name)));
        claims.insert("name".into(), json!(name));
        claims.insert("tid".into(), json!(TEST_TENANT));
        claims.insert("aud".into(), json!(TEST_AUDIENCE));
        claims.insert("iss".into(), json!(TEST_ISSUER));
        claims.insert("iat".into(), json!(now));
        claims.insert("nbf".into(), json!(now));
        claims.insert("exp".into(), json!(now + 3600));

        Self {
            claims,
            kid: SIGNING_KID.to_string(),
            rogue: false,
        }
    }

    pub fn audience(mut self, aud: &str) -> Self {
        self.claims.insert("aud".into(), json!(aud));
        self
    }

    pub fn issuer(mut self, iss: &str) -> Self {
        self.claims.insert("iss".into(), json!(iss));
        self
    }

    /// Expiry relative to now; negative values mint an already-expired token.
    pub fn expires_in(mut self, seconds: i64) -> Self {
        let exp = chrono::Utc::now().timestamp() + seconds;
        self.claims.insert("exp".into(), json!(exp));
        self.claims.insert("iat".into(), json!(exp - 3600));
        self.claims.insert("nbf".into(), json!(exp - 3600));
        self
    }

    pub fn kid(mut self, kid: &str) -> Self {
        self.kid = kid.to_string();
        self
    }

    pub fn claim(mut self, name: &str, value: Value) -> Self {
        self.claims.insert(name.into(), value);
        self
    }

    pub fn without_claim(mut self, name: &str) -> Self {
        self.claims.remove(name);
        self
    }

    pub fn signed_by_rogue_key(mut self) -> Self {
        self.rogue = true;
        self
    }

    pub fn claims(&self) -> HashMap<String, Value> {
        self.claims.clone().into_iter().collect()
    }

    pub fn build(&self) -> String {
        let pem = if self.rogue { ROGUE_KEY_PEM } else { SIGNING_KEY_PEM };
        let key = EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap();

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());

        jsonwebtoken::encode(&header, &Value::Object(self.claims.clone()), &key).unwrap()
    }
}

/// A validated-looking identity for `name`, carrying a real signed token.
pub fn identity_for(name: &str) -> UserIdentity {
    let builder = TokenBuilder::for_user(name);
    UserIdentity::from_claims(builder.claims(), SecretToken::new(builder.build())).unwrap()
}

/// Connection factory backed by SurrealDB's in-memory engine.
///
/// Every connection is a separate in-memory datastore, so data written
/// through one user's pool is invisible to every other pool.
#[derive(Default)]
pub struct MemoryConnectionFactory {
    connects: AtomicUsize,
    closes: AtomicUsize,
    delay: Duration,
    failing: AtomicBool,
    tokens: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryConnectionFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Tokens each connection for `subject` was opened with, in order.
    pub fn tokens_for(&self, subject: &str) -> Vec<String> {
        self.tokens
            .lock()
            .unwrap()
            .get(subject)
            .cloned()
            .unwrap_or_default()
    }
}

impl ConnectionFactory for MemoryConnectionFactory {
    fn connect<'a>(
        &'a self,
        subject: &'a SubjectId,
        token: &'a SecretToken,
    ) -> Pin<Box<dyn Future<Output = PoolResult<Db>> + Send + 'a>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.tokens
                .lock()
                .unwrap()
                .entry(subject.as_str().to_string())
                .or_default()
                .push(token.expose().to_string());

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(PoolError::Connection("simulated connection failure".into()));
            }

            let db = surrealdb::engine::any::connect("memory")
                .await
                .map_err(|e| PoolError::Connection(e.to_string()))?;
            db.use_ns("test")
                .use_db("test")
                .await
                .map_err(|e| PoolError::Connection(e.to_string()))?;
            Ok(db)
        })
    }

    fn close(&self, db: Db) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
            drop(db);
        })
    }
}
