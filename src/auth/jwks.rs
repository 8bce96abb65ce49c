//! JWKS (JSON Web Key Set) fetching and caching module.
//!
//! Signing keys published by the identity provider are cached by key id.
//! The whole set is refreshed when it is older than the cache TTL; a token
//! carrying an unknown key id triggers a refetch, but no more often than the
//! configured minimum refetch interval, so a flood of forged `kid`s cannot
//! turn into a flood of outbound requests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::Engine;
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Default cache TTL in seconds (1 hour).
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 3600;

/// Maximum stale cache age in seconds (24 hours).
pub const MAX_STALE_CACHE_SECONDS: u64 = 86400;

/// Default minimum spacing between unknown-kid refetches.
pub const DEFAULT_MIN_REFETCH_SECONDS: u64 = 30;

/// A single JSON Web Key from a JWKS document.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type (e.g., "RSA")
    pub kty: String,
    /// Key ID (optional, used to match JWT header kid)
    pub kid: Option<String>,
    /// Algorithm (e.g., "RS256")
    pub alg: Option<String>,
    /// Key use (e.g., "sig" for signature)
    #[serde(rename = "use")]
    pub key_use: Option<String>,
    /// RSA modulus (base64url encoded)
    pub n: Option<String>,
    /// RSA exponent (base64url encoded)
    pub e: Option<String>,
    /// X.509 certificate chain
    pub x5c: Option<Vec<String>>,
}

/// A JWKS document containing multiple keys.
#[derive(Debug, Clone, Deserialize)]
pub struct JwksDocument {
    pub keys: Vec<Jwk>,
}

/// Settings for a [`JwksCache`].
#[derive(Debug, Clone)]
pub struct JwksCacheConfig {
    pub jwks_url: String,
    pub cache_ttl: Duration,
    pub min_refetch_interval: Duration,
    /// Whether to fall back to a stale key set when a fetch fails.
    pub allow_stale: bool,
    pub fetch_timeout: Duration,
}

impl JwksCacheConfig {
    pub fn new(jwks_url: impl Into<String>) -> Self {
        Self {
            jwks_url: jwks_url.into(),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECONDS),
            min_refetch_interval: Duration::from_secs(DEFAULT_MIN_REFETCH_SECONDS),
            allow_stale: true,
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Default)]
struct KeySet {
    keys: HashMap<String, DecodingKey>,
    /// Last successful fetch.
    fetched_at: Option<Instant>,
    /// Last fetch attempt, successful or not.
    attempted_at: Option<Instant>,
}

/// Thread-safe JWKS cache with automatic refresh.
pub struct JwksCache {
    config: JwksCacheConfig,
    state: RwLock<KeySet>,
    /// Serializes outbound fetches so concurrent misses share one request.
    refresh_lock: Mutex<()>,
    client: reqwest::Client,
}

impl JwksCache {
    /// Create a new JWKS cache.
    pub fn new(config: JwksCacheConfig) -> Result<Self, JwksCacheError> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|e| JwksCacheError::FetchError(format!("HTTP client: {}", e)))?;

        Ok(Self {
            config,
            state: RwLock::new(KeySet::default()),
            refresh_lock: Mutex::new(()),
            client,
        })
    }

    /// Get a decoding key by key ID.
    ///
    /// If `kid` is None, returns the first available key.
    /// Fetches from the JWKS endpoint if the cache is stale or the key is
    /// unknown, but never more often than the minimum refetch interval.
    pub async fn get_key(&self, kid: Option<&str>) -> Result<DecodingKey, JwksCacheError> {
        if let Some(answer) = self.answer_without_fetch(kid).await {
            return answer;
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited for the lock.
        if let Some(answer) = self.answer_without_fetch(kid).await {
            return answer;
        }

        match self.fetch_keys().await {
            Ok(()) => self
                .get_from_cache(kid)
                .await
                .ok_or_else(|| Self::missing(kid)),
            Err(e) => match self.get_stale(kid).await {
                Some(key) => {
                    warn!("JWKS fetch failed, using stale cache: {}", e);
                    Ok(key)
                }
                None => Err(e),
            },
        }
    }

    /// Resolve `kid` from the cache when no fetch is needed or allowed.
    ///
    /// `None` means the caller should fetch.
    async fn answer_without_fetch(
        &self,
        kid: Option<&str>,
    ) -> Option<Result<DecodingKey, JwksCacheError>> {
        let stale = self.is_stale().await;
        if !stale && let Some(key) = self.get_from_cache(kid).await {
            return Some(Ok(key));
        }
        if !self.refetch_throttled().await {
            return None;
        }

        if !stale {
            debug!(?kid, "Unknown key id, refetch throttled");
            return Some(Err(Self::missing(kid)));
        }

        debug!(?kid, "Key set stale, refetch throttled");
        Some(self.get_stale(kid).await.ok_or_else(|| {
            JwksCacheError::FetchError("key set unavailable, refetch throttled".to_string())
        }))
    }

    /// A key from an expired set, if stale keys are allowed and the set is
    /// not older than [`MAX_STALE_CACHE_SECONDS`].
    async fn get_stale(&self, kid: Option<&str>) -> Option<DecodingKey> {
        if !self.config.allow_stale {
            return None;
        }

        let usable = self
            .state
            .read()
            .await
            .fetched_at
            .is_some_and(|t| t.elapsed() < Duration::from_secs(MAX_STALE_CACHE_SECONDS));

        if usable {
            self.get_from_cache(kid).await
        } else {
            None
        }
    }

    fn missing(kid: Option<&str>) -> JwksCacheError {
        match kid {
            Some(k) => JwksCacheError::KeyNotFound(k.to_string()),
            None => JwksCacheError::NoKeysAvailable,
        }
    }

    async fn is_stale(&self) -> bool {
        match self.state.read().await.fetched_at {
            Some(t) => t.elapsed() > self.config.cache_ttl,
            None => true,
        }
    }

    async fn refetch_throttled(&self) -> bool {
        self.state
            .read()
            .await
            .attempted_at
            .map(|t| t.elapsed() < self.config.min_refetch_interval)
            .unwrap_or(false)
    }

    /// Get a key from the cache without fetching.
    async fn get_from_cache(&self, kid: Option<&str>) -> Option<DecodingKey> {
        let state = self.state.read().await;

        match kid {
            Some(k) => state.keys.get(k).cloned(),
            None => state.keys.values().next().cloned(),
        }
    }

    /// Fetch keys from the JWKS endpoint, replacing the cached set.
    pub async fn fetch_keys(&self) -> Result<(), JwksCacheError> {
        debug!("Fetching JWKS from {}", self.config.jwks_url);
        self.state.write().await.attempted_at = Some(Instant::now());

        let response = self
            .client
            .get(&self.config.jwks_url)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    JwksCacheError::Timeout
                } else {
                    JwksCacheError::FetchError(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(JwksCacheError::FetchError(format!(
                "HTTP {} from JWKS endpoint",
                response.status()
            )));
        }

        let jwks: JwksDocument = response
            .json()
            .await
            .map_err(|e| JwksCacheError::ParseError(e.to_string()))?;

        let mut new_keys = HashMap::new();

        for jwk in jwks.keys {
            if jwk.kty != "RSA" {
                debug!("Skipping non-RSA key: {:?}", jwk.kty);
                continue;
            }

            if jwk.key_use.as_deref() == Some("enc") {
                debug!("Skipping encryption key");
                continue;
            }

            match Self::jwk_to_decoding_key(&jwk) {
                Ok(decoding_key) => {
                    let kid = jwk.kid.clone().unwrap_or_else(|| "default".to_string());
                    debug!("Cached key with kid: {}", kid);
                    new_keys.insert(kid, decoding_key);
                }
                Err(e) => {
                    warn!("Failed to parse JWK: {}", e);
                }
            }
        }

        if new_keys.is_empty() {
            return Err(JwksCacheError::NoValidKeys);
        }

        let count = new_keys.len();
        {
            let mut state = self.state.write().await;
            state.keys = new_keys;
            state.fetched_at = Some(Instant::now());
        }

        debug!("Successfully cached {} keys", count);
        Ok(())
    }

    /// Convert a JWK to a jsonwebtoken DecodingKey.
    ///
    /// The `n`/`e` components are preferred; `x5c` is only consulted when
    /// they are absent.
    fn jwk_to_decoding_key(jwk: &Jwk) -> Result<DecodingKey, JwksCacheError> {
        if let (Some(n), Some(e)) = (&jwk.n, &jwk.e) {
            return DecodingKey::from_rsa_components(n, e).map_err(|e| {
                JwksCacheError::ParseError(format!("Invalid RSA components: {}", e))
            });
        }

        let cert = jwk
            .x5c
            .as_ref()
            .and_then(|chain| chain.first())
            .ok_or_else(|| {
                JwksCacheError::ParseError("RSA key has neither n/e nor x5c".to_string())
            })?;

        // x5c entries are standard (not URL-safe) base64 DER.
        let cert_der = base64::engine::general_purpose::STANDARD
            .decode(cert)
            .map_err(|e| JwksCacheError::ParseError(format!("Invalid x5c: {}", e)))?;

        Ok(DecodingKey::from_rsa_der(&cert_der))
    }

    /// Check if the cache has any keys.
    pub async fn has_keys(&self) -> bool {
        !self.state.read().await.keys.is_empty()
    }

    /// Get the number of cached keys.
    pub async fn key_count(&self) -> usize {
        self.state.read().await.keys.len()
    }

    /// Clear the cache, including the refetch throttle.
    pub async fn clear(&self) {
        *self.state.write().await = KeySet::default();
    }
}

/// Errors that can occur when working with the JWKS cache.
#[derive(Debug, Clone)]
pub enum JwksCacheError {
    /// Failed to fetch JWKS from endpoint.
    FetchError(String),
    /// The fetch did not complete within the configured timeout.
    Timeout,
    /// Failed to parse JWKS response.
    ParseError(String),
    /// No valid keys found in JWKS.
    NoValidKeys,
    /// Key with specified kid not found.
    KeyNotFound(String),
    /// No keys available in cache.
    NoKeysAvailable,
}

impl std::fmt::Display for JwksCacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FetchError(msg) => write!(f, "Failed to fetch JWKS: {}", msg),
            Self::Timeout => write!(f, "Timed out fetching JWKS"),
            Self::ParseError(msg) => write!(f, "Failed to parse JWKS: {}", msg),
            Self::NoValidKeys => write!(f, "No valid keys found in JWKS"),
            Self::KeyNotFound(kid) => write!(f, "Key not found: {}", kid),
            Self::NoKeysAvailable => write!(f, "No keys available in cache"),
        }
    }
}

impl std::error::Error for JwksCacheError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockIdentityProvider, SIGNING_KID};

    fn cache_for(idp: &MockIdentityProvider) -> JwksCache {
        JwksCache::new(JwksCacheConfig::new(idp.jwks_url())).unwrap()
    }

    fn cache_with(
        idp: &MockIdentityProvider,
        cache_ttl: Duration,
        min_refetch_interval: Duration,
        allow_stale: bool,
    ) -> JwksCache {
        JwksCache::new(JwksCacheConfig {
            cache_ttl,
            min_refetch_interval,
            allow_stale,
            ..JwksCacheConfig::new(idp.jwks_url())
        })
        .unwrap()
    }

    #[test]
    fn test_jwks_cache_error_display() {
        let err = JwksCacheError::FetchError("timeout".to_string());
        assert_eq!(err.to_string(), "Failed to fetch JWKS: timeout");

        let err = JwksCacheError::KeyNotFound("key123".to_string());
        assert_eq!(err.to_string(), "Key not found: key123");

        let err = JwksCacheError::NoKeysAvailable;
        assert_eq!(err.to_string(), "No keys available in cache");
    }

    #[test]
    fn test_jwks_document_deserialization() {
        let json = r#"{
            "keys": [
                { "kty": "RSA", "kid": "key1", "use": "sig", "n": "test", "e": "AQAB" },
                { "kty": "EC", "kid": "key2", "crv": "P-256" }
            ]
        }"#;

        let doc: JwksDocument = serde_json::from_str(json).unwrap();
        assert_eq!(doc.keys.len(), 2);
        assert_eq!(doc.keys[0].kid, Some("key1".to_string()));
        assert_eq!(doc.keys[0].key_use, Some("sig".to_string()));
        assert_eq!(doc.keys[1].kty, "EC");
    }

    #[tokio::test]
    async fn test_fetches_once_and_serves_from_cache() {
        let idp = MockIdentityProvider::start().await;
        let cache = cache_for(&idp);

        assert!(!cache.has_keys().await);
        cache.get_key(Some(SIGNING_KID)).await.unwrap();
        cache.get_key(Some(SIGNING_KID)).await.unwrap();
        cache.get_key(None).await.unwrap();

        assert_eq!(cache.key_count().await, 1);
        assert_eq!(idp.jwks_requests(), 1);
    }

    #[tokio::test]
    async fn test_unknown_kid_refetch_is_throttled() {
        let idp = MockIdentityProvider::start().await;
        let cache = cache_for(&idp);

        cache.get_key(Some(SIGNING_KID)).await.unwrap();

        for _ in 0..5 {
            let err = cache.get_key(Some("forged-kid")).await.unwrap_err();
            assert!(matches!(err, JwksCacheError::KeyNotFound(ref k) if k == "forged-kid"));
        }

        assert_eq!(idp.jwks_requests(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_cold_lookups_share_one_fetch() {
        let idp = MockIdentityProvider::start().await;
        let cache = std::sync::Arc::new(cache_for(&idp));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache.get_key(Some(SIGNING_KID)).await.is_ok()
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }

        assert_eq!(idp.jwks_requests(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_fetch_error() {
        let cache = JwksCache::new(JwksCacheConfig::new("http://127.0.0.1:9/keys")).unwrap();

        let err = cache.get_key(Some(SIGNING_KID)).await.unwrap_err();
        assert!(matches!(err, JwksCacheError::FetchError(_)));
    }

    #[tokio::test]
    async fn test_outage_refetch_is_throttled() {
        let idp = MockIdentityProvider::start().await;
        idp.fail_key_fetches(true);
        let cache = cache_for(&idp);

        for _ in 0..20 {
            let err = cache.get_key(Some(SIGNING_KID)).await.unwrap_err();
            assert!(matches!(err, JwksCacheError::FetchError(_)));
        }

        assert_eq!(idp.jwks_requests(), 1);
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let idp = MockIdentityProvider::start().await;
        idp.set_response_delay(Duration::from_secs(2));
        let cache = JwksCache::new(JwksCacheConfig {
            fetch_timeout: Duration::from_millis(200),
            ..JwksCacheConfig::new(idp.jwks_url())
        })
        .unwrap();

        let err = cache.get_key(Some(SIGNING_KID)).await.unwrap_err();
        assert!(matches!(err, JwksCacheError::Timeout));
    }

    #[tokio::test]
    async fn test_expired_set_is_refetched() {
        let idp = MockIdentityProvider::start().await;
        let cache = cache_with(&idp, Duration::from_millis(100), Duration::ZERO, true);

        cache.get_key(Some(SIGNING_KID)).await.unwrap();
        cache.get_key(Some(SIGNING_KID)).await.unwrap();
        assert_eq!(idp.jwks_requests(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        cache.get_key(Some(SIGNING_KID)).await.unwrap();
        assert_eq!(idp.jwks_requests(), 2);
    }

    #[tokio::test]
    async fn test_stale_keys_survive_failed_refetch() {
        let idp = MockIdentityProvider::start().await;
        let cache = cache_with(&idp, Duration::from_millis(50), Duration::ZERO, true);

        cache.get_key(Some(SIGNING_KID)).await.unwrap();
        idp.fail_key_fetches(true);
        tokio::time::sleep(Duration::from_millis(100)).await;

        cache.get_key(Some(SIGNING_KID)).await.unwrap();
        assert_eq!(idp.jwks_requests(), 2);
    }

    #[tokio::test]
    async fn test_stale_keys_served_while_throttled() {
        let idp = MockIdentityProvider::start().await;
        let cache = cache_with(
            &idp,
            Duration::from_millis(50),
            Duration::from_secs(30),
            true,
        );

        cache.get_key(Some(SIGNING_KID)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        for _ in 0..5 {
            cache.get_key(Some(SIGNING_KID)).await.unwrap();
        }
        assert_eq!(idp.jwks_requests(), 1);
    }

    #[tokio::test]
    async fn test_stale_keys_refused_when_disabled() {
        let idp = MockIdentityProvider::start().await;
        let cache = cache_with(&idp, Duration::from_millis(50), Duration::ZERO, false);

        cache.get_key(Some(SIGNING_KID)).await.unwrap();
        idp.fail_key_fetches(true);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = cache.get_key(Some(SIGNING_KID)).await.unwrap_err();
        assert!(matches!(err, JwksCacheError::FetchError(_)));
    }
}
