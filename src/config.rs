//! Gateway configuration.
//!
//! Configuration is read from an optional JSON file (string values may contain
//! `${VAR}` references that are expanded from the environment) and then
//! overridden by CLI flags / environment variables in the binary.

use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use crate::db::DatabaseConfig;

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
pub const DEFAULT_CLOCK_TOLERANCE_SECONDS: u64 = 60;
pub const DEFAULT_MAX_CONCURRENT_USERS: usize = 100;
pub const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_CLEANUP_INTERVAL_SECONDS: u64 = 60;
pub const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_REFRESH_BUFFER_SECONDS: u64 = 300;

/// Identity provider settings used by the validator and the exchange client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Directory tenant id.
    pub tenant_id: String,
    /// Client id of this service's app registration.
    pub client_id: String,
    /// Client secret used for the on-behalf-of exchange.
    #[serde(default, skip_serializing)]
    pub client_secret: Option<String>,
    #[serde(default = "default_authority_host")]
    pub authority_host: String,
    /// Audience of tokens issued for this service (default `api://{client_id}`).
    #[serde(default)]
    pub audience: Option<String>,
    /// Additional audience accepted during a migration window.
    #[serde(default)]
    pub legacy_audience: Option<String>,
    /// Accepted issuers (default: the v2 and v1 issuer for the tenant).
    #[serde(default)]
    pub issuers: Vec<String>,
    /// Override for the signing key set URL.
    #[serde(default)]
    pub jwks_url: Option<String>,
    #[serde(default = "default_clock_tolerance_seconds")]
    pub clock_tolerance_seconds: u64,
    #[serde(default = "default_jwks_cache_seconds")]
    pub jwks_cache_seconds: u64,
    /// Minimum spacing between key set refetches triggered by unknown key ids.
    #[serde(default = "default_min_refetch_seconds")]
    pub min_refetch_seconds: u64,
    #[serde(default = "default_true")]
    pub allow_stale_keys: bool,
    /// Timeout for outbound identity provider calls.
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
}

/// Delegated token exchange settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Scope requested for the downstream database resource.
    pub downstream_scope: String,
    /// Override for the token endpoint URL.
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default = "default_refresh_buffer_seconds")]
    pub refresh_buffer_seconds: u64,
    /// Cached exchange results unused for longer than this are swept.
    #[serde(default = "default_retention_seconds")]
    pub retention_seconds: u64,
}

/// Per-user connection pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_concurrent_users")]
    pub max_concurrent_users: usize,
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
    /// Concurrent handles a single user may hold on their pool.
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub identity: IdentityConfig,
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// When set, every non-exempt request must carry a valid token.
    #[serde(default = "default_true")]
    pub enforce_auth: bool,
    /// Operations that may run before authentication (capability discovery).
    #[serde(default = "default_exempt_operations")]
    pub exempt_operations: Vec<String>,
}

fn default_authority_host() -> String {
    DEFAULT_AUTHORITY_HOST.to_string()
}

fn default_clock_tolerance_seconds() -> u64 {
    DEFAULT_CLOCK_TOLERANCE_SECONDS
}

fn default_jwks_cache_seconds() -> u64 {
    crate::auth::jwks::DEFAULT_CACHE_TTL_SECONDS
}

fn default_min_refetch_seconds() -> u64 {
    crate::auth::jwks::DEFAULT_MIN_REFETCH_SECONDS
}

fn default_http_timeout_seconds() -> u64 {
    10
}

fn default_refresh_buffer_seconds() -> u64 {
    DEFAULT_REFRESH_BUFFER_SECONDS
}

fn default_retention_seconds() -> u64 {
    3600
}

fn default_max_concurrent_users() -> usize {
    DEFAULT_MAX_CONCURRENT_USERS
}

fn default_idle_timeout_seconds() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECONDS
}

fn default_cleanup_interval_seconds() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECONDS
}

fn default_connect_timeout_seconds() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECONDS
}

fn default_max_connections_per_user() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_exempt_operations() -> Vec<String> {
    vec![crate::api::LIST_CAPABILITIES.to_string()]
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_users: DEFAULT_MAX_CONCURRENT_USERS,
            idle_timeout_seconds: DEFAULT_IDLE_TIMEOUT_SECONDS,
            cleanup_interval_seconds: DEFAULT_CLEANUP_INTERVAL_SECONDS,
            connect_timeout_seconds: DEFAULT_CONNECT_TIMEOUT_SECONDS,
            max_connections_per_user: default_max_connections_per_user(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

impl IdentityConfig {
    /// Create a config for a tenant / app registration with all defaults.
    pub fn new(tenant_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: None,
            authority_host: default_authority_host(),
            audience: None,
            legacy_audience: None,
            issuers: Vec::new(),
            jwks_url: None,
            clock_tolerance_seconds: DEFAULT_CLOCK_TOLERANCE_SECONDS,
            jwks_cache_seconds: default_jwks_cache_seconds(),
            min_refetch_seconds: default_min_refetch_seconds(),
            allow_stale_keys: true,
            http_timeout_seconds: default_http_timeout_seconds(),
        }
    }

    fn authority(&self) -> String {
        format!(
            "{}/{}",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        )
    }

    /// Signing key set URL for the tenant.
    pub fn jwks_url(&self) -> String {
        self.jwks_url
            .clone()
            .unwrap_or_else(|| format!("{}/discovery/v2.0/keys", self.authority()))
    }

    /// Token endpoint used for the delegated exchange.
    pub fn token_url(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority())
    }

    /// Issuers accepted on inbound tokens.
    pub fn accepted_issuers(&self) -> Vec<String> {
        if !self.issuers.is_empty() {
            return self.issuers.clone();
        }
        vec![
            format!("{}/v2.0", self.authority()),
            format!("https://sts.windows.net/{}/", self.tenant_id),
        ]
    }

    /// The service's own audience followed by the legacy audience, if any.
    pub fn accepted_audiences(&self) -> Vec<String> {
        let mut audiences = vec![
            self.audience
                .clone()
                .unwrap_or_else(|| format!("api://{}", self.client_id)),
        ];
        if let Some(legacy) = &self.legacy_audience {
            audiences.push(legacy.clone());
        }
        audiences
    }

    pub fn clock_tolerance(&self) -> Duration {
        Duration::from_secs(self.clock_tolerance_seconds)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }
}

impl ExchangeConfig {
    pub fn new(downstream_scope: impl Into<String>) -> Self {
        Self {
            downstream_scope: downstream_scope.into(),
            token_url: None,
            refresh_buffer_seconds: DEFAULT_REFRESH_BUFFER_SECONDS,
            retention_seconds: default_retention_seconds(),
        }
    }

    pub fn refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.refresh_buffer_seconds)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }
}

impl GatewayConfig {
    pub fn new(identity: IdentityConfig, exchange: ExchangeConfig) -> Self {
        Self {
            identity,
            exchange,
            pool: PoolConfig::default(),
            database: DatabaseConfig::default(),
            enforce_auth: true,
            exempt_operations: default_exempt_operations(),
        }
    }

    /// Load a JSON config file, expanding `${VAR}` references in string values.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let mut value: serde_json::Value = serde_json::from_str(&raw)?;
        expand_json_strings(&mut value);
        let config: GatewayConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolved token endpoint (explicit override wins).
    pub fn token_url(&self) -> String {
        self.exchange
            .token_url
            .clone()
            .unwrap_or_else(|| self.identity.token_url())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.identity.tenant_id.trim().is_empty() {
            anyhow::bail!("identity.tenant_id must be set");
        }
        if self.identity.client_id.trim().is_empty() {
            anyhow::bail!("identity.client_id must be set");
        }
        if self.exchange.downstream_scope.trim().is_empty() {
            anyhow::bail!("exchange.downstream_scope must be set");
        }
        if self.pool.max_concurrent_users == 0 {
            anyhow::bail!("pool.max_concurrent_users must be greater than zero");
        }
        if self.pool.max_connections_per_user == 0 {
            anyhow::bail!("pool.max_connections_per_user must be greater than zero");
        }
        if self.pool.cleanup_interval_seconds == 0 {
            anyhow::bail!("pool.cleanup_interval_seconds must be greater than zero");
        }
        for url in [self.identity.jwks_url(), self.token_url()] {
            url::Url::parse(&url)
                .map_err(|e| anyhow::anyhow!("Invalid identity provider URL `{}`: {}", url, e))?;
        }
        Ok(())
    }
}

/// Locate a config file: `RLS_GATEWAY_CONFIG`, then
/// `$XDG_CONFIG_HOME/rls-gateway/config.json`, then `./rls-gateway.json`.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("RLS_GATEWAY_CONFIG") {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("rls-gateway").join("config.json");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from("rls-gateway.json");
    candidate.exists().then_some(candidate)
}

fn expand_json_strings(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => *s = expand_env_vars(s),
        serde_json::Value::Array(items) => items.iter_mut().for_each(expand_json_strings),
        serde_json::Value::Object(map) => map.values_mut().for_each(expand_json_strings),
        _ => {}
    }
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}
