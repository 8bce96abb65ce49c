pub mod api;
pub mod auth;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod exchange;
pub mod gateway;
pub mod types;

#[cfg(test)]
mod testutil;

// Re-export key types and functions
pub use auth::{AuthError, TokenValidator, UserIdentity};
pub use config::{ExchangeConfig, GatewayConfig, IdentityConfig, PoolConfig};
pub use db::{
    ConnectionFactory, DatabaseConfig, PoolError, PoolHandle, PoolManager,
    SurrealConnectionFactory,
};
pub use exchange::{ExchangeError, TokenExchangeService};
pub use gateway::{AuthGateway, GatewayError, PoolAccessor, RequestContext};
pub use types::{SecretToken, SubjectId, TenantId};

use std::sync::Arc;

/// Convenience function to create a gateway backed by SurrealDB.
///
/// Every pool the gateway opens logs in to `config.database` with the
/// caller's own downstream token.
pub fn create_gateway(config: &GatewayConfig) -> anyhow::Result<Arc<AuthGateway>> {
    config.validate()?;
    let factory = Arc::new(SurrealConnectionFactory::new(config.database.clone()));
    Ok(Arc::new(AuthGateway::from_config(config, factory)?))
}
