use serde::{Deserialize, Serialize};
use std::env;
use std::future::Future;
use std::pin::Pin;
use surrealdb::Surreal;
use surrealdb::engine::any::Any;
use tracing::debug;

use crate::db::error::{PoolError, PoolResult};
use crate::types::{SecretToken, SubjectId};

pub type Db = Surreal<Any>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub namespace: String,
    pub database: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: env::var("SURREALDB_URL").unwrap_or_else(|_| "ws://127.0.0.1:8000".to_string()),
            namespace: env::var("SURREALDB_NAMESPACE").unwrap_or_else(|_| "app".to_string()),
            database: env::var("SURREALDB_DATABASE").unwrap_or_else(|_| "app".to_string()),
        }
    }
}

/// Opens authenticated per-user database connections.
///
/// Implementations must never share an underlying connection between two
/// calls: every `connect` yields a connection logged in with exactly the
/// token it was given.
pub trait ConnectionFactory: Send + Sync {
    fn connect<'a>(
        &'a self,
        subject: &'a SubjectId,
        token: &'a SecretToken,
    ) -> Pin<Box<dyn Future<Output = PoolResult<Db>> + Send + 'a>>;

    /// Release a connection. The default just drops the handle.
    fn close(&self, db: Db) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move { drop(db) })
    }
}

/// SurrealDB connection factory using token (not password) authentication.
pub struct SurrealConnectionFactory {
    config: DatabaseConfig,
}

impl SurrealConnectionFactory {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }
}

impl ConnectionFactory for SurrealConnectionFactory {
    fn connect<'a>(
        &'a self,
        subject: &'a SubjectId,
        token: &'a SecretToken,
    ) -> Pin<Box<dyn Future<Output = PoolResult<Db>> + Send + 'a>> {
        Box::pin(async move {
            debug!(subject = %subject, url = %self.config.url, "Opening per-user connection");

            let db = surrealdb::engine::any::connect(self.config.url.as_str())
                .await
                .map_err(|e| PoolError::Connection(e.to_string()))?;

            // On failure `db` is dropped here, tearing the connection down.
            db.authenticate(token.expose().to_string())
                .await
                .map_err(|e| PoolError::TokenRejected(e.to_string()))?;

            db.use_ns(self.config.namespace.clone())
                .use_db(self.config.database.clone())
                .await
                .map_err(|e| PoolError::Connection(e.to_string()))?;

            Ok(db)
        })
    }

    fn close(&self, db: Db) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if let Err(e) = db.invalidate().await {
                debug!("Invalidating session on close failed: {}", e);
            }
        })
    }
}
