//! Request-scoped context handed to operation handlers.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::auth::{AuthError, UserIdentity};
use crate::db::{PoolHandle, PoolManager};
use crate::gateway::GatewayError;
use crate::types::{SecretToken, SubjectId};

/// Outcome of authenticating one inbound request.
///
/// `Anonymous` only exists when enforcement is off or the operation is on the
/// exempt list. It runs outside row-level-security guarantees and has no
/// database access.
#[derive(Debug)]
pub enum RequestContext {
    Anonymous,
    Authenticated(AuthenticatedContext),
}

impl RequestContext {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }

    pub fn identity(&self) -> Option<&UserIdentity> {
        match self {
            Self::Anonymous => None,
            Self::Authenticated(ctx) => Some(ctx.identity()),
        }
    }

    /// The authenticated context, or `MISSING_TOKEN` for anonymous callers.
    pub fn require_authenticated(&self) -> Result<&AuthenticatedContext, GatewayError> {
        match self {
            Self::Anonymous => Err(GatewayError::Authentication(AuthError::MissingToken)),
            Self::Authenticated(ctx) => Ok(ctx),
        }
    }
}

/// Identity plus on-demand access to the caller's own database pool.
pub struct AuthenticatedContext {
    request_id: Uuid,
    identity: Arc<UserIdentity>,
    pool: PoolAccessor,
}

impl AuthenticatedContext {
    pub(crate) fn new(request_id: Uuid, identity: Arc<UserIdentity>, pool: PoolAccessor) -> Self {
        Self {
            request_id,
            identity,
            pool,
        }
    }

    /// Correlates this request with its audit log line.
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    pub fn pool(&self) -> &PoolAccessor {
        &self.pool
    }
}

impl fmt::Debug for AuthenticatedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedContext")
            .field("request_id", &self.request_id)
            .field("subject", self.identity.subject_id())
            .finish_non_exhaustive()
    }
}

/// Lazily binds a request to its user's pool.
///
/// Nothing is connected until `get` is called, so handlers that never touch
/// the database never create a pool.
#[derive(Clone)]
pub struct PoolAccessor {
    subject: SubjectId,
    token: SecretToken,
    token_expires_at: DateTime<Utc>,
    pools: PoolManager,
}

impl PoolAccessor {
    pub(crate) fn new(
        subject: SubjectId,
        token: SecretToken,
        token_expires_at: DateTime<Utc>,
        pools: PoolManager,
    ) -> Self {
        Self {
            subject,
            token,
            token_expires_at,
            pools,
        }
    }

    pub async fn get(&self) -> Result<PoolHandle, GatewayError> {
        Ok(self
            .pools
            .get_pool(&self.subject, &self.token, self.token_expires_at)
            .await?)
    }

    pub fn subject_id(&self) -> &SubjectId {
        &self.subject
    }

    pub fn token_expires_at(&self) -> DateTime<Utc> {
        self.token_expires_at
    }
}

impl fmt::Debug for PoolAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolAccessor")
            .field("subject", &self.subject)
            .field("token", &self.token)
            .field("token_expires_at", &self.token_expires_at)
            .finish()
    }
}
