//! Delegated ("on-behalf-of") token exchange.
//!
//! A validated inbound token is traded at the identity provider for a token
//! scoped to the downstream database, still carrying the caller's identity.
//! Results are cached per subject and refreshed lazily when they come within
//! the refresh buffer of expiry.

mod cache;
mod client;

pub use cache::{ExchangeStatsSnapshot, ExchangedTokenEntry, TokenExchangeService, TokenState};
pub use client::{ExchangeError, ExchangedToken, GRANT_TYPE_JWT_BEARER, OboClient};
