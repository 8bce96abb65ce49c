//! Per-user cache of exchanged tokens with single-flight refresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::auth::UserIdentity;
use crate::exchange::client::{ExchangeError, ExchangedToken, OboClient};
use crate::types::{SecretToken, SubjectId};

type ExchangeOutcome = Option<Result<ExchangedToken, ExchangeError>>;

/// Freshness of a cached downstream token, evaluated on every access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// Usable as is.
    Valid,
    /// Still technically valid but inside the refresh buffer.
    NearExpiry,
    Expired,
}

impl TokenState {
    pub fn evaluate(
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
        refresh_buffer: chrono::Duration,
    ) -> Self {
        if now >= expires_at {
            Self::Expired
        } else if now >= expires_at - refresh_buffer {
            Self::NearExpiry
        } else {
            Self::Valid
        }
    }
}

/// Cached exchange result for one subject.
#[derive(Debug, Clone)]
pub struct ExchangedTokenEntry {
    pub token: ExchangedToken,
    pub last_used: Instant,
}

#[derive(Default)]
struct ExchangeState {
    entries: HashMap<SubjectId, ExchangedTokenEntry>,
    in_flight: HashMap<SubjectId, watch::Receiver<ExchangeOutcome>>,
}

#[derive(Default)]
struct ExchangeCounters {
    exchanges: AtomicU64,
    cache_hits: AtomicU64,
    coalesced: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time view of the exchange cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeStatsSnapshot {
    pub exchanges: u64,
    pub cache_hits: u64,
    pub coalesced: u64,
    pub failures: u64,
    pub cached_entries: usize,
}

struct ExchangeInner {
    client: OboClient,
    refresh_buffer: chrono::Duration,
    retention: Duration,
    state: Mutex<ExchangeState>,
    counters: ExchangeCounters,
}

/// Token Exchange Service.
///
/// Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct TokenExchangeService {
    inner: Arc<ExchangeInner>,
}

impl TokenExchangeService {
    pub fn new(client: OboClient, refresh_buffer: Duration, retention: Duration) -> Self {
        let refresh_buffer =
            chrono::Duration::from_std(refresh_buffer).unwrap_or(chrono::Duration::zero());
        Self {
            inner: Arc::new(ExchangeInner {
                client,
                refresh_buffer,
                retention,
                state: Mutex::new(ExchangeState::default()),
                counters: ExchangeCounters::default(),
            }),
        }
    }

    /// Get a downstream token for `identity`, exchanging only when the cached
    /// one is missing or inside the refresh buffer.
    ///
    /// Concurrent calls for the same subject during a miss share one outbound
    /// exchange. The exchange runs on its own task, so a caller that goes away
    /// does not cancel it for the others.
    pub async fn exchange(&self, identity: &UserIdentity) -> Result<ExchangedToken, ExchangeError> {
        let subject = identity.subject_id();

        let rx = {
            let mut state = self.inner.state.lock().await;

            if let Some(entry) = state.entries.get_mut(subject) {
                match TokenState::evaluate(entry.token.expires_at, Utc::now(), self.inner.refresh_buffer) {
                    TokenState::Valid => {
                        entry.last_used = Instant::now();
                        self.inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(entry.token.clone());
                    }
                    stale => {
                        debug!(subject = %subject, state = ?stale, "Cached downstream token needs refresh");
                        state.entries.remove(subject);
                    }
                }
            }

            // An exchange task that died without reporting leaves a closed
            // channel behind; start over instead of waiting on it.
            if state
                .in_flight
                .get(subject)
                .is_some_and(|rx| rx.has_changed().is_err() && rx.borrow().is_none())
            {
                warn!(subject = %subject, "Discarding abandoned exchange");
                state.in_flight.remove(subject);
            }

            match state.in_flight.get(subject) {
                Some(rx) => {
                    self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    state.in_flight.insert(subject.clone(), rx.clone());

                    let inner = self.inner.clone();
                    let subject = subject.clone();
                    let assertion = identity.token().clone();
                    tokio::spawn(async move {
                        inner.run_exchange(subject, assertion, tx).await;
                    });
                    rx
                }
            }
        };

        wait_for_outcome(rx).await
    }

    /// Drop the cached token for a subject.
    pub async fn invalidate(&self, subject: &SubjectId) -> bool {
        self.inner.state.lock().await.entries.remove(subject).is_some()
    }

    /// Evict entries unused beyond the retention window, and expired ones.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Instant::now(), Utc::now()).await
    }

    pub(crate) async fn sweep_at(&self, now: Instant, wall_now: DateTime<Utc>) -> usize {
        let mut state = self.inner.state.lock().await;
        let before = state.entries.len();
        let retention = self.inner.retention;

        state.entries.retain(|_, entry| {
            let unused = now.saturating_duration_since(entry.last_used) > retention;
            let expired = wall_now >= entry.token.expires_at;
            !(unused || expired)
        });

        before - state.entries.len()
    }

    pub async fn cached_entries(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    pub async fn stats(&self) -> ExchangeStatsSnapshot {
        let counters = &self.inner.counters;
        ExchangeStatsSnapshot {
            exchanges: counters.exchanges.load(Ordering::Relaxed),
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            coalesced: counters.coalesced.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            cached_entries: self.cached_entries().await,
        }
    }
}

impl ExchangeInner {
    async fn run_exchange(
        &self,
        subject: SubjectId,
        assertion: SecretToken,
        tx: watch::Sender<ExchangeOutcome>,
    ) {
        let result = self.client.exchange(&assertion).await;

        {
            let mut state = self.state.lock().await;
            state.in_flight.remove(&subject);

            match &result {
                Ok(token) => {
                    self.counters.exchanges.fetch_add(1, Ordering::Relaxed);
                    info!(subject = %subject, expires_at = %token.expires_at, "Downstream token issued");
                    state.entries.insert(
                        subject.clone(),
                        ExchangedTokenEntry {
                            token: token.clone(),
                            last_used: Instant::now(),
                        },
                    );
                }
                Err(e) => {
                    // Nothing is cached, so the next call starts clean.
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(subject = %subject, error = %e, "On-behalf-of exchange failed");
                }
            }
        }

        tx.send_replace(Some(result));
    }
}

async fn wait_for_outcome(
    mut rx: watch::Receiver<ExchangeOutcome>,
) -> Result<ExchangedToken, ExchangeError> {
    let outcome = rx.wait_for(Option::is_some).await.map_err(|_| {
        ExchangeError::Internal("exchange task ended without a result".to_string())
    })?;

    (*outcome).clone().unwrap_or_else(|| {
        Err(ExchangeError::Internal(
            "exchange task ended without a result".to_string(),
        ))
    })
}
