//! Connection Pool Manager: one isolated, token-authenticated pool per user.
//!
//! Each subject gets its own connection, logged in with that user's
//! downstream token, so row-level security in the database sees the real
//! caller. Pools are created on first use, shared by later requests from the
//! same subject, and torn down when idle, when their token expires, or on
//! shutdown.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, watch};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::db::connection::{ConnectionFactory, Db};
use crate::db::error::{PoolError, PoolResult};
use crate::db::stats::{PoolManagerStats, PoolStatsSnapshot};
use crate::types::{SecretToken, SubjectId};

type CreationOutcome = Option<PoolResult<()>>;

const LIFECYCLE_OPEN: u8 = 0;
const LIFECYCLE_CLOSING: u8 = 1;
const LIFECYCLE_CLOSED: u8 = 2;

/// Lifecycle of a per-user pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Creating,
    Ready,
    /// Unused for longer than the idle timeout; the next sweep evicts it.
    Idle,
    Closing,
    Closed,
}

/// A single user's pooled connection.
pub struct PooledConnectionEntry {
    id: u64,
    subject: SubjectId,
    db: Db,
    created_at: Instant,
    /// Milliseconds after `created_at` of the latest acquisition or release.
    last_used_ms: AtomicU64,
    token_expires_at: DateTime<Utc>,
    in_use: AtomicUsize,
    permits: Arc<Semaphore>,
    lifecycle: AtomicU8,
}

impl PooledConnectionEntry {
    fn new(
        id: u64,
        subject: SubjectId,
        db: Db,
        token_expires_at: DateTime<Utc>,
        max_connections: usize,
    ) -> Self {
        Self {
            id,
            subject,
            db,
            created_at: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            token_expires_at,
            in_use: AtomicUsize::new(0),
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
            lifecycle: AtomicU8::new(LIFECYCLE_OPEN),
        }
    }

    fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_used_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subject_id(&self) -> &SubjectId {
        &self.subject
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.created_at + Duration::from_millis(self.last_used_ms.load(Ordering::Relaxed))
    }

    pub fn token_expires_at(&self) -> DateTime<Utc> {
        self.token_expires_at
    }

    /// Number of live `PoolHandle`s on this entry.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn token_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.token_expires_at
    }

    fn idle_for_longer_than(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_used()) > idle_timeout
    }

    pub fn state_at(&self, now: Instant, idle_timeout: Duration) -> PoolState {
        match self.lifecycle.load(Ordering::Acquire) {
            LIFECYCLE_CLOSING => PoolState::Closing,
            LIFECYCLE_CLOSED => PoolState::Closed,
            _ if self.in_use() == 0 && self.idle_for_longer_than(now, idle_timeout) => {
                PoolState::Idle
            }
            _ => PoolState::Ready,
        }
    }
}

impl fmt::Debug for PooledConnectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnectionEntry")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .field("token_expires_at", &self.token_expires_at)
            .field("in_use", &self.in_use())
            .finish_non_exhaustive()
    }
}

/// Marks an entry as in use for as long as it lives.
struct InUseGuard {
    entry: Arc<PooledConnectionEntry>,
}

impl InUseGuard {
    /// Must be called with the pool map locked so the sweep cannot observe
    /// a zero count for an entry that is about to be handed out.
    fn acquire(entry: Arc<PooledConnectionEntry>) -> Self {
        entry.in_use.fetch_add(1, Ordering::AcqRel);
        entry.touch();
        Self { entry }
    }
}

impl Drop for InUseGuard {
    fn drop(&mut self) {
        self.entry.touch();
        self.entry.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A user's authenticated connection, held for the duration of an operation.
///
/// While any handle exists the underlying pool is never torn down; dropping
/// the handle refreshes the pool's last-used time.
pub struct PoolHandle {
    _permit: OwnedSemaphorePermit,
    guard: InUseGuard,
}

impl PoolHandle {
    pub fn connection(&self) -> &Db {
        &self.guard.entry.db
    }

    pub fn subject_id(&self) -> &SubjectId {
        &self.guard.entry.subject
    }

    /// Identifier unique to this pool instance. A re-created pool for the
    /// same subject gets a new id.
    pub fn pool_id(&self) -> u64 {
        self.guard.entry.id
    }

    pub fn created_at(&self) -> Instant {
        self.guard.entry.created_at
    }

    pub fn token_expires_at(&self) -> DateTime<Utc> {
        self.guard.entry.token_expires_at
    }
}

impl Deref for PoolHandle {
    type Target = Db;

    fn deref(&self) -> &Db {
        self.connection()
    }
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle")
            .field("pool_id", &self.pool_id())
            .field("subject", self.subject_id())
            .finish()
    }
}

/// Outcome of one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub idle_evicted: usize,
    pub expired_evicted: usize,
    /// Token-expired pools still in use, moved to draining.
    pub retired: usize,
    /// Idle-looking pools skipped because a handle is still live.
    pub deferred: usize,
    /// Draining pools closed once their last handle dropped.
    pub drained: usize,
}

impl SweepReport {
    pub fn closed(&self) -> usize {
        self.idle_evicted + self.expired_evicted + self.drained
    }
}

enum Slot {
    Creating(watch::Receiver<CreationOutcome>),
    Ready(Arc<PooledConnectionEntry>),
}

#[derive(Default)]
struct PoolMap {
    slots: HashMap<SubjectId, Slot>,
    /// Removed from `slots` but still referenced by live handles.
    draining: Vec<Arc<PooledConnectionEntry>>,
    shutting_down: bool,
}

impl PoolMap {
    fn take_drained(&mut self) -> Vec<Arc<PooledConnectionEntry>> {
        let mut drained = Vec::new();
        self.draining.retain(|entry| {
            if entry.in_use() == 0 {
                drained.push(entry.clone());
                false
            } else {
                true
            }
        });
        drained
    }
}

enum Lookup {
    Hit(InUseGuard),
    Wait(watch::Receiver<CreationOutcome>),
}

struct PoolManagerInner {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    map: Mutex<PoolMap>,
    stats: PoolManagerStats,
    next_id: AtomicU64,
}

/// Maps subject ids to isolated per-user pools.
///
/// Cheap to clone; clones share the same pools.
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<PoolManagerInner>,
}

impl PoolManager {
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            inner: Arc::new(PoolManagerInner {
                config,
                factory,
                map: Mutex::new(PoolMap::default()),
                stats: PoolManagerStats::default(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get (or create) the pool for `subject`, authenticated with `token`.
    ///
    /// A second call for the same subject returns the same pool while its
    /// token is still valid. Concurrent calls during creation share one
    /// connection attempt. A subject without a pool is rejected once
    /// `max_concurrent_users` pools exist.
    pub async fn get_pool(
        &self,
        subject: &SubjectId,
        token: &SecretToken,
        token_expires_at: DateTime<Utc>,
    ) -> PoolResult<PoolHandle> {
        PoolManagerStats::incr(&self.inner.stats.total_requests);

        if Utc::now() >= token_expires_at {
            debug!(subject = %subject, "Refusing pool for an already-expired token");
            return Err(PoolError::TokenExpired);
        }

        let mut counted = false;
        loop {
            match self
                .lookup_or_create(subject, token, token_expires_at, &mut counted)
                .await?
            {
                Lookup::Hit(guard) => return self.acquire(guard).await,
                Lookup::Wait(rx) => wait_for_creation(rx).await?,
            }
        }
    }

    async fn lookup_or_create(
        &self,
        subject: &SubjectId,
        token: &SecretToken,
        token_expires_at: DateTime<Utc>,
        counted: &mut bool,
    ) -> PoolResult<Lookup> {
        let stats = &self.inner.stats;
        let mut map = self.inner.map.lock().await;

        if map.shutting_down {
            return Err(PoolError::ShuttingDown);
        }

        let existing = match map.slots.get(subject) {
            Some(Slot::Ready(entry)) => Some(Ok(entry.clone())),
            Some(Slot::Creating(rx)) => Some(Err(rx.clone())),
            None => None,
        };

        match existing {
            Some(Ok(entry)) if !entry.token_expired(Utc::now()) => {
                if !std::mem::replace(counted, true) {
                    PoolManagerStats::incr(&stats.cache_hits);
                }
                return Ok(Lookup::Hit(InUseGuard::acquire(entry)));
            }
            Some(Ok(entry)) => {
                info!(
                    subject = %subject,
                    pool_id = entry.id,
                    "Pool token expired, retiring pool"
                );
                map.slots.remove(subject);
                map.draining.push(entry);
            }
            // A creator task that died without reporting leaves a closed
            // channel behind; replace it.
            Some(Err(rx)) if rx.has_changed().is_err() && rx.borrow().is_none() => {
                warn!(subject = %subject, "Discarding abandoned pool creation");
                map.slots.remove(subject);
            }
            Some(Err(rx)) => {
                if !std::mem::replace(counted, true) {
                    PoolManagerStats::incr(&stats.cache_hits);
                }
                return Ok(Lookup::Wait(rx));
            }
            None => {}
        }

        let max_users = self.inner.config.max_concurrent_users;
        if map.slots.len() >= max_users {
            PoolManagerStats::incr(&stats.max_users_reached);
            warn!(
                subject = %subject,
                active = map.slots.len(),
                max_users,
                "Maximum concurrent users reached, rejecting new pool"
            );
            return Err(PoolError::CapacityExceeded { max_users });
        }

        if !std::mem::replace(counted, true) {
            PoolManagerStats::incr(&stats.cache_misses);
        }

        let (tx, rx) = watch::channel(None);
        map.slots.insert(subject.clone(), Slot::Creating(rx.clone()));

        let inner = self.inner.clone();
        let subject = subject.clone();
        let token = token.clone();
        tokio::spawn(async move {
            inner.create_pool(subject, token, token_expires_at, tx).await;
        });

        Ok(Lookup::Wait(rx))
    }

    async fn acquire(&self, guard: InUseGuard) -> PoolResult<PoolHandle> {
        let permits = guard.entry.permits.clone();
        let permit = tokio::time::timeout(self.inner.config.connect_timeout(), permits.acquire_owned())
            .await
            .map_err(|_| {
                debug!(subject = %guard.entry.subject, "Per-user connection limit reached");
                PoolError::Timeout
            })?
            .map_err(|_| PoolError::Connection("pool was closed".to_string()))?;

        Ok(PoolHandle {
            _permit: permit,
            guard,
        })
    }

    /// Evict idle and token-expired pools, and close drained ones.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now(), Utc::now()).await
    }

    pub(crate) async fn sweep_at(&self, now: Instant, wall_now: DateTime<Utc>) -> SweepReport {
        let idle_timeout = self.inner.config.idle_timeout();
        let mut report = SweepReport::default();
        let mut to_close = Vec::new();

        {
            let mut map = self.inner.map.lock().await;

            let mut candidates = Vec::new();
            for (subject, slot) in &map.slots {
                let Slot::Ready(entry) = slot else { continue };
                let expired = entry.token_expired(wall_now);
                if expired {
                    candidates.push((subject.clone(), true));
                } else if entry.idle_for_longer_than(now, idle_timeout) {
                    if entry.in_use() > 0 {
                        report.deferred += 1;
                    } else {
                        candidates.push((subject.clone(), false));
                    }
                }
            }

            for (subject, expired) in candidates {
                let Some(Slot::Ready(entry)) = map.slots.remove(&subject) else {
                    continue;
                };
                if entry.in_use() > 0 {
                    report.retired += 1;
                    map.draining.push(entry);
                } else {
                    if expired {
                        report.expired_evicted += 1;
                    } else {
                        report.idle_evicted += 1;
                    }
                    to_close.push((entry, if expired { "token_expired" } else { "idle" }));
                }
            }

            for entry in map.take_drained() {
                report.drained += 1;
                to_close.push((entry, "drained"));
            }
        }

        for (entry, reason) in to_close {
            self.inner.close_entry(&entry, reason).await;
        }

        if report.closed() + report.retired > 0 {
            info!(
                idle = report.idle_evicted,
                expired = report.expired_evicted,
                retired = report.retired,
                drained = report.drained,
                deferred = report.deferred,
                "Pool sweep evicted pools"
            );
        } else {
            debug!(deferred = report.deferred, "Pool sweep found nothing to evict");
        }

        report
    }

    /// Evict one subject's pool. Returns false if it had none.
    ///
    /// A pool that is still in use is moved to draining and closed by a
    /// later sweep.
    pub async fn force_close(&self, subject: &SubjectId) -> bool {
        let entry = {
            let mut map = self.inner.map.lock().await;
            if !matches!(map.slots.get(subject), Some(Slot::Ready(_))) {
                return false;
            }
            let Some(Slot::Ready(entry)) = map.slots.remove(subject) else {
                return false;
            };
            if entry.in_use() > 0 {
                debug!(subject = %subject, pool_id = entry.id, "Pool in use, deferring close");
                map.draining.push(entry);
                return true;
            }
            entry
        };

        self.inner.close_entry(&entry, "forced").await;
        true
    }

    /// Close every pool and refuse new requests.
    ///
    /// Pools still in use get `grace` to be released before they are closed
    /// regardless. Returns the number of pools closed.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let mut closed = 0;
        let to_close = {
            let mut map = self.inner.map.lock().await;
            map.shutting_down = true;

            // Dropping `Creating` slots makes their creator tasks close the
            // fresh connection and report `ShuttingDown`.
            let entries: Vec<_> = map
                .slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Ready(entry) => Some(entry),
                    Slot::Creating(_) => None,
                })
                .collect();
            map.draining.extend(entries);
            map.take_drained()
        };

        info!(
            closing = to_close.len(),
            "Shutting down connection pool manager"
        );
        for entry in to_close {
            self.inner.close_entry(&entry, "shutdown").await;
            closed += 1;
        }

        let deadline = Instant::now() + grace;
        loop {
            let (drained, remaining) = {
                let mut map = self.inner.map.lock().await;
                let drained = map.take_drained();
                if Instant::now() >= deadline {
                    let remaining = std::mem::take(&mut map.draining);
                    (drained, remaining)
                } else {
                    (drained, Vec::new())
                }
            };

            for entry in drained {
                self.inner.close_entry(&entry, "shutdown").await;
                closed += 1;
            }
            if !remaining.is_empty() {
                warn!(
                    count = remaining.len(),
                    "Closing pools still in use after shutdown grace period"
                );
                for entry in remaining {
                    self.inner.close_entry(&entry, "shutdown").await;
                    closed += 1;
                }
            }

            if self.inner.map.lock().await.draining.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        closed
    }

    /// Pools currently mapped to a subject (ready or being created).
    pub async fn active_pools(&self) -> usize {
        self.inner.map.lock().await.slots.len()
    }

    pub async fn draining_pools(&self) -> usize {
        self.inner.map.lock().await.draining.len()
    }

    pub async fn state_of(&self, subject: &SubjectId) -> Option<PoolState> {
        let map = self.inner.map.lock().await;
        match map.slots.get(subject)? {
            Slot::Creating(_) => Some(PoolState::Creating),
            Slot::Ready(entry) => {
                Some(entry.state_at(Instant::now(), self.inner.config.idle_timeout()))
            }
        }
    }

    pub async fn stats(&self) -> PoolStatsSnapshot {
        let (active, draining) = {
            let map = self.inner.map.lock().await;
            (map.slots.len(), map.draining.len())
        };
        PoolStatsSnapshot::collect(
            &self.inner.stats,
            active,
            draining,
            self.inner.config.max_concurrent_users,
        )
    }
}

impl PoolManagerInner {
    async fn create_pool(
        &self,
        subject: SubjectId,
        token: SecretToken,
        token_expires_at: DateTime<Utc>,
        tx: watch::Sender<CreationOutcome>,
    ) {
        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.config.connect_timeout(),
            self.factory.connect(&subject, &token),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PoolError::Timeout),
        };

        let mut map = self.map.lock().await;
        let still_pending = matches!(map.slots.get(&subject), Some(Slot::Creating(_)));

        let outcome = match result {
            Ok(db) if still_pending && !map.shutting_down => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let entry = Arc::new(PooledConnectionEntry::new(
                    id,
                    subject.clone(),
                    db,
                    token_expires_at,
                    self.config.max_connections_per_user,
                ));
                map.slots.insert(subject.clone(), Slot::Ready(entry));
                drop(map);

                PoolManagerStats::incr(&self.stats.pools_created);
                info!(
                    subject = %subject,
                    pool_id = id,
                    token = %token.fingerprint(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Created per-user connection pool"
                );
                Ok(())
            }
            Ok(db) => {
                drop(map);
                debug!(subject = %subject, "Pool created during shutdown, closing it");
                self.factory.close(db).await;
                Err(PoolError::ShuttingDown)
            }
            Err(e) => {
                if still_pending {
                    map.slots.remove(&subject);
                }
                drop(map);

                PoolManagerStats::incr(&self.stats.creation_failures);
                warn!(subject = %subject, error = %e, "Failed to create connection pool");
                Err(e)
            }
        };

        tx.send_replace(Some(outcome));
    }

    async fn close_entry(&self, entry: &PooledConnectionEntry, reason: &'static str) {
        if entry
            .lifecycle
            .compare_exchange(
                LIFECYCLE_OPEN,
                LIFECYCLE_CLOSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        entry.permits.close();
        self.factory.close(entry.db.clone()).await;
        entry.lifecycle.store(LIFECYCLE_CLOSED, Ordering::Release);

        PoolManagerStats::incr(&self.stats.pools_closed);
        info!(
            subject = %entry.subject,
            pool_id = entry.id,
            reason,
            lifetime_secs = entry.created_at.elapsed().as_secs(),
            "Closed connection pool"
        );
    }
}

async fn wait_for_creation(mut rx: watch::Receiver<CreationOutcome>) -> PoolResult<()> {
    let outcome = rx
        .wait_for(Option::is_some)
        .await
        .map_err(|_| PoolError::Internal("pool creation ended without a result".to_string()))?;

    (*outcome).clone().unwrap_or_else(|| {
        Err(PoolError::Internal(
            "pool creation ended without a result".to_string(),
        ))
    })
}
