//! Connection pooling
//!
//! One [`ConnectionPool`] per role. Outstanding connections are bounded by a
//! semaphore, so acquiring past `max_size` waits up to the acquire timeout
//! instead of spinning. Reused connections are probed before hand-out, and
//! [`ConnectionPool::reconnect`] retires every connection of the current
//! generation.

use super::connector::{Connector, Endpoint, SqlConnection};
use super::error::{DatabaseError, DbResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Pool role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolRole {
    /// Read-write
    Master,
    /// Read-only, round-robin across endpoints
    Replica,
}

impl fmt::Display for PoolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolRole::Master => write!(f, "master"),
            PoolRole::Replica => write!(f, "replica"),
        }
    }
}

/// Pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Hard cap on outstanding connections
    pub max_size: u32,
    /// Connections opened ahead of demand
    pub min_idle: u32,
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_idle: 2,
            acquire_timeout_ms: 3000,
        }
    }
}

impl PoolConfig {
    pub fn with_max_size(mut self, max_size: u32) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_min_idle(mut self, min_idle: u32) -> Self {
        self.min_idle = min_idle;
        self
    }

    pub fn with_acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }
}

/// Pool statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatistics {
    pub role: PoolRole,
    /// Connections parked and ready for reuse
    pub idle: usize,
    /// Connections currently lent out
    pub in_use: usize,
    /// Connections alive (idle + in use)
    pub total: usize,
    pub max: usize,
    /// Connections opened since creation
    pub created: u64,
    /// Connections dropped after a failed probe, an error or a reconnect
    pub discarded: u64,
}

struct Entry {
    conn: Box<dyn SqlConnection>,
    generation: u64,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Entry>,
    in_use: usize,
    total: usize,
}

struct Shared {
    state: Mutex<PoolState>,
    generation: AtomicU64,
    discarded: AtomicU64,
}

/// One slot of `total` held across an await
///
/// Dropping it without [`commit`](Reservation::commit) gives the slot back,
/// so an acquire or warm-up whose future is dropped mid-connect or
/// mid-probe leaves `total == idle + in_use` intact.
struct Reservation<'a> {
    shared: &'a Shared,
    /// The slot belonged to a live connection, count it as discarded
    discard: bool,
    armed: bool,
}

impl<'a> Reservation<'a> {
    /// Slot already counted in `total` for a connection being opened
    fn opening(shared: &'a Shared) -> Self {
        Self {
            shared,
            discard: false,
            armed: true,
        }
    }

    /// Slot of a connection taken off the idle queue
    fn popped(shared: &'a Shared) -> Self {
        Self {
            shared,
            discard: true,
            armed: true,
        }
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.shared.state.lock().total -= 1;
        if self.discard {
            self.shared.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Bounded pool of connections to one role
pub struct ConnectionPool {
    role: PoolRole,
    endpoints: Vec<Endpoint>,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    shared: Arc<Shared>,
    next_endpoint: AtomicUsize,
    created: AtomicU64,
    reconnect_lock: tokio::sync::Mutex<()>,
}

impl ConnectionPool {
    /// Create an empty pool; call [`warm_up`](Self::warm_up) to pre-open connections
    pub fn new(
        role: PoolRole,
        endpoints: Vec<Endpoint>,
        connector: Arc<dyn Connector>,
        config: PoolConfig,
    ) -> DbResult<Self> {
        if endpoints.is_empty() {
            return Err(DatabaseError::Configuration(format!(
                "{} pool has no endpoints",
                role
            )));
        }
        if config.max_size == 0 {
            return Err(DatabaseError::Configuration(format!(
                "{} pool max_size must be positive",
                role
            )));
        }

        Ok(Self {
            role,
            endpoints,
            connector,
            permits: Arc::new(Semaphore::new(config.max_size as usize)),
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::default()),
                generation: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
            next_endpoint: AtomicUsize::new(0),
            created: AtomicU64::new(0),
            reconnect_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn role(&self) -> PoolRole {
        self.role
    }

    /// Open connections until `min_idle` are parked; returns how many were opened
    pub async fn warm_up(&self) -> DbResult<usize> {
        let target = self.config.min_idle.min(self.config.max_size) as usize;
        let max = self.config.max_size as usize;
        let mut opened = 0;

        loop {
            let generation = {
                let mut state = self.shared.state.lock();
                if state.idle.len() >= target || state.total >= max {
                    break;
                }
                state.total += 1;
                self.shared.generation.load(Ordering::SeqCst)
            };
            let slot = Reservation::opening(&self.shared);

            let entry = self.open(generation).await?;
            self.shared.state.lock().idle.push_back(entry);
            slot.commit();
            opened += 1;
        }

        if opened > 0 {
            debug!(role = %self.role, opened = opened, "Pool warmed up");
        }
        Ok(opened)
    }

    /// Borrow a connection, waiting up to the acquire timeout
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        let timeout = Duration::from_millis(self.config.acquire_timeout_ms);
        let permit = tokio::time::timeout(timeout, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| {
                warn!(
                    role = %self.role,
                    timeout_ms = self.config.acquire_timeout_ms,
                    "Pool exhausted"
                );
                DatabaseError::PoolExhausted(format!(
                    "{} pool: no connection within {} ms",
                    self.role, self.config.acquire_timeout_ms
                ))
            })?
            .map_err(|_| DatabaseError::PoolExhausted(format!("{} pool is closed", self.role)))?;

        let generation = self.shared.generation.load(Ordering::SeqCst);

        loop {
            let candidate = self.shared.state.lock().idle.pop_front();
            let Some(mut entry) = candidate else { break };
            let slot = Reservation::popped(&self.shared);

            if entry.generation != generation {
                continue;
            }
            match entry.conn.ping().await {
                Ok(()) => return Ok(self.lend(entry, slot, permit)),
                Err(e) => {
                    warn!(
                        role = %self.role,
                        error = %e,
                        "Liveness probe failed, replacing connection"
                    );
                    break;
                }
            }
        }

        self.shared.state.lock().total += 1;
        let slot = Reservation::opening(&self.shared);
        let entry = self.open(generation).await?;
        Ok(self.lend(entry, slot, permit))
    }

    /// Retire every connection and open fresh ones
    ///
    /// Holds this pool's reconnect lock; other pools are unaffected.
    /// Connections currently lent out are dropped when returned.
    pub async fn reconnect(&self) -> DbResult<()> {
        let _guard = self.reconnect_lock.lock().await;

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let retired = {
            let mut state = self.shared.state.lock();
            let retired = state.idle.len();
            state.idle.clear();
            state.total -= retired;
            retired
        };
        self.shared
            .discarded
            .fetch_add(retired as u64, Ordering::Relaxed);

        info!(role = %self.role, generation = generation, retired = retired, "Reconnecting pool");
        self.warm_up().await.map(|_| ())
    }

    pub fn stats(&self) -> PoolStatistics {
        let state = self.shared.state.lock();
        PoolStatistics {
            role: self.role,
            idle: state.idle.len(),
            in_use: state.in_use,
            total: state.total,
            max: self.config.max_size as usize,
            created: self.created.load(Ordering::Relaxed),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
        }
    }

    /// Open one connection, trying each endpoint once in round-robin order
    async fn open(&self, generation: u64) -> DbResult<Entry> {
        let mut last_error = None;

        for _ in 0..self.endpoints.len() {
            let slot = self.next_endpoint.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
            let endpoint = &self.endpoints[slot];

            match self.connector.connect(endpoint).await {
                Ok(conn) => {
                    self.created.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        role = %self.role,
                        endpoint = %endpoint.display_addr(),
                        "Opened connection"
                    );
                    return Ok(Entry { conn, generation });
                }
                Err(e) => {
                    warn!(
                        role = %self.role,
                        endpoint = %endpoint.display_addr(),
                        error = %e,
                        "Connect failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DatabaseError::Configuration(format!("{} pool has no endpoints", self.role))
        }))
    }

    fn lend(
        &self,
        entry: Entry,
        slot: Reservation<'_>,
        permit: OwnedSemaphorePermit,
    ) -> PooledConnection {
        slot.commit();
        self.shared.state.lock().in_use += 1;
        PooledConnection {
            entry: Some(entry),
            broken: false,
            shared: Arc::clone(&self.shared),
            _permit: permit,
        }
    }
}

/// A borrowed connection; returns to the pool on drop
pub struct PooledConnection {
    entry: Option<Entry>,
    broken: bool,
    shared: Arc<Shared>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn conn(&mut self) -> DbResult<&mut dyn SqlConnection> {
        match self.entry.as_mut() {
            Some(entry) => Ok(entry.conn.as_mut()),
            None => Err(DatabaseError::Transient("connection already released".to_string())),
        }
    }

    /// Drop instead of returning to the pool
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(entry) = self.entry.take() else { return };
        let current = self.shared.generation.load(Ordering::SeqCst);

        let mut state = self.shared.state.lock();
        state.in_use -= 1;
        if self.broken || entry.generation != current {
            state.total -= 1;
            drop(state);
            self.shared.discarded.fetch_add(1, Ordering::Relaxed);
        } else {
            state.idle.push_back(entry);
        }
    }
}
