//! Redis-backed snapshot store

use super::{KvError, KvResult, SnapshotStore};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const SCAN_BATCH: usize = 200;

/// Redis connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://:password@127.0.0.1:6379/0`
    pub url: String,
    /// Upper bound on one connection attempt
    pub connect_timeout_ms: u64,
    /// Minimum gap between reconnects started by failing operations
    pub reconnect_interval_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            connect_timeout_ms: 5000,
            reconnect_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Snapshot store over a multiplexed Redis connection
///
/// Construction never touches the network. Call [`connect_async`] and
/// optionally [`wait_for_connection`]; until a connection is live every
/// operation fails fast with [`KvError::NotReady`]. An operation that finds
/// the link down starts a new background attempt, at most once per
/// `reconnect_interval_ms`.
///
/// [`connect_async`]: RedisSnapshotStore::connect_async
/// [`wait_for_connection`]: RedisSnapshotStore::wait_for_connection
pub struct RedisSnapshotStore {
    client: redis::Client,
    config: RedisConfig,
    connection: Arc<RwLock<Option<MultiplexedConnection>>>,
    state: Arc<watch::Sender<LinkState>>,
    last_attempt: parking_lot::Mutex<Option<Instant>>,
}

impl RedisSnapshotStore {
    /// Create a store from configuration without connecting
    pub fn new(config: RedisConfig) -> KvResult<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| KvError::Transport(format!("Invalid Redis URL: {}", e)))?;
        let (state, _rx) = watch::channel(LinkState::Disconnected);

        Ok(Self {
            client,
            config,
            connection: Arc::new(RwLock::new(None)),
            state: Arc::new(state),
            last_attempt: parking_lot::Mutex::new(None),
        })
    }

    /// Start connecting in the background; no-op if already connected or connecting
    pub fn connect_async(&self) {
        let current = *self.state.borrow();
        if matches!(current, LinkState::Connected | LinkState::Connecting) {
            return;
        }
        self.state.send_replace(LinkState::Connecting);
        *self.last_attempt.lock() = Some(Instant::now());

        let client = self.client.clone();
        let slot = Arc::clone(&self.connection);
        let state = Arc::clone(&self.state);
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);

        tokio::spawn(async move {
            let attempt = tokio::time::timeout(timeout, async {
                let mut conn = client.get_multiplexed_async_connection().await?;
                redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
                Ok::<_, redis::RedisError>(conn)
            })
            .await;

            match attempt {
                Ok(Ok(conn)) => {
                    *slot.write().await = Some(conn);
                    state.send_replace(LinkState::Connected);
                    info!("Redis connected");
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Redis connection failed");
                    state.send_replace(LinkState::Failed);
                }
                Err(_) => {
                    error!(timeout_ms = timeout.as_millis() as u64, "Redis connection timed out");
                    state.send_replace(LinkState::Failed);
                }
            }
        });
    }

    /// Wait until the pending connection attempt settles
    ///
    /// Returns `true` if a connection is live. Returns `false` on failure,
    /// on timeout, or when no attempt was started.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        if *rx.borrow() == LinkState::Disconnected {
            return false;
        }
        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, LinkState::Connected | LinkState::Failed)),
        )
        .await;

        match settled {
            Ok(Ok(state)) => *state == LinkState::Connected,
            _ => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Gave up waiting for Redis");
                false
            }
        }
    }

    /// Drop the connection
    pub async fn disconnect(&self) {
        if self.connection.write().await.take().is_some() {
            info!("Redis disconnected");
        }
        self.state.send_replace(LinkState::Disconnected);
    }

    async fn live_connection(&self) -> KvResult<MultiplexedConnection> {
        if let Some(conn) = self.connection.read().await.clone() {
            return Ok(conn);
        }
        self.reconnect_if_due();
        Err(KvError::NotReady("Redis is not connected".to_string()))
    }

    /// Start a background attempt unless one ran within the reconnect interval
    fn reconnect_if_due(&self) {
        if matches!(*self.state.borrow(), LinkState::Connecting | LinkState::Connected) {
            return;
        }
        let interval = Duration::from_millis(self.config.reconnect_interval_ms);
        let due = match *self.last_attempt.lock() {
            Some(at) => at.elapsed() >= interval,
            None => true,
        };
        if due {
            info!("Redis link down, reconnecting");
            self.connect_async();
        }
    }

    /// Map a driver error, dropping the connection if the link itself failed
    async fn transport_error(&self, key: &str, err: redis::RedisError) -> KvError {
        error!(key = key, error = %err, "Redis command failed");
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            self.connection.write().await.take();
            self.state.send_replace(LinkState::Disconnected);
        }
        KvError::Transport(err.to_string())
    }
}

#[async_trait]
impl SnapshotStore for RedisSnapshotStore {
    fn is_connected(&self) -> bool {
        *self.state.borrow() == LinkState::Connected
    }

    async fn fetch_hash(&self, key: &str) -> KvResult<HashMap<String, String>> {
        let mut conn = self.live_connection().await?;
        let hash: HashMap<String, String> = match conn.hgetall(key).await {
            Ok(hash) => hash,
            Err(e) => return Err(self.transport_error(key, e).await),
        };
        if hash.is_empty() {
            return Err(KvError::NotFound(key.to_string()));
        }
        debug!(key = key, fields = hash.len(), "HGETALL");
        Ok(hash)
    }

    async fn find_keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        let mut conn = self.live_connection().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let scanned: redis::RedisResult<(u64, Vec<String>)> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await;
            let (next, batch) = match scanned {
                Ok(page) => page,
                Err(e) => return Err(self.transport_error(pattern, e).await),
            };
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        debug!(pattern = pattern, found = keys.len(), "SCAN");
        Ok(keys)
    }

    async fn get(&self, key: &str) -> KvResult<String> {
        let mut conn = self.live_connection().await?;
        let value: Option<String> = match conn.get(key).await {
            Ok(value) => value,
            Err(e) => return Err(self.transport_error(key, e).await),
        };
        value.ok_or_else(|| KvError::NotFound(key.to_string()))
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        let mut conn = self.live_connection().await?;
        match conn.hget(key, field).await {
            Ok(value) => Ok(value),
            Err(e) => Err(self.transport_error(key, e).await),
        }
    }
}
