//! Resilient data store client
//!
//! Routes statements to the master or replica pool, retries transient
//! failures with backoff, and when retries under the current connections are
//! exhausted reconnects the pool and runs the retry policy once more. Slow
//! statements are logged and counted.

use super::connector::{Connector, Endpoint};
use super::error::{DatabaseError, DbResult};
use super::pool::{ConnectionPool, PoolConfig, PoolRole, PoolStatistics};
use super::retry::{retry_with_backoff, RetryConfig};
use super::value::{DbRow, DbValue};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Routing and observation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Send replica-preferring reads to the replica pool when one exists
    pub read_from_replicas: bool,
    /// Statements slower than this are logged and counted
    pub slow_sql_ms: u64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            read_from_replicas: true,
            slow_sql_ms: 200,
        }
    }
}

/// The `database` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub master: Endpoint,
    pub replicas: Vec<Endpoint>,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub behavior: BehaviorConfig,
}

/// Store statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatistics {
    pub master: PoolStatistics,
    pub replica: Option<PoolStatistics>,
    /// Statements run since creation
    pub statements: u64,
    /// Statements over the slow threshold
    pub slow_statements: u64,
}

#[derive(Debug, Clone, Copy)]
enum Statement {
    Query,
    Update,
}

impl Statement {
    fn name(self) -> &'static str {
        match self {
            Statement::Query => "query",
            Statement::Update => "update",
        }
    }
}

enum Outcome {
    Rows(Vec<DbRow>),
    Affected(u64),
}

/// Pooled, retrying SQL client
pub struct DataStore {
    master: ConnectionPool,
    replica: Option<ConnectionPool>,
    retry: RetryConfig,
    behavior: BehaviorConfig,
    statements: AtomicU64,
    slow_statements: AtomicU64,
}

impl DataStore {
    /// Build both pools without opening connections
    pub fn new(config: DatabaseConfig, connector: Arc<dyn Connector>) -> DbResult<Self> {
        let master = ConnectionPool::new(
            PoolRole::Master,
            vec![config.master.clone()],
            Arc::clone(&connector),
            config.pool.clone(),
        )?;

        let replica = if config.replicas.is_empty() {
            None
        } else {
            Some(ConnectionPool::new(
                PoolRole::Replica,
                config.replicas.clone(),
                connector,
                config.pool.clone(),
            )?)
        };

        Ok(Self {
            master,
            replica,
            retry: config.retry,
            behavior: config.behavior,
            statements: AtomicU64::new(0),
            slow_statements: AtomicU64::new(0),
        })
    }

    /// Build the store and pre-open `min_idle` connections per pool
    ///
    /// A replica that cannot be reached is logged and left to connect on
    /// demand; an unreachable master is an error.
    pub async fn connect(config: DatabaseConfig, connector: Arc<dyn Connector>) -> DbResult<Self> {
        let store = Self::new(config, connector)?;
        store.master.warm_up().await?;
        if let Some(replica) = &store.replica {
            if let Err(e) = replica.warm_up().await {
                warn!(error = %e, "Replica warm-up failed, continuing with lazy connects");
            }
        }
        info!(replicas = store.replica.is_some(), "Data store ready");
        Ok(store)
    }

    /// Run a read, optionally on a replica
    ///
    /// With no replica configured the master serves the read.
    pub async fn query(
        &self,
        sql: &str,
        params: &[DbValue],
        prefer_replica: bool,
    ) -> DbResult<Vec<DbRow>> {
        let pool = self.route(prefer_replica);
        match self.run(pool, Statement::Query, sql, params).await? {
            Outcome::Rows(rows) => Ok(rows),
            Outcome::Affected(_) => Err(DatabaseError::row_mapping("query returned no row set")),
        }
    }

    /// Run a write on the master and return the affected row count
    pub async fn update(&self, sql: &str, params: &[DbValue]) -> DbResult<u64> {
        match self.run(&self.master, Statement::Update, sql, params).await? {
            Outcome::Affected(n) => Ok(n),
            Outcome::Rows(rows) => Ok(rows.len() as u64),
        }
    }

    /// Round-trip to the master
    pub async fn ping(&self) -> DbResult<()> {
        let mut conn = self.master.acquire().await?;
        conn.conn()?.ping().await
    }

    pub fn stats(&self) -> StoreStatistics {
        StoreStatistics {
            master: self.master.stats(),
            replica: self.replica.as_ref().map(ConnectionPool::stats),
            statements: self.statements.load(Ordering::Relaxed),
            slow_statements: self.slow_statements.load(Ordering::Relaxed),
        }
    }

    fn route(&self, prefer_replica: bool) -> &ConnectionPool {
        match &self.replica {
            Some(replica) if prefer_replica && self.behavior.read_from_replicas => replica,
            _ => &self.master,
        }
    }

    async fn run(
        &self,
        pool: &ConnectionPool,
        kind: Statement,
        sql: &str,
        params: &[DbValue],
    ) -> DbResult<Outcome> {
        let started = Instant::now();
        let store = self;

        let first = retry_with_backoff(&self.retry, kind.name(), move || {
            store.attempt(pool, kind, sql, params)
        })
        .await;

        let result = match first {
            Err(e) if e.is_transient() => {
                warn!(
                    role = %pool.role(),
                    operation = kind.name(),
                    error = %e,
                    "Retries exhausted, reconnecting pool"
                );
                match pool.reconnect().await {
                    Ok(()) => {
                        retry_with_backoff(&self.retry, kind.name(), move || {
                            store.attempt(pool, kind, sql, params)
                        })
                        .await
                    }
                    Err(reconnect_err) => {
                        error!(role = %pool.role(), error = %reconnect_err, "Reconnect failed");
                        Err(e)
                    }
                }
            }
            other => other,
        };

        self.observe(pool.role(), kind, sql, started.elapsed());
        result
    }

    async fn attempt(
        &self,
        pool: &ConnectionPool,
        kind: Statement,
        sql: &str,
        params: &[DbValue],
    ) -> DbResult<Outcome> {
        let mut guard = pool.acquire().await?;
        let conn = guard.conn()?;
        let result = match kind {
            Statement::Query => conn.query(sql, params).await.map(Outcome::Rows),
            Statement::Update => conn.execute(sql, params).await.map(Outcome::Affected),
        };
        if matches!(&result, Err(e) if e.is_transient()) {
            guard.mark_broken();
        }
        result
    }

    fn observe(&self, role: PoolRole, kind: Statement, sql: &str, elapsed: Duration) {
        self.statements.fetch_add(1, Ordering::Relaxed);
        let elapsed_ms = elapsed.as_millis() as u64;

        if elapsed_ms >= self.behavior.slow_sql_ms {
            self.slow_statements.fetch_add(1, Ordering::Relaxed);
            warn!(
                role = %role,
                operation = kind.name(),
                elapsed_ms = elapsed_ms,
                threshold_ms = self.behavior.slow_sql_ms,
                sql = sql,
                "Slow SQL"
            );
        } else {
            debug!(role = %role, operation = kind.name(), elapsed_ms = elapsed_ms, "SQL completed");
        }
    }
}
