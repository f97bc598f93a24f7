//! Relational persistence
//!
//! Pooled connections per role, retry with backoff, replica routing and the
//! repositories the self-check flow writes through.

pub mod client;
pub mod connector;
pub mod error;
pub mod models;
pub mod pool;
pub mod repositories;
pub mod retry;
pub mod value;

pub use client::{BehaviorConfig, DataStore, DatabaseConfig, StoreStatistics};
pub use connector::{Connector, Endpoint, SqlConnection, SqlxConnector};
pub use error::{DatabaseError, DbResult};
pub use pool::{ConnectionPool, PoolConfig, PoolRole, PoolStatistics, PooledConnection};
pub use retry::{retry_with_backoff, Classify, ErrorClass, RetryConfig};
pub use value::{DbRow, DbValue};
