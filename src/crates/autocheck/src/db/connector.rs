//! Physical connections
//!
//! [`Connector`] opens one connection to an [`Endpoint`]; the pool decides
//! when. [`SqlxConnector`] is the driver-backed implementation.

use super::error::{DatabaseError, DbResult};
use super::value::{DbRow, DbValue};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, Column, Connection, Row, ValueRef};
use tracing::debug;

/// Where one server lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    /// Full connection URL; overrides the individual fields when set
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            url: None,
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            database: "autocheck".to_string(),
        }
    }
}

impl Endpoint {
    /// Endpoint given by a full URL, e.g. `sqlite::memory:`
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn connection_url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "mysql://{}:{}@{}:{}/{}",
                self.user, self.password, self.host, self.port, self.database
            ),
        }
    }

    /// Address safe to log
    pub fn display_addr(&self) -> String {
        match &self.url {
            Some(url) => match url.rsplit_once('@') {
                Some((_, host)) => host.to_string(),
                None => url.clone(),
            },
            None => format!("{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

/// One open connection
#[async_trait]
pub trait SqlConnection: Send {
    /// Trivial round-trip used as a liveness probe
    async fn ping(&mut self) -> DbResult<()>;

    async fn query(&mut self, sql: &str, params: &[DbValue]) -> DbResult<Vec<DbRow>>;

    /// Run a statement and return the affected row count
    async fn execute(&mut self, sql: &str, params: &[DbValue]) -> DbResult<u64>;
}

/// Opens connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> DbResult<Box<dyn SqlConnection>>;
}

/// Connector over sqlx's runtime-selected driver
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlxConnector;

impl SqlxConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for SqlxConnector {
    async fn connect(&self, endpoint: &Endpoint) -> DbResult<Box<dyn SqlConnection>> {
        sqlx::any::install_default_drivers();
        let conn = AnyConnection::connect(&endpoint.connection_url()).await?;
        debug!(
            endpoint = %endpoint.display_addr(),
            backend = conn.backend_name(),
            "Connection opened"
        );
        Ok(Box::new(SqlxConnection { conn }))
    }
}

struct SqlxConnection {
    conn: AnyConnection,
}

fn bind_all<'q>(sql: &'q str, params: &[DbValue]) -> Query<'q, Any, AnyArguments<'q>> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| match param {
            DbValue::Null => query.bind(None::<String>),
            DbValue::Int(v) => query.bind(*v),
            DbValue::Float(v) => query.bind(*v),
            DbValue::Text(v) => query.bind(v.clone()),
        })
}

fn cell_text(row: &AnyRow, index: usize) -> DbResult<Option<String>> {
    if row.try_get_raw(index)?.is_null() {
        return Ok(None);
    }
    if let Ok(v) = row.try_get::<String, _>(index) {
        return Ok(Some(v));
    }
    if let Ok(v) = row.try_get::<i64, _>(index) {
        return Ok(Some(v.to_string()));
    }
    if let Ok(v) = row.try_get::<f64, _>(index) {
        return Ok(Some(v.to_string()));
    }
    if let Ok(v) = row.try_get::<bool, _>(index) {
        return Ok(Some(if v { "1" } else { "0" }.to_string()));
    }
    Err(DatabaseError::row_mapping(format!(
        "column {} has an unsupported type",
        index
    )))
}

fn to_row(row: &AnyRow) -> DbResult<DbRow> {
    let mut out = DbRow::new();
    for (index, column) in row.columns().iter().enumerate() {
        out.insert(column.name(), cell_text(row, index)?);
    }
    Ok(out)
}

#[async_trait]
impl SqlConnection for SqlxConnection {
    async fn ping(&mut self) -> DbResult<()> {
        self.conn.ping().await?;
        Ok(())
    }

    async fn query(&mut self, sql: &str, params: &[DbValue]) -> DbResult<Vec<DbRow>> {
        let rows = bind_all(sql, params).fetch_all(&mut self.conn).await?;
        rows.iter().map(to_row).collect()
    }

    async fn execute(&mut self, sql: &str, params: &[DbValue]) -> DbResult<u64> {
        let result = bind_all(sql, params).execute(&mut self.conn).await?;
        Ok(result.rows_affected())
    }
}
