//! The driver layer behind the router.
//!
//! A [`Backend`] is one physical connection pool. The router owns two of them and never talks to a
//! database any other way, so everything it knows about connections, pooling and wire protocols
//! goes through this trait. [`SqlxBackend`] is the production implementation.

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::config::PoolSettings;
use crate::driver::Driver;

mod sqlx_pool;
mod statement;
mod transaction;

pub use sqlx_pool::SqlxBackend;
pub use statement::PreparedStatement;
pub use transaction::Transaction;

/// One physical connection pool.
///
/// Implementations must be safe to share between tasks: the router hands out `&self` to
/// concurrent callers and adds no synchronization of its own.
pub trait Backend: Send + Sync + Sized + 'static {
    /// A row returned by a query
    type Row: Send;
    /// A statement prepared on this pool
    type Statement: Send;
    /// An open transaction on one of this pool's connections
    type Transaction: Send;

    /// Open a pool for `dsn` using `driver`.
    ///
    /// Opening is lazy: it validates the configuration and allocates the pool but doesn't
    /// establish a connection until one is needed.
    fn open(driver: Driver, dsn: &str, settings: &PoolSettings) -> impl Future<Output = Result<Self, sqlx::Error>> + Send;

    /// Close the pool, releasing its connections.
    fn close(&self) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// Verify that a connection can be established and is alive.
    fn ping(&self) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// Run a query and return all rows.
    fn fetch_all(&self, query: &str, args: Vec<JsonValue>) -> impl Future<Output = Result<Vec<Self::Row>, sqlx::Error>> + Send;

    /// Run a query and return its first row, if any.
    fn fetch_optional(&self, query: &str, args: Vec<JsonValue>) -> impl Future<Output = Result<Option<Self::Row>, sqlx::Error>> + Send;

    /// Run a statement that returns no rows.
    fn execute(&self, query: &str, args: Vec<JsonValue>) -> impl Future<Output = Result<QueryResult, sqlx::Error>> + Send;

    /// Prepare a statement for later execution.
    fn prepare(&self, query: &str) -> impl Future<Output = Result<Self::Statement, sqlx::Error>> + Send;

    /// Begin a transaction. It's rolled back if `cancel` fires before commit.
    fn begin(&self, options: TxOptions, cancel: CancellationToken) -> impl Future<Output = Result<Self::Transaction, sqlx::Error>> + Send;

    /// Apply new pool settings. Connections acquired afterwards observe them.
    fn configure(&self, settings: PoolSettings);

    /// The settings currently in effect
    fn settings(&self) -> PoolSettings;

    /// Point-in-time pool statistics
    fn stats(&self) -> PoolStats;
}

/// Result returned from write operations (e.g. INSERT, UPDATE, DELETE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    /// The number of rows affected by the write operation.
    pub rows_affected: u64,
    /// The last inserted row ID, for drivers that report one.
    pub last_insert_id: Option<i64>,
}

impl From<sqlx::any::AnyQueryResult> for QueryResult {
    fn from(result: sqlx::any::AnyQueryResult) -> Self {
        Self {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_id(),
        }
    }
}

/// Transaction isolation level. `Default` leaves the choice to the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub(crate) fn as_sql(&self) -> Option<&'static str> {
        match self {
            IsolationLevel::Default => None,
            IsolationLevel::ReadUncommitted => Some("READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => Some("READ COMMITTED"),
            IsolationLevel::RepeatableRead => Some("REPEATABLE READ"),
            IsolationLevel::Serializable => Some("SERIALIZABLE"),
        }
    }
}

/// Options for [`Backend::begin`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

/// Point-in-time statistics for one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStats {
    /// Connections currently open, idle or in use
    pub size: u32,
    /// Idle connections available for reuse
    pub idle: usize,
    /// Configured open-connection limit, 0 when unlimited
    pub max_open_connections: u32,
}

impl PoolStats {
    pub fn in_use(&self) -> usize {
        (self.size as usize).saturating_sub(self.idle)
    }
}
