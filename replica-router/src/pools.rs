//! Database handle routing reads to a replica and everything else to the primary.
//!
//! # Architecture
//!
//! ```text
//!      ┌──────────┐
//!      │  Router  │
//!      └────┬─────┘
//!           │
//!      ┌────┴─────┐
//!      ↓          ↓
//! ┌─────────┐ ┌─────────┐
//! │ Primary │ │ Replica │ (possibly a load balancer over many nodes)
//! └─────────┘ └─────────┘
//! ```
//!
//! # Routing
//!
//! - `.read()` / `.read_one()` run on the replica (eventually consistent)
//! - `.read_from_primary()` / `.read_one_from_primary()` for reads that must see your own writes
//! - `.write()`, `.prepare()` and `.begin*()` always run on the primary
//! - `.close()`, `.ping()` and the pool setters act on both
//!
//! # Example
//!
//! ```ignore
//! let router = Router::open("mysql", "mysql://app@db-main/app", "mysql://app@db-replica/app").await?;
//!
//! router.write("INSERT INTO users (name) VALUES (?)", vec![json!("alice")]).await?;
//! let name: String = router.read_one("SELECT name FROM users WHERE id = ?", vec![json!(1)]).await.get(0)?;
//! ```

pub mod metrics;

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Backend, PoolStats, QueryResult, SqlxBackend, TxOptions};
use crate::config::{Config, PoolSettings};
use crate::driver::{Driver, redact_dsn};
use crate::errors::{Error, Result, Target};
use crate::row::Row;

pub use metrics::run_pool_metrics_sampler;

/// A single logical database backed by a primary and a read replica.
///
/// Both backends are owned for the router's whole lifetime; there is no half-open state. The
/// router adds no locking around queries, so it can be shared freely (e.g. in an `Arc`).
pub struct Router<B: Backend = SqlxBackend> {
    primary: B,
    replica: B,
    // Serializes read-modify-write of the pool settings across concurrent setter calls
    settings_lock: Mutex<()>,
}

/// Statistics for both pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub primary: PoolStats,
    pub replica: PoolStats,
}

/// Pool settings in effect on both pools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterSettings {
    pub primary: PoolSettings,
    pub replica: PoolSettings,
}

impl Router<SqlxBackend> {
    /// Open a router for `driver` over the given primary and replica DSNs with default pool settings.
    ///
    /// No connection is made yet, so an unreachable server is only noticed by [`ping`](Self::ping)
    /// or the first query.
    pub async fn open(driver: &str, primary_dsn: &str, replica_dsn: &str) -> Result<Self> {
        Self::open_with(driver.parse()?, primary_dsn, replica_dsn, &PoolSettings::default()).await
    }

    /// Open a router with explicit pool settings.
    pub async fn open_with(driver: Driver, primary_dsn: &str, replica_dsn: &str, settings: &PoolSettings) -> Result<Self> {
        Self::open_backends(driver, primary_dsn, replica_dsn, settings).await
    }

    /// Open a router from loaded configuration.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let driver = config.driver()?;
        Self::open_with(
            driver,
            config.primary_url.as_deref().unwrap_or_default(),
            config.replica_url.as_deref().unwrap_or_default(),
            &config.pool,
        )
        .await
    }
}

impl<B: Backend> Router<B> {
    /// Open both backends, primary first.
    ///
    /// If the primary fails the replica is never touched. If the replica fails the primary is
    /// closed again before the replica's error is returned.
    pub async fn open_backends(driver: Driver, primary_dsn: &str, replica_dsn: &str, settings: &PoolSettings) -> Result<Self> {
        let primary = B::open(driver, primary_dsn, settings).await.map_err(Error::primary)?;

        let replica = match B::open(driver, replica_dsn, settings).await {
            Ok(replica) => replica,
            Err(e) => {
                warn!(error = %e, "Failed to open replica, closing primary");
                if let Err(close_err) = primary.close().await {
                    warn!(error = %close_err, "Failed to close primary after replica open failure");
                }
                return Err(Error::replica(e));
            }
        };

        info!(
            %driver,
            primary = %redact_dsn(primary_dsn),
            replica = %redact_dsn(replica_dsn),
            "Opened database router"
        );

        Ok(Self::from_backends(primary, replica))
    }

    /// Build a router from two already-open backends.
    pub fn from_backends(primary: B, replica: B) -> Self {
        Self {
            primary,
            replica,
            settings_lock: Mutex::new(()),
        }
    }

    /// Close both databases.
    ///
    /// The primary is closed first, then the replica. Both are always attempted; each failure is
    /// reported tagged with its target.
    pub async fn close(&self) -> Result<()> {
        let primary = self.primary.close().await;
        let replica = self.replica.close().await;
        let result = Error::combine(primary, replica);
        info!(ok = result.is_ok(), "Closed database router");
        result
    }

    /// Verify both databases are reachable.
    pub async fn ping(&self) -> Result<()> {
        let (primary, replica) = tokio::join!(self.primary.ping(), self.replica.ping());
        Error::combine(primary, replica)
    }

    /// Run a read-only query on the replica.
    ///
    /// Arguments bind by JSON type. `null` binds as a text-typed NULL, which Postgres rejects where
    /// it infers another type for the placeholder; cast it there (`$1::int`).
    pub async fn read(&self, query: &str, args: Vec<JsonValue>) -> Result<Vec<B::Row>> {
        self.replica.fetch_all(query, args).await.map_err(Error::replica)
    }

    /// Run a single-row query on the replica.
    ///
    /// Never fails here: errors (including "no rows") are deferred to the returned [`Row`].
    pub async fn read_one(&self, query: &str, args: Vec<JsonValue>) -> Row<B::Row> {
        Row::new(Target::Replica, self.replica.fetch_optional(query, args).await)
    }

    /// Run a read-only query on the primary, for reads that must observe the caller's writes.
    pub async fn read_from_primary(&self, query: &str, args: Vec<JsonValue>) -> Result<Vec<B::Row>> {
        self.primary.fetch_all(query, args).await.map_err(Error::primary)
    }

    /// Single-row variant of [`read_from_primary`](Self::read_from_primary).
    pub async fn read_one_from_primary(&self, query: &str, args: Vec<JsonValue>) -> Row<B::Row> {
        Row::new(Target::Primary, self.primary.fetch_optional(query, args).await)
    }

    /// Run a statement that modifies data on the primary.
    ///
    /// Arguments bind as in [`read`](Self::read), including the text-typed NULL for `null`.
    pub async fn write(&self, query: &str, args: Vec<JsonValue>) -> Result<QueryResult> {
        self.primary.execute(query, args).await.map_err(Error::primary)
    }

    /// Prepare a statement on the primary.
    pub async fn prepare(&self, query: &str) -> Result<B::Statement> {
        self.primary.prepare(query).await.map_err(Error::primary)
    }

    /// Begin a transaction on the primary with default options.
    pub async fn begin(&self) -> Result<B::Transaction> {
        self.begin_with(TxOptions::default()).await
    }

    /// Begin a transaction on the primary.
    pub async fn begin_with(&self, options: TxOptions) -> Result<B::Transaction> {
        self.primary
            .begin(options, CancellationToken::new())
            .await
            .map_err(Error::primary)
    }

    /// Begin a transaction on the primary that is rolled back if `cancel` fires before commit.
    pub async fn begin_cancellable(&self, cancel: CancellationToken, options: TxOptions) -> Result<B::Transaction> {
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        self.primary.begin(options, cancel).await.map_err(Error::primary)
    }

    /// Set the maximum lifetime of a connection on both pools. Zero means reuse forever.
    ///
    /// # Panics
    ///
    /// With [`SqlxBackend`] this swaps in freshly built pools, which spawns tasks, so it panics when
    /// called outside a Tokio runtime.
    pub fn set_max_connection_lifetime(&self, lifetime: Duration) {
        debug!(?lifetime, "Setting max connection lifetime");
        self.update_settings(|settings| settings.set_max_lifetime(lifetime));
    }

    /// Set the maximum number of idle connections on both pools.
    ///
    /// [`SqlxBackend`] pools cannot cap their idle count. Only 0 versus non-zero changes their
    /// behavior: 0 closes connections about a second after they go idle, and any positive limit
    /// keeps idle connections until the configured idle timeout. The value is still clamped and
    /// reported by [`settings`](Self::settings).
    ///
    /// # Panics
    ///
    /// Switching between 0 and a positive limit on [`SqlxBackend`] swaps in freshly built pools,
    /// which spawns tasks, so it panics when called outside a Tokio runtime.
    pub fn set_max_idle_connections(&self, n: u32) {
        debug!(n, "Setting max idle connections");
        self.update_settings(|settings| settings.set_max_idle_connections(n));
    }

    /// Set the maximum number of open connections on both pools. Zero means unlimited.
    ///
    /// The limit counts checked-out connections, including ones still held on pools replaced by
    /// earlier setting changes. Lowering it below the number in use takes effect as they return.
    ///
    /// # Panics
    ///
    /// Lowering the limit below the number of connections in use on [`SqlxBackend`] spawns a task,
    /// so it panics when called outside a Tokio runtime.
    pub fn set_max_open_connections(&self, n: u32) {
        debug!(n, "Setting max open connections");
        self.update_settings(|settings| settings.set_max_open_connections(n));
    }

    fn update_settings(&self, update: impl Fn(&mut PoolSettings)) {
        let _guard = self.settings_lock.lock();
        for backend in [&self.primary, &self.replica] {
            let mut settings = backend.settings();
            update(&mut settings);
            backend.configure(settings);
        }
    }

    /// Pool settings currently in effect on both pools
    pub fn settings(&self) -> RouterSettings {
        RouterSettings {
            primary: self.primary.settings(),
            replica: self.replica.settings(),
        }
    }

    /// Point-in-time statistics for both pools
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            primary: self.primary.stats(),
            replica: self.replica.stats(),
        }
    }

    /// Direct access to the primary backend.
    ///
    /// Use sparingly - prefer the routing methods for clarity.
    pub fn primary(&self) -> &B {
        &self.primary
    }

    /// Direct access to the replica backend.
    pub fn replica(&self) -> &B {
        &self.replica
    }
}

impl<B: Backend + std::fmt::Debug> std::fmt::Debug for Router<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("primary", &self.primary)
            .field("replica", &self.replica)
            .finish()
    }
}
