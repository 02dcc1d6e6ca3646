//! [`Backend`] implementation over a lazily-connecting [`sqlx::AnyPool`].

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use sqlx::AnyConnection;
use sqlx::any::{AnyArguments, AnyConnectOptions, AnyPoolOptions, AnyRow};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Any, AnyPool, ConnectOptions, Connection, Executor};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Backend, PoolStats, PreparedStatement, QueryResult, Transaction, TxOptions};
use crate::config::PoolSettings;
use crate::driver::{Driver, dsn_scheme, redact_dsn};

/// Connection limit used when the open-connection limit is 0 (unlimited)
const UNBOUNDED_MAX_CONNECTIONS: u32 = 1 << 24;

/// Idle timeout used when no idle connections should be retained
const IDLE_REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// A physical database pool driven by sqlx.
///
/// sqlx fixes a pool's idle and lifetime options when it is built, so [`Backend::configure`] builds
/// a fresh lazy pool when those change and swaps it in. The retired pool is closed in the
/// background: connections it still has checked out keep working and are closed once returned.
///
/// The open-connection limit is not left to sqlx. Every checkout, on any pool generation, first
/// takes a permit from one backend-wide semaphore, so the limit holds across swaps and can be
/// raised or lowered in place.
pub struct SqlxBackend {
    driver: Driver,
    dsn: String,
    connect_options: AnyConnectOptions,
    pools: Arc<PoolSet>,
}

struct PoolState {
    settings: PoolSettings,
    closed: bool,
}

/// The pool generations of one database and the limiter they share.
pub(crate) struct PoolSet {
    current: ArcSwap<AnyPool>,
    /// Swapped-out pools that may still have connections checked out
    retired: Mutex<Vec<AnyPool>>,
    limiter: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

/// A checked-out connection together with its slot under the open-connection limit.
pub(crate) struct Lease {
    // Declared first so the connection goes back to its pool before the slot is freed
    conn: PoolConnection<Any>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    /// Take the connection out of the pool for good, so it is closed instead of reused
    pub(crate) fn detach(self) -> AnyConnection {
        self.conn.detach()
    }
}

impl Deref for Lease {
    type Target = AnyConnection;

    fn deref(&self) -> &AnyConnection {
        &self.conn
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut AnyConnection {
        &mut self.conn
    }
}

fn connection_limit(max_open_connections: u32) -> usize {
    match max_open_connections {
        0 => UNBOUNDED_MAX_CONNECTIONS as usize,
        n => n as usize,
    }
}

impl PoolSet {
    fn new(pool: AnyPool, settings: PoolSettings) -> Self {
        Self {
            current: ArcSwap::from_pointee(pool),
            retired: Mutex::new(Vec::new()),
            limiter: Arc::new(Semaphore::new(connection_limit(settings.max_open_connections))),
            state: Mutex::new(PoolState { settings, closed: false }),
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Check out a connection from the current pool, waiting at most the acquire timeout for a
    /// free slot under the open-connection limit.
    pub(crate) async fn acquire(&self) -> Result<Lease, sqlx::Error> {
        let acquire_timeout = self.state.lock().settings.acquire_timeout;
        let permit = match tokio::time::timeout(acquire_timeout, Arc::clone(&self.limiter).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(sqlx::Error::PoolClosed),
            Err(_) => return Err(sqlx::Error::PoolTimedOut),
        };

        loop {
            let pool = self.current.load_full();
            match pool.acquire().await {
                // Lost a race with a swap; the retired pool is already closing
                Err(sqlx::Error::PoolClosed) if !self.is_closed() && !Arc::ptr_eq(&pool, &self.current.load()) => continue,
                result => return result.map(|conn| Lease { conn, _permit: permit }),
            }
        }
    }

    /// Move the open-connection limit from `from` to `to`.
    ///
    /// Lowering below the number of connections in use takes effect as they are returned.
    fn resize_limit(&self, from: u32, to: u32) {
        let (from, to) = (connection_limit(from), connection_limit(to));
        if to > from {
            self.limiter.add_permits(to - from);
        } else if from > to {
            let owed = (from - to) - self.limiter.forget_permits(from - to);
            if owed > 0 {
                let limiter = Arc::clone(&self.limiter);
                tokio::spawn(async move {
                    if let Ok(permits) = limiter.acquire_many_owned(owed as u32).await {
                        permits.forget();
                    }
                });
            }
        }
    }

    /// Swap in `pool` and close the one it replaces once its connections come back.
    fn replace(&self, pool: AnyPool) {
        let old = AnyPool::clone(&self.current.swap(Arc::new(pool)));

        let mut retired = self.retired.lock();
        retired.retain(|pool| !(pool.is_closed() && pool.size() == 0));
        retired.push(old.clone());
        tokio::spawn(async move { old.close().await });
    }

    /// Connections open and idle across every live generation
    fn counts(&self) -> (u32, usize) {
        let current = self.current.load();
        let retired = self.retired.lock();
        retired
            .iter()
            .chain(std::iter::once(&**current))
            .fold((0, 0), |(size, idle), pool| (size + pool.size(), idle + pool.num_idle()))
    }
}

impl SqlxBackend {
    /// The driver this pool speaks
    pub fn driver(&self) -> Driver {
        self.driver
    }

    /// The pool currently in use.
    ///
    /// Use sparingly - queries issued here bypass the router's routing policy and the
    /// open-connection limit.
    pub fn pool(&self) -> AnyPool {
        AnyPool::clone(&self.pools.current.load())
    }
}

impl fmt::Debug for SqlxBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.pools.state.lock();
        f.debug_struct("SqlxBackend")
            .field("driver", &self.driver)
            .field("dsn", &redact_dsn(&self.dsn))
            .field("settings", &state.settings)
            .field("closed", &state.closed)
            .finish()
    }
}

/// Translate pool settings into sqlx pool options.
///
/// The open-connection limit is enforced by [`PoolSet`], so the pool itself is unbounded. sqlx has
/// no idle-count cap either: only whether idle connections are retained at all is carried over.
fn pool_options(settings: &PoolSettings) -> AnyPoolOptions {
    // "retain none" becomes a short idle timeout
    let idle_timeout = if settings.max_idle_connections == 0 {
        Some(IDLE_REAP_TIMEOUT)
    } else if settings.idle_timeout.is_zero() {
        None
    } else {
        Some(settings.idle_timeout)
    };

    let max_lifetime = if settings.max_lifetime.is_zero() {
        None
    } else {
        Some(settings.max_lifetime)
    };

    AnyPoolOptions::new()
        .max_connections(UNBOUNDED_MAX_CONNECTIONS)
        .min_connections(0)
        .idle_timeout(idle_timeout)
        .max_lifetime(max_lifetime)
        .acquire_timeout(settings.acquire_timeout)
}

/// Whether moving from `old` to `new` changes anything [`pool_options`] reads
fn needs_new_pool(old: &PoolSettings, new: &PoolSettings) -> bool {
    (old.max_idle_connections == 0) != (new.max_idle_connections == 0)
        || old.idle_timeout != new.idle_timeout
        || old.max_lifetime != new.max_lifetime
        || old.acquire_timeout != new.acquire_timeout
}

fn build_pool(connect_options: &AnyConnectOptions, settings: &PoolSettings) -> AnyPool {
    pool_options(settings).connect_lazy_with(connect_options.clone())
}

/// Bind a JSON value to a query as the matching SQL type.
///
/// JSON null is bound as a text-typed NULL. SQLite and MySQL accept it for any column; Postgres
/// rejects it where a non-text type is inferred, so cast the placeholder there (`$1::int`).
pub(crate) fn bind_value<'q>(query: Query<'q, Any, AnyArguments<'q>>, value: JsonValue) -> Query<'q, Any, AnyArguments<'q>> {
    match value {
        JsonValue::Null => query.bind(None::<String>),
        JsonValue::Bool(b) => query.bind(b),
        JsonValue::Number(number) => {
            // Preserve integer precision by binding as i64 when possible
            if let Some(int_val) = number.as_i64() {
                query.bind(int_val)
            } else {
                // Not an integer, or too large for i64 - bind as f64 (may lose precision)
                query.bind(number.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(s) => query.bind(s),
        other => query.bind(other.to_string()),
    }
}

pub(crate) fn bind_values<'q>(mut query: Query<'q, Any, AnyArguments<'q>>, values: Vec<JsonValue>) -> Query<'q, Any, AnyArguments<'q>> {
    for value in values {
        query = bind_value(query, value);
    }
    query
}

impl Backend for SqlxBackend {
    type Row = AnyRow;
    type Statement = PreparedStatement;
    type Transaction = Transaction;

    async fn open(driver: Driver, dsn: &str, settings: &PoolSettings) -> Result<Self, sqlx::Error> {
        sqlx::any::install_default_drivers();

        let scheme = dsn_scheme(dsn)
            .ok_or_else(|| sqlx::Error::Configuration(format!("{driver} DSN must be a URL such as {driver}://host/database").into()))?;
        if !driver.accepts_scheme(&scheme) {
            return Err(sqlx::Error::Configuration(
                format!("the {driver} driver cannot open a {scheme}:// DSN").into(),
            ));
        }

        let connect_options = AnyConnectOptions::from_str(dsn)?.log_slow_statements(log::LevelFilter::Warn, settings.slow_statement_threshold);
        let settings = settings.clone().normalized();
        let pool = build_pool(&connect_options, &settings);

        debug!(%driver, dsn = %redact_dsn(dsn), ?settings, "Opened lazy pool");

        Ok(Self {
            driver,
            dsn: dsn.to_string(),
            connect_options,
            pools: Arc::new(PoolSet::new(pool, settings)),
        })
    }

    async fn close(&self) -> Result<(), sqlx::Error> {
        let pool = {
            let mut state = self.pools.state.lock();
            state.closed = true;
            self.pools.limiter.close();
            self.pools.current.load_full()
        };
        pool.close().await;
        debug!(driver = %self.driver, dsn = %redact_dsn(&self.dsn), "Closed pool");
        Ok(())
    }

    async fn ping(&self) -> Result<(), sqlx::Error> {
        let mut lease = self.pools.acquire().await?;
        lease.ping().await
    }

    async fn fetch_all(&self, query: &str, args: Vec<JsonValue>) -> Result<Vec<AnyRow>, sqlx::Error> {
        let mut lease = self.pools.acquire().await?;
        bind_values(sqlx::query(query), args).fetch_all(&mut *lease).await
    }

    async fn fetch_optional(&self, query: &str, args: Vec<JsonValue>) -> Result<Option<AnyRow>, sqlx::Error> {
        let mut lease = self.pools.acquire().await?;
        bind_values(sqlx::query(query), args).fetch_optional(&mut *lease).await
    }

    async fn execute(&self, query: &str, args: Vec<JsonValue>) -> Result<QueryResult, sqlx::Error> {
        let mut lease = self.pools.acquire().await?;
        let result = bind_values(sqlx::query(query), args).execute(&mut *lease).await?;
        Ok(result.into())
    }

    async fn prepare(&self, query: &str) -> Result<PreparedStatement, sqlx::Error> {
        let mut lease = self.pools.acquire().await?;
        let statement = (&mut *lease).prepare(query).await?;
        Ok(PreparedStatement::new(
            Arc::clone(&self.pools),
            sqlx::Statement::to_owned(&statement),
        ))
    }

    async fn begin(&self, options: TxOptions, cancel: CancellationToken) -> Result<Transaction, sqlx::Error> {
        let statements = self.driver.begin_statements(&options)?;

        let mut lease = self.pools.acquire().await?;
        for statement in &statements {
            if let Err(e) = (&mut *lease).execute(statement.as_str()).await {
                // The session may carry a half-applied SET TRANSACTION; don't hand it back to the pool
                drop(lease.detach());
                return Err(e);
            }
        }

        debug!(driver = %self.driver, ?options, "Transaction started");
        Ok(Transaction::new(lease, cancel))
    }

    fn configure(&self, settings: PoolSettings) {
        let settings = settings.normalized();
        let mut state = self.pools.state.lock();
        if state.settings == settings {
            return;
        }

        if !state.closed {
            self.pools
                .resize_limit(state.settings.max_open_connections, settings.max_open_connections);
            if needs_new_pool(&state.settings, &settings) {
                self.pools.replace(build_pool(&self.connect_options, &settings));
                debug!(driver = %self.driver, dsn = %redact_dsn(&self.dsn), ?settings, "Swapped in pool with new settings");
            }
        }
        state.settings = settings;
    }

    fn settings(&self) -> PoolSettings {
        self.pools.state.lock().settings.clone()
    }

    fn stats(&self) -> PoolStats {
        let (size, idle) = self.pools.counts();
        PoolStats {
            size,
            idle,
            max_open_connections: self.pools.state.lock().settings.max_open_connections,
        }
    }
}
