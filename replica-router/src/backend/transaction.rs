use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use sqlx::Executor;
use sqlx::any::AnyRow;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::QueryResult;
use super::sqlx_pool::{Lease, bind_values};
use crate::errors::{Error, Result};

/// A transaction on one primary connection.
///
/// The connection stays checked out until [`commit`](Self::commit) or
/// [`rollback`](Self::rollback). A background task watches the cancellation token: once it fires
/// the transaction is rolled back right away, releasing its locks even if nothing else touches the
/// transaction, and every further call returns [`Error::Canceled`]. Dropping an unfinished
/// transaction discards its connection instead of returning it to the pool, which makes the server
/// roll back.
pub struct Transaction {
    lease: Arc<Mutex<Option<Lease>>>,
    cancel: CancellationToken,
    /// Stops the cancellation watcher
    finished: CancellationToken,
}

impl Transaction {
    pub(crate) fn new(lease: Lease, cancel: CancellationToken) -> Self {
        let lease = Arc::new(Mutex::new(Some(lease)));
        let finished = CancellationToken::new();
        tokio::spawn(roll_back_on_cancel(Arc::clone(&lease), cancel.clone(), finished.clone()));
        Self { lease, cancel, finished }
    }

    /// Whether the transaction's cancellation token has fired
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn execute(&mut self, query: &str, args: Vec<JsonValue>) -> Result<QueryResult> {
        let mut guard = self.lease.lock().await;
        let lease = guard.as_mut().ok_or(Error::Canceled)?;
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = bind_values(sqlx::query(query), args).execute(&mut **lease) => Some(result),
        };
        match outcome {
            Some(result) => result.map(QueryResult::from).map_err(Error::primary),
            None => Err(abort(guard.take()).await),
        }
    }

    pub async fn fetch_all(&mut self, query: &str, args: Vec<JsonValue>) -> Result<Vec<AnyRow>> {
        let mut guard = self.lease.lock().await;
        let lease = guard.as_mut().ok_or(Error::Canceled)?;
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = bind_values(sqlx::query(query), args).fetch_all(&mut **lease) => Some(result),
        };
        match outcome {
            Some(result) => result.map_err(Error::primary),
            None => Err(abort(guard.take()).await),
        }
    }

    pub async fn fetch_optional(&mut self, query: &str, args: Vec<JsonValue>) -> Result<Option<AnyRow>> {
        let mut guard = self.lease.lock().await;
        let lease = guard.as_mut().ok_or(Error::Canceled)?;
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = bind_values(sqlx::query(query), args).fetch_optional(&mut **lease) => Some(result),
        };
        match outcome {
            Some(result) => result.map_err(Error::primary),
            None => Err(abort(guard.take()).await),
        }
    }

    /// Commit the transaction and return its connection to the pool.
    ///
    /// If the token has already fired the transaction is rolled back instead and
    /// [`Error::Canceled`] is returned.
    pub async fn commit(self) -> Result<()> {
        let mut guard = self.lease.lock().await;
        let lease = guard.as_mut().ok_or(Error::Canceled)?;
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = (&mut **lease).execute("COMMIT") => Some(result),
        };
        match outcome {
            Some(Ok(_)) => {
                // Finished cleanly; dropping the lease returns the connection to the pool
                drop(guard.take());
                debug!("Transaction committed");
                Ok(())
            }
            // A failed COMMIT leaves the session state unknown; Drop discards the connection
            Some(Err(e)) => Err(Error::primary(e)),
            None => Err(abort(guard.take()).await),
        }
    }

    /// Roll the transaction back and return its connection to the pool.
    pub async fn rollback(self) -> Result<()> {
        let mut guard = self.lease.lock().await;
        let lease = guard.as_mut().ok_or(Error::Canceled)?;
        (&mut **lease).execute("ROLLBACK").await.map_err(Error::primary)?;
        drop(guard.take());
        debug!("Transaction rolled back");
        Ok(())
    }
}

/// Roll back as soon as `cancel` fires, unless the transaction finishes first.
async fn roll_back_on_cancel(lease: Arc<Mutex<Option<Lease>>>, cancel: CancellationToken, finished: CancellationToken) {
    tokio::select! {
        biased;
        _ = finished.cancelled() => {}
        _ = cancel.cancelled() => {
            let taken = lease.lock().await.take();
            if let Some(lease) = taken {
                roll_back(lease).await;
            }
        }
    }
}

/// Roll back after cancellation and report [`Error::Canceled`].
async fn abort(lease: Option<Lease>) -> Error {
    if let Some(lease) = lease {
        roll_back(lease).await;
    }
    Error::Canceled
}

/// Roll back a cancelled transaction, discarding the connection if that fails.
async fn roll_back(mut lease: Lease) {
    match (&mut *lease).execute("ROLLBACK").await {
        Ok(_) => debug!("Transaction rolled back after cancellation"),
        Err(e) => {
            warn!(error = %e, "Rollback after cancellation failed, discarding connection");
            drop(lease.detach());
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.finished.cancel();
        // The lock is only contended by the watcher, which then owns the lease
        if let Ok(mut guard) = self.lease.try_lock() {
            if let Some(lease) = guard.take() {
                debug!("Discarding connection of unfinished transaction");
                drop(lease.detach());
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = self.lease.try_lock().map_or(true, |lease| lease.is_some());
        f.debug_struct("Transaction")
            .field("open", &open)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
