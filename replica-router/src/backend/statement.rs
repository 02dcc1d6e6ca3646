use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use sqlx::Statement;
use sqlx::any::{AnyRow, AnyStatement};

use super::QueryResult;
use super::sqlx_pool::{PoolSet, bind_values};
use crate::errors::{Error, Result};

/// A statement prepared on the primary database.
///
/// The statement runs on whatever pool the primary is currently using, so it keeps working after
/// the pool settings change. Each execution checks out a connection under the primary's
/// open-connection limit, and is re-prepared transparently on connections that haven't seen it yet.
pub struct PreparedStatement {
    pools: Arc<PoolSet>,
    statement: AnyStatement<'static>,
}

impl PreparedStatement {
    pub(crate) fn new(pools: Arc<PoolSet>, statement: AnyStatement<'static>) -> Self {
        Self { pools, statement }
    }

    /// The SQL text of this statement
    pub fn sql(&self) -> &str {
        self.statement.sql()
    }

    /// Number of bind parameters, for drivers that report it
    pub fn parameter_count(&self) -> Option<usize> {
        self.statement
            .parameters()
            .map(|params| params.either(|types| types.len(), |count| count))
    }

    pub async fn fetch_all(&self, args: Vec<JsonValue>) -> Result<Vec<AnyRow>> {
        let mut lease = self.pools.acquire().await.map_err(Error::primary)?;
        bind_values(self.statement.query(), args)
            .fetch_all(&mut *lease)
            .await
            .map_err(Error::primary)
    }

    pub async fn fetch_optional(&self, args: Vec<JsonValue>) -> Result<Option<AnyRow>> {
        let mut lease = self.pools.acquire().await.map_err(Error::primary)?;
        bind_values(self.statement.query(), args)
            .fetch_optional(&mut *lease)
            .await
            .map_err(Error::primary)
    }

    pub async fn execute(&self, args: Vec<JsonValue>) -> Result<QueryResult> {
        let mut lease = self.pools.acquire().await.map_err(Error::primary)?;
        let result = bind_values(self.statement.query(), args)
            .execute(&mut *lease)
            .await
            .map_err(Error::primary)?;
        Ok(result.into())
    }
}

impl fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedStatement").field("sql", &self.sql()).finish()
    }
}
