use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which physical database an operation was delegated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Primary,
    Replica,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Primary => "primary",
            Target::Replica => "replica",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the router.
///
/// Driver errors are never translated: the original [`sqlx::Error`] is kept as the source and only
/// annotated with the target it came from.
#[derive(Error, Debug)]
pub enum Error {
    /// A delegated call failed on one of the two databases
    #[error("{target} database: {source}")]
    Database {
        target: Target,
        #[source]
        source: sqlx::Error,
    },

    /// Both databases failed during an operation that touches both (close, ping)
    #[error("primary database: {primary}; replica database: {replica}")]
    Both { primary: sqlx::Error, replica: sqlx::Error },

    /// The driver kind is not one the router knows how to open
    #[error("unsupported driver: {0}")]
    UnsupportedDriver(String),

    /// The cancellation token bound to a transaction fired before commit
    #[error("transaction canceled")]
    Canceled,
}

impl Error {
    pub(crate) fn primary(source: sqlx::Error) -> Self {
        Error::Database {
            target: Target::Primary,
            source,
        }
    }

    pub(crate) fn replica(source: sqlx::Error) -> Self {
        Error::Database {
            target: Target::Replica,
            source,
        }
    }

    /// Combine the outcomes of an operation run against both databases.
    pub(crate) fn combine(
        primary: std::result::Result<(), sqlx::Error>,
        replica: std::result::Result<(), sqlx::Error>,
    ) -> Result<()> {
        match (primary, replica) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(primary), Ok(())) => Err(Error::primary(primary)),
            (Ok(()), Err(replica)) => Err(Error::replica(replica)),
            (Err(primary), Err(replica)) => Err(Error::Both { primary, replica }),
        }
    }

    /// The database this error came from, if it came from exactly one.
    pub fn target(&self) -> Option<Target> {
        match self {
            Error::Database { target, .. } => Some(*target),
            Error::Canceled => Some(Target::Primary),
            Error::Both { .. } | Error::UnsupportedDriver(_) => None,
        }
    }

    /// Whether this is the "no rows" error surfaced by single-row reads.
    pub fn is_row_not_found(&self) -> bool {
        matches!(
            self,
            Error::Database {
                source: sqlx::Error::RowNotFound,
                ..
            }
        )
    }

    /// The underlying driver error for single-target failures.
    pub fn as_sqlx(&self) -> Option<&sqlx::Error> {
        match self {
            Error::Database { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Type alias for router operation results
pub type Result<T> = std::result::Result<T, Error>;
