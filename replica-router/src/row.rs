//! Single-row read results with deferred errors.

use std::fmt;

use sqlx::any::AnyRow;
use sqlx::{Any, ColumnIndex, Decode, FromRow, Type};

use crate::errors::{Error, Result, Target};

/// The outcome of a single-row read.
///
/// A `Row` always exists, even when the query failed or matched nothing; the error is held back
/// until the row is consumed. A query that matched no rows surfaces as [`sqlx::Error::RowNotFound`]
/// (see [`Error::is_row_not_found`]).
pub struct Row<R = AnyRow> {
    target: Target,
    inner: Result<R>,
}

impl<R> Row<R> {
    pub(crate) fn new(target: Target, result: std::result::Result<Option<R>, sqlx::Error>) -> Self {
        let inner = match result {
            Ok(Some(row)) => Ok(row),
            Ok(None) => Err(sqlx::Error::RowNotFound),
            Err(e) => Err(e),
        }
        .map_err(|source| Error::Database { target, source });

        Self { target, inner }
    }

    /// The database that served this read
    pub fn target(&self) -> Target {
        self.target
    }

    /// The deferred error, if the read failed or matched nothing
    pub fn err(&self) -> Option<&Error> {
        self.inner.as_ref().err()
    }

    /// The underlying row, or the deferred error
    pub fn into_inner(self) -> Result<R> {
        self.inner
    }
}

impl Row<AnyRow> {
    /// Decode one column, or return the deferred error.
    pub fn get<T, I>(self, index: I) -> Result<T>
    where
        I: ColumnIndex<AnyRow>,
        T: for<'r> Decode<'r, Any> + Type<Any>,
    {
        let target = self.target;
        let row = self.inner?;
        sqlx::Row::try_get(&row, index).map_err(|source| Error::Database { target, source })
    }

    /// Map the whole row into `T`, or return the deferred error.
    pub fn scan<T>(self) -> Result<T>
    where
        T: for<'r> FromRow<'r, AnyRow>,
    {
        let target = self.target;
        let row = self.inner?;
        T::from_row(&row).map_err(|source| Error::Database { target, source })
    }
}

impl<R> fmt::Debug for Row<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Row")
            .field("target", &self.target)
            .field("error", &self.err())
            .finish_non_exhaustive()
    }
}
