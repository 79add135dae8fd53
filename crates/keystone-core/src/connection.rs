//! Database connection traits.
//!
//! This module defines the SQL-execution collaborator the session drives:
//!
//! - [`Connection`] - Executes statements and classifies backend failures
//! - [`IsolationLevel`] - SQL transaction isolation levels
//! - [`Dialect`] - Placeholder and identifier quoting rules
//! - [`ErrorClass`] - Coarse classification used for reconnection decisions
//!
//! All operations integrate with asupersync's structured concurrency via `Cx` context
//! for proper cancellation and timeout handling.

use crate::error::{ConnectionErrorKind, Error, QueryErrorKind};
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum IsolationLevel {
    /// Read uncommitted: transactions can see uncommitted changes from others.
    ReadUncommitted,

    /// Read committed: only committed changes from others are visible.
    #[default]
    ReadCommitted,

    /// Repeatable read: a consistent snapshot for the whole transaction.
    RepeatableRead,

    /// Serializable: transactions appear to execute sequentially.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// Whether `self` gives stronger guarantees than `other`.
    pub fn is_stricter_than(self, other: IsolationLevel) -> bool {
        self > other
    }
}

/// SQL dialect for placeholder generation and identifier quoting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect, doubling embedded quote characters.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }

    /// Row-lock suffix for `SELECT ... FOR UPDATE`.
    pub const fn for_update(self, nowait: bool) -> &'static str {
        if nowait {
            " FOR UPDATE NOWAIT"
        } else {
            " FOR UPDATE"
        }
    }
}

/// Classification of an execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The connection was severed; the statement's effect is unknown.
    ConnectionLost,
    /// The backend rejected the statement on a constraint.
    Constraint,
    /// Anything else.
    Other,
}

/// A database connection capable of executing statements.
///
/// All operations are async and take a `Cx` context for cancellation/timeout support.
/// Implementations must be `Send + Sync` for use across async boundaries.
///
/// Transactions are driven by the session with plain `BEGIN` / `COMMIT` /
/// `ROLLBACK` statements sent through [`execute`](Connection::execute).
pub trait Connection: Send + Sync {
    /// The SQL dialect this connection speaks.
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    /// Execute a query and return all rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Execute a statement (UPDATE, DELETE, transaction control) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Execute an INSERT and return the generated key, if the backend produced one.
    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send;

    /// Check if the connection is still valid by sending a ping.
    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Check if the connection is still valid (alias for ping that returns bool).
    fn is_valid(&self, cx: &Cx) -> impl Future<Output = bool> + Send {
        async {
            match self.ping(cx).await {
                Outcome::Ok(()) => true,
                Outcome::Err(_) | Outcome::Cancelled(_) | Outcome::Panicked(_) => false,
            }
        }
    }

    /// Classify a failure returned by this connection.
    ///
    /// Drivers with richer diagnostics (SQLSTATE classes, socket errors) should
    /// override this.
    fn classify_error(&self, error: &Error) -> ErrorClass {
        classify_error(error)
    }
}

/// Default failure classification shared by drivers.
pub fn classify_error(error: &Error) -> ErrorClass {
    match error {
        Error::Connection(c) if c.kind == ConnectionErrorKind::Disconnected => {
            ErrorClass::ConnectionLost
        }
        Error::ConnectionLost(_) => ErrorClass::ConnectionLost,
        Error::Query(q) if q.kind == QueryErrorKind::Constraint => ErrorClass::Constraint,
        Error::Query(q) if q.sqlstate.as_deref().is_some_and(|s| s.starts_with("08")) => {
            ErrorClass::ConnectionLost
        }
        Error::Query(q) if q.sqlstate.as_deref().is_some_and(|s| s.starts_with("23")) => {
            ErrorClass::Constraint
        }
        _ => ErrorClass::Other,
    }
}
