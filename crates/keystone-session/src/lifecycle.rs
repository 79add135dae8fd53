//! Connection lifecycle for one session.
//!
//! A connection is borrowed from the [`Pool`] lazily, on the first statement
//! of a transaction, and a `BEGIN` is sent right after. Commit and rollback end
//! the transaction; [`ConnectionLifecycle::release`] hands the connection back.
//!
//! # Severed connections
//!
//! When a statement fails and the connection classifies the failure as
//! [`ErrorClass::ConnectionLost`]:
//!
//! - if no write has completed and no row lock was granted in the current
//!   transaction, the connection is discarded, a new one is opened and the
//!   failed statement is sent once more
//! - otherwise the transaction outcome is unknown (or its locks are gone) and
//!   the statement fails with [`Error::ConnectionLost`]
//!
//! Dropping a lifecycle that still holds a connection discards it, which ends
//! any open transaction and frees the connection's slot in the pool.

use keystone_core::{
    Connection, ConnectionLostError, Cx, Dialect, Error, ErrorClass, IsolationLevel, Outcome,
    Row, Value,
};
use keystone_pool::{Connector, Pool, PooledConnection};
use std::sync::Arc;

/// Which `Connection` entry point a statement goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Statement {
    Query,
    /// `SELECT ... FOR UPDATE`
    LockingQuery,
    Execute,
    Insert,
}

enum Reply {
    Rows(Vec<Row>),
    Count(u64),
    Key(i64),
}

/// Owns the session's connection and the current transaction.
pub struct ConnectionLifecycle<K: Connector> {
    pool: Arc<Pool<K>>,
    conn: Option<PooledConnection<K::Conn>>,
    isolation: IsolationLevel,
    in_transaction: bool,
    /// Set once a write statement completed in the current transaction.
    writes_sent: bool,
    /// Set once a locking select completed in the current transaction.
    locks_held: bool,
    sql_debug: bool,
    reconnects: u64,
}

impl<K: Connector> std::fmt::Debug for ConnectionLifecycle<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLifecycle")
            .field("connected", &self.conn.is_some())
            .field("isolation", &self.isolation)
            .field("in_transaction", &self.in_transaction)
            .field("writes_sent", &self.writes_sent)
            .field("locks_held", &self.locks_held)
            .field("sql_debug", &self.sql_debug)
            .field("reconnects", &self.reconnects)
            .finish_non_exhaustive()
    }
}

impl<K: Connector> ConnectionLifecycle<K> {
    pub fn new(pool: Arc<Pool<K>>) -> Self {
        Self {
            pool,
            conn: None,
            isolation: IsolationLevel::default(),
            in_transaction: false,
            writes_sent: false,
            locks_held: false,
            sql_debug: false,
            reconnects: 0,
        }
    }

    /// Isolation level used by the next `BEGIN`.
    pub fn set_isolation(&mut self, isolation: IsolationLevel) {
        self.isolation = isolation;
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Swap statement logging level; returns the previous setting.
    pub fn set_sql_debug(&mut self, enabled: bool) -> bool {
        std::mem::replace(&mut self.sql_debug, enabled)
    }

    pub fn sql_debug(&self) -> bool {
        self.sql_debug
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn writes_sent(&self) -> bool {
        self.writes_sent
    }

    pub fn locks_held(&self) -> bool {
        self.locks_held
    }

    /// A reconnect would silently lose the transaction's writes or locks.
    fn pinned(&self) -> Option<&'static str> {
        if self.writes_sent {
            Some("writes were sent")
        } else if self.locks_held {
            Some("row locks were granted")
        } else {
            None
        }
    }

    /// Connections replaced after a severed link.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn pool(&self) -> &Arc<Pool<K>> {
        &self.pool
    }

    fn log_statement(&self, sql: &str, params: &[Value]) {
        if self.sql_debug {
            tracing::info!(sql, params = params.len(), "executing statement");
        } else {
            tracing::trace!(sql, params = params.len(), "executing statement");
        }
    }

    /// Make sure a connection is held and a transaction is open.
    ///
    /// Returns the connection's dialect.
    pub async fn acquire(&mut self, cx: &Cx) -> Outcome<Dialect, Error> {
        let mut retried = false;
        loop {
            if self.conn.is_none() {
                match self.pool.acquire(cx).await {
                    Outcome::Ok(conn) => self.conn = Some(conn),
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            let Some(conn) = self.conn.as_ref() else {
                continue;
            };
            let dialect = conn.dialect();
            if self.in_transaction {
                return Outcome::Ok(dialect);
            }

            let mut begin = vec![String::from("BEGIN")];
            if self.isolation != IsolationLevel::default() {
                begin.push(format!(
                    "SET TRANSACTION ISOLATION LEVEL {}",
                    self.isolation.as_sql()
                ));
            }
            let mut failure = None;
            for sql in &begin {
                self.log_statement(sql, &[]);
                match conn.execute(cx, sql, &[]).await {
                    Outcome::Ok(_) => {}
                    Outcome::Err(e) => {
                        failure = Some((conn.classify_error(&e), e));
                        break;
                    }
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            match failure {
                None => {
                    self.in_transaction = true;
                    tracing::debug!(isolation = self.isolation.as_sql(), "transaction started");
                    return Outcome::Ok(dialect);
                }
                Some((ErrorClass::ConnectionLost, e)) if !retried && self.pinned().is_none() => {
                    tracing::warn!(error = %e, "connection severed on BEGIN, reconnecting");
                    self.discard();
                    self.reconnects += 1;
                    retried = true;
                }
                Some((_, e)) => return Outcome::Err(e),
            }
        }
    }

    async fn send(
        &mut self,
        cx: &Cx,
        kind: Statement,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Reply, Error> {
        let write = matches!(kind, Statement::Execute | Statement::Insert);
        let mut retried = false;
        loop {
            match self.acquire(cx).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            let Some(conn) = self.conn.as_ref() else {
                continue;
            };
            self.log_statement(sql, params);
            let outcome = match kind {
                Statement::Query | Statement::LockingQuery => match conn.query(cx, sql, params).await {
                    Outcome::Ok(rows) => Outcome::Ok(Reply::Rows(rows)),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                },
                Statement::Execute => match conn.execute(cx, sql, params).await {
                    Outcome::Ok(n) => Outcome::Ok(Reply::Count(n)),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                },
                Statement::Insert => match conn.insert(cx, sql, params).await {
                    Outcome::Ok(k) => Outcome::Ok(Reply::Key(k)),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                },
            };

            match outcome {
                Outcome::Ok(reply) => {
                    if write {
                        self.writes_sent = true;
                    }
                    if kind == Statement::LockingQuery {
                        self.locks_held = true;
                    }
                    return Outcome::Ok(reply);
                }
                Outcome::Err(e) => {
                    if conn.classify_error(&e) != ErrorClass::ConnectionLost {
                        return Outcome::Err(e);
                    }
                    let pinned = self.pinned();
                    self.discard();
                    if pinned.is_some() || retried {
                        tracing::error!(sql, error = %e, "connection lost, transaction outcome unknown");
                        return Outcome::Err(connection_lost(sql, e, pinned));
                    }
                    tracing::warn!(sql, error = %e, "connection severed before any write or lock, retrying once");
                    self.reconnects += 1;
                    retried = true;
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
    }

    /// Run a statement returning rows.
    pub async fn query(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<Vec<Row>, Error> {
        match self.send(cx, Statement::Query, sql, params).await {
            Outcome::Ok(Reply::Rows(rows)) => Outcome::Ok(rows),
            Outcome::Ok(_) => Outcome::Ok(Vec::new()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Run a `FOR UPDATE` select. Once it succeeds the transaction holds row
    /// locks and is no longer replayed on a fresh connection.
    pub async fn query_locking(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<Vec<Row>, Error> {
        match self.send(cx, Statement::LockingQuery, sql, params).await {
            Outcome::Ok(Reply::Rows(rows)) => Outcome::Ok(rows),
            Outcome::Ok(_) => Outcome::Ok(Vec::new()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Run a write statement and return the affected rowcount.
    pub async fn execute(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<u64, Error> {
        match self.send(cx, Statement::Execute, sql, params).await {
            Outcome::Ok(Reply::Count(n)) => Outcome::Ok(n),
            Outcome::Ok(_) => Outcome::Ok(0),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Run an INSERT and return the backend-generated key.
    pub async fn insert(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<i64, Error> {
        match self.send(cx, Statement::Insert, sql, params).await {
            Outcome::Ok(Reply::Key(k)) => Outcome::Ok(k),
            Outcome::Ok(_) => Outcome::Ok(0),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Commit the open transaction, if any. The connection stays held.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if !self.in_transaction {
            return Outcome::Ok(());
        }
        let Some(conn) = self.conn.as_ref() else {
            self.end_transaction();
            return Outcome::Ok(());
        };
        self.log_statement("COMMIT", &[]);
        let outcome = conn.execute(cx, "COMMIT", &[]).await;
        match outcome {
            Outcome::Ok(_) => {
                self.end_transaction();
                Outcome::Ok(())
            }
            Outcome::Err(e) => {
                let severed = conn.classify_error(&e) == ErrorClass::ConnectionLost;
                let writes_sent = self.writes_sent;
                self.discard();
                if severed && !writes_sent {
                    tracing::debug!("connection severed on read-only commit; nothing was lost");
                    return Outcome::Ok(());
                }
                if severed {
                    return Outcome::Err(connection_lost("COMMIT", e, Some("writes were sent")));
                }
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => {
                self.discard();
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                self.discard();
                Outcome::Panicked(p)
            }
        }
    }

    /// Roll back the open transaction, if any.
    ///
    /// A connection that fails to roll back is discarded instead of being
    /// returned to the pool; a severed one needs no rollback at all.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if !self.in_transaction {
            return Outcome::Ok(());
        }
        let Some(conn) = self.conn.as_ref() else {
            self.end_transaction();
            return Outcome::Ok(());
        };
        self.log_statement("ROLLBACK", &[]);
        let outcome = conn.execute(cx, "ROLLBACK", &[]).await;
        match outcome {
            Outcome::Ok(_) => {
                self.end_transaction();
                Outcome::Ok(())
            }
            Outcome::Err(e) => {
                let severed = conn.classify_error(&e) == ErrorClass::ConnectionLost;
                self.discard();
                if severed {
                    tracing::debug!("connection severed before rollback; backend discarded the transaction");
                    return Outcome::Ok(());
                }
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => {
                self.discard();
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                self.discard();
                Outcome::Panicked(p)
            }
        }
    }

    fn end_transaction(&mut self) {
        self.in_transaction = false;
        self.writes_sent = false;
        self.locks_held = false;
    }

    /// Hand the connection back to the pool.
    ///
    /// A connection still inside a transaction is discarded rather than reused.
    pub fn release(&mut self) {
        if self.in_transaction {
            self.discard();
            return;
        }
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
            tracing::trace!("connection returned to pool");
        }
    }

    /// Drop the connection without returning it to the pool.
    pub fn discard(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
        self.end_transaction();
    }
}

impl<K: Connector> Drop for ConnectionLifecycle<K> {
    fn drop(&mut self) {
        if self.conn.is_some() {
            tracing::debug!(
                in_transaction = self.in_transaction,
                "lifecycle dropped while holding a connection"
            );
            self.release();
        }
    }
}

fn connection_lost(sql: &str, source: Error, pinned: Option<&str>) -> Error {
    let message = match pinned {
        Some(reason) => format!("connection lost after {reason}: {source}"),
        None => format!("connection lost again after reconnecting: {source}"),
    };
    Error::ConnectionLost(ConnectionLostError {
        message,
        sql: Some(sql.to_string()),
        source: Some(Box::new(source)),
    })
}
