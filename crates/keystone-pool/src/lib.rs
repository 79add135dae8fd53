//! Connection pooling for keystone using asupersync.
//!
//! Sessions borrow one connection for the lifetime of a transaction and hand
//! it back on commit or rollback. The pool keeps released connections idle so
//! the next session can reuse them, and opens new ones through a
//! [`Connector`] when none are idle.
//!
//! Connections whose link was severed are never returned to the idle list:
//! the session calls [`Pool::discard`] instead of [`Pool::release`].

use keystone_core::error::{PoolError, PoolErrorKind};
use keystone_core::{Connection, Cx, Error, Outcome};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Opens new backend connections for a [`Pool`].
pub trait Connector: Send + Sync {
    /// Connection type produced.
    type Conn: Connection;

    /// Open a fresh connection.
    fn connect(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Conn, Error>> + Send;
}

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections open at once (idle + checked out)
    pub max_connections: usize,
    /// Maximum number of idle connections kept for reuse
    pub max_idle: usize,
    /// Ping idle connections before giving them out
    pub test_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_idle: 10,
            test_on_checkout: true,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given max connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            max_idle: max_connections,
            ..Default::default()
        }
    }

    /// Set the idle-list capacity.
    pub fn max_idle(mut self, n: usize) -> Self {
        self.max_idle = n;
        self
    }

    /// Enable/disable test on checkout.
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections (active + idle)
    pub total_connections: usize,
    /// Number of idle connections
    pub idle_connections: usize,
    /// Number of checked-out connections
    pub active_connections: usize,
    /// Connections opened over the pool's lifetime
    pub opened_connections: usize,
}

/// A pool of connections produced by a [`Connector`].
pub struct Pool<K: Connector> {
    connector: K,
    config: PoolConfig,
    idle: Mutex<Vec<K::Conn>>,
    /// Connections currently open, idle or checked out.
    total: AtomicUsize,
    opened: AtomicUsize,
}

impl<K: Connector> std::fmt::Debug for Pool<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<K: Connector> Pool<K> {
    /// Create a new connection pool. No connection is opened until the first acquire.
    pub fn new(connector: K, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            idle: Mutex::new(Vec::new()),
            total: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
        }
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The connector backing this pool.
    pub fn connector(&self) -> &K {
        &self.connector
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let total = self.total.load(Ordering::Acquire);
        let idle = self.lock_idle().len();
        PoolStats {
            total_connections: total,
            idle_connections: idle,
            active_connections: total.saturating_sub(idle),
            opened_connections: self.opened.load(Ordering::Relaxed),
        }
    }

    /// Check if the pool is at capacity.
    pub fn at_capacity(&self) -> bool {
        self.total.load(Ordering::Acquire) >= self.config.max_connections
    }

    /// Check out a connection, reusing an idle one when possible.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn acquire(&self, cx: &Cx) -> Outcome<PooledConnection<K::Conn>, Error> {
        loop {
            let candidate = self.lock_idle().pop();
            let Some(conn) = candidate else {
                break;
            };
            if self.config.test_on_checkout && !conn.is_valid(cx).await {
                tracing::debug!("discarding idle connection that failed its ping");
                self.total.fetch_sub(1, Ordering::AcqRel);
                continue;
            }
            tracing::trace!("reusing idle connection");
            return Outcome::Ok(PooledConnection::new(conn));
        }

        let reserved = self
            .total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.config.max_connections).then_some(n + 1)
            });
        if reserved.is_err() {
            tracing::warn!(
                max_connections = self.config.max_connections,
                "connection pool exhausted"
            );
            return Outcome::Err(Error::Pool(PoolError {
                kind: PoolErrorKind::Exhausted,
                message: format!(
                    "all {} connections are checked out",
                    self.config.max_connections
                ),
            }));
        }

        match self.connector.connect(cx).await {
            Outcome::Ok(conn) => {
                let opened = self.opened.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(opened, "opened new connection");
                Outcome::Ok(PooledConnection::new(conn))
            }
            Outcome::Err(e) => {
                self.total.fetch_sub(1, Ordering::AcqRel);
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => {
                self.total.fetch_sub(1, Ordering::AcqRel);
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                self.total.fetch_sub(1, Ordering::AcqRel);
                Outcome::Panicked(p)
            }
        }
    }

    /// Return a healthy connection to the idle list.
    pub fn release(&self, conn: PooledConnection<K::Conn>) {
        let mut idle = self.lock_idle();
        if idle.len() < self.config.max_idle {
            idle.push(conn.into_inner());
        } else {
            drop(idle);
            self.total.fetch_sub(1, Ordering::AcqRel);
            tracing::trace!("idle list full, closing released connection");
        }
    }

    /// Drop a connection that must not be reused.
    pub fn discard(&self, conn: PooledConnection<K::Conn>) {
        drop(conn.into_inner());
        self.total.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!("discarded connection");
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<K::Conn>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A connection borrowed from the pool.
///
/// Owners must hand it back with [`Pool::release`] or [`Pool::discard`],
/// including from their own `Drop`, since the pool only counts slots freed
/// through those two calls.
#[derive(Debug)]
pub struct PooledConnection<C> {
    conn: C,
}

impl<C> PooledConnection<C> {
    /// Create a new pooled connection wrapper.
    pub fn new(conn: C) -> Self {
        Self { conn }
    }

    /// Get the inner connection.
    pub fn into_inner(self) -> C {
        self.conn
    }
}

impl<C> std::ops::Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<C> std::ops::DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

#[cfg(test)]
#[allow(clippy::manual_async_fn)] // Mock trait impls must match trait signatures
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use keystone_core::{Row, Value};
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    #[derive(Debug)]
    struct MockConnection {
        alive: Arc<AtomicBool>,
    }

    impl Connection for MockConnection {
        fn query(
            &self,
            _cx: &Cx,
            _sql: &str,
            _params: &[Value],
        ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
            async { Outcome::Ok(Vec::new()) }
        }

        fn execute(
            &self,
            _cx: &Cx,
            _sql: &str,
            _params: &[Value],
        ) -> impl Future<Output = Outcome<u64, Error>> + Send {
            async { Outcome::Ok(0) }
        }

        fn insert(
            &self,
            _cx: &Cx,
            _sql: &str,
            _params: &[Value],
        ) -> impl Future<Output = Outcome<i64, Error>> + Send {
            async { Outcome::Ok(0) }
        }

        fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
            let alive = self.alive.load(Ordering::SeqCst);
            async move {
                if alive {
                    Outcome::Ok(())
                } else {
                    Outcome::Err(Error::Custom("gone".into()))
                }
            }
        }
    }

    #[derive(Default)]
    struct MockConnector {
        last: Mutex<Option<Arc<AtomicBool>>>,
    }

    impl Connector for MockConnector {
        type Conn = MockConnection;

        fn connect(&self, _cx: &Cx) -> impl Future<Output = Outcome<MockConnection, Error>> + Send {
            let alive = Arc::new(AtomicBool::new(true));
            *self.last.lock().unwrap() = Some(Arc::clone(&alive));
            async move { Outcome::Ok(MockConnection { alive }) }
        }
    }

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new(4).max_idle(2).test_on_checkout(false);
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.max_idle, 2);
        assert!(!config.test_on_checkout);
    }

    #[test]
    fn test_release_reuses_connection() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let pool = Pool::new(MockConnector::default(), PoolConfig::new(2));

        rt.block_on(async {
            let conn = unwrap_outcome(pool.acquire(&cx).await);
            assert_eq!(pool.stats().active_connections, 1);
            pool.release(conn);
            assert_eq!(pool.stats().idle_connections, 1);

            let again = unwrap_outcome(pool.acquire(&cx).await);
            assert_eq!(pool.stats().opened_connections, 1);
            pool.release(again);
        });
    }

    #[test]
    fn test_exhausted_at_max_connections() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let pool = Pool::new(MockConnector::default(), PoolConfig::new(1));

        rt.block_on(async {
            let held = unwrap_outcome(pool.acquire(&cx).await);
            assert!(pool.at_capacity());
            match pool.acquire(&cx).await {
                Outcome::Err(Error::Pool(e)) => assert_eq!(e.kind, PoolErrorKind::Exhausted),
                other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
            }
            pool.discard(held);
            assert_eq!(pool.stats().total_connections, 0);
            let fresh = unwrap_outcome(pool.acquire(&cx).await);
            pool.release(fresh);
        });
    }

    #[test]
    fn test_dead_idle_connection_is_replaced() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let pool = Pool::new(MockConnector::default(), PoolConfig::new(2));

        rt.block_on(async {
            let conn = unwrap_outcome(pool.acquire(&cx).await);
            pool.release(conn);
            let flag = pool.connector().last.lock().unwrap().clone().unwrap();
            flag.store(false, Ordering::SeqCst);

            let conn = unwrap_outcome(pool.acquire(&cx).await);
            assert!(conn.alive.load(Ordering::SeqCst));
            let stats = pool.stats();
            assert_eq!(stats.opened_connections, 2);
            assert_eq!(stats.total_connections, 1);
            pool.release(conn);
        });
    }
}
