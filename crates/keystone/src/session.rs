//! Session construction.
//!
//! A [`SessionBuilder`] collects what every session of an application shares
//! (the pool, the schema, a translator) plus per-session configuration, and
//! stamps out [`Session`]s.
//!
//! # Example
//!
//! ```rust,ignore
//! use keystone::prelude::*;
//!
//! let builder = SessionBuilder::new(pool, schema)
//!     .auto_flush(true)
//!     .isolation(IsolationLevel::RepeatableRead);
//!
//! let mut first = builder.build();
//! let mut second = builder.build();
//! ```

use std::sync::Arc;

use keystone_core::{IsolationLevel, Schema};
use keystone_pool::{Connector, Pool};
use keystone_query::QueryTranslator;
use keystone_session::{Session, SessionConfig};

/// Builder for creating Session instances with fluent API.
pub struct SessionBuilder<K: Connector> {
    pool: Arc<Pool<K>>,
    schema: Arc<Schema>,
    config: SessionConfig,
    translator: Option<Arc<dyn QueryTranslator>>,
}

impl<K: Connector> std::fmt::Debug for SessionBuilder<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("entities", &self.schema.len())
            .field("config", &self.config)
            .field("custom_translator", &self.translator.is_some())
            .finish_non_exhaustive()
    }
}

impl<K: Connector> SessionBuilder<K> {
    /// Create a builder for sessions drawing from `pool`.
    #[must_use]
    pub fn new(pool: Arc<Pool<K>>, schema: Arc<Schema>) -> Self {
        Self {
            pool,
            schema,
            config: SessionConfig::default(),
            translator: None,
        }
    }

    /// Replace the whole session configuration.
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Flush pending changes before predicate queries.
    #[must_use]
    pub fn auto_flush(mut self, enabled: bool) -> Self {
        self.config.auto_flush = enabled;
        self
    }

    #[must_use]
    pub fn query_cache(mut self, enabled: bool) -> Self {
        self.config.query_cache = enabled;
        self
    }

    /// Log every statement at info level.
    #[must_use]
    pub fn sql_debug(mut self, enabled: bool) -> Self {
        self.config.sql_debug = enabled;
        self
    }

    /// Default isolation for scopes that do not request one.
    #[must_use]
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.config.isolation = level;
        self
    }

    #[must_use]
    pub fn strict_unrepeatable_reads(mut self, enabled: bool) -> Self {
        self.config.strict_unrepeatable_reads = enabled;
        self
    }

    /// Compile predicates with `translator` instead of the built-in SQL one.
    #[must_use]
    pub fn translator(mut self, translator: impl QueryTranslator + 'static) -> Self {
        self.translator = Some(Arc::new(translator));
        self
    }

    pub fn pool(&self) -> &Arc<Pool<K>> {
        &self.pool
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Build a fresh session. Sessions built from one builder share the pool
    /// and schema but nothing else.
    pub fn build(&self) -> Session<K> {
        let session = Session::with_config(
            Arc::clone(&self.pool),
            Arc::clone(&self.schema),
            self.config.clone(),
        );
        tracing::debug!(
            entities = self.schema.len(),
            auto_flush = self.config.auto_flush,
            isolation = self.config.isolation.as_sql(),
            "session created"
        );
        match &self.translator {
            Some(translator) => session.with_shared_translator(Arc::clone(translator)),
            None => session,
        }
    }
}

#[cfg(test)]
#[allow(clippy::manual_async_fn)] // Mock trait impls must match trait signatures
mod tests {
    use super::*;
    use asupersync::{Cx, Outcome};
    use keystone_core::{AttributeInfo, Connection, Dialect, EntityInfo, Error, Row, Value};
    use keystone_pool::PoolConfig;
    use keystone_query::{CompiledQuery, QueryRequest};
    use keystone_session::{ScopeOptions, SessionState};
    use std::future::Future;

    #[derive(Debug)]
    struct NullConnection;

    impl Connection for NullConnection {
        fn query(
            &self,
            _cx: &Cx,
            _sql: &str,
            _params: &[Value],
        ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
            async { Outcome::Ok(vec![]) }
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
            async { Outcome::Ok(()) }
        }
    }

    struct NullConnector;

    impl Connector for NullConnector {
        type Conn = NullConnection;

        fn connect(&self, _cx: &Cx) -> impl Future<Output = Outcome<NullConnection, Error>> + Send {
            async { Outcome::Ok(NullConnection) }
        }
    }

    struct FixedTranslator;

    impl QueryTranslator for FixedTranslator {
        fn compile(&self, _request: &QueryRequest<'_>, _dialect: Dialect) -> keystone_core::Result<CompiledQuery> {
            Ok(CompiledQuery {
                sql: Arc::from("SELECT 1"),
                shape: 0,
                params: Vec::new(),
            })
        }
    }

    static NOTE_ATTRS: &[AttributeInfo] = &[
        AttributeInfo::new("id").primary_key(true).auto_increment(true),
        AttributeInfo::new("body"),
    ];
    static NOTE: EntityInfo = EntityInfo::new("Note", "notes", NOTE_ATTRS);

    fn builder() -> SessionBuilder<NullConnector> {
        let pool = Arc::new(Pool::new(NullConnector, PoolConfig::new(4)));
        let schema = Schema::builder().entity(&NOTE).build().expect("valid schema");
        SessionBuilder::new(pool, Arc::new(schema))
    }

    #[test]
    fn test_builder_applies_config() {
        let builder = builder()
            .auto_flush(true)
            .query_cache(false)
            .isolation(IsolationLevel::Serializable)
            .strict_unrepeatable_reads(false);
        let session = builder.build();

        let config = session.config();
        assert!(config.auto_flush);
        assert!(!config.query_cache);
        assert_eq!(config.isolation, IsolationLevel::Serializable);
        assert!(!config.strict_unrepeatable_reads);
        assert_eq!(session.state(), SessionState::Inactive);
    }

    #[test]
    fn test_sessions_are_independent() {
        let builder = builder().translator(FixedTranslator);
        let mut first = builder.build();
        let second = builder.build();

        first.begin(ScopeOptions::new()).unwrap();
        first
            .create(&NOTE, vec![("body", Value::from("hello"))])
            .unwrap();

        assert_eq!(first.debug_state().pending_new, 1);
        assert_eq!(second.debug_state().pending_new, 0);
        assert_eq!(second.state(), SessionState::Inactive);
        assert!(Arc::ptr_eq(first.schema(), builder.schema()));
    }

    #[test]
    fn test_sql_debug_reaches_lifecycle() {
        let session = builder().sql_debug(true).build();
        assert!(session.lifecycle().sql_debug());
        assert_eq!(session.lifecycle().pool().stats().total_connections, 0);
    }
}
