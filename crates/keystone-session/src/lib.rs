//! Session and unit of work for keystone.
//!
//! `keystone-session` is the **transactional layer**. It keeps one live instance
//! per persisted row, tracks which attributes each unit of work has touched,
//! and turns pending changes into ordered, snapshot-guarded statements.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: a single in-memory instance per (hierarchy root, key).
//! - **Change tracking**: per-attribute baselines captured on first touch.
//! - **Flush ordering**: parents are inserted before children; nullable
//!   foreign-key cycles are broken with a follow-up UPDATE.
//! - **Optimistic concurrency**: UPDATE and DELETE carry the snapshots of
//!   every attribute the unit of work read, so lost updates surface as
//!   [`Error::OptimisticCheck`] instead of silently overwriting.
//! - **Connection lifecycle**: connections are borrowed lazily and a severed
//!   link is retried once when nothing has been written yet.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(pool, schema);
//! session.begin(ScopeOptions::new())?;
//!
//! let account = session.get_by_key(&cx, &ACCOUNT, 1).await?;
//! let balance = session.get(&cx, account, "balance").await?;
//! session.set(&cx, account, "balance", 90).await?;
//!
//! // Flushes with `UPDATE ... WHERE id = 1 AND balance = 100`, then commits.
//! session.commit(&cx).await?;
//! ```

/// Unwrap an `Outcome`, returning early with anything but `Ok`.
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            ::asupersync::Outcome::Ok(value) => value,
            ::asupersync::Outcome::Err(e) => return ::asupersync::Outcome::Err(e),
            ::asupersync::Outcome::Cancelled(r) => return ::asupersync::Outcome::Cancelled(r),
            ::asupersync::Outcome::Panicked(p) => return ::asupersync::Outcome::Panicked(p),
        }
    };
}

/// Unwrap a `Result` inside a function returning `Outcome`.
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => return ::asupersync::Outcome::Err(e),
        }
    };
}

pub mod change_tracker;
pub mod flush;
pub mod identity_map;
pub mod lifecycle;
pub mod optimistic;
pub mod result_cache;
pub mod scope;

pub use change_tracker::ChangeTracker;
pub use flush::{DependencyEdge, FlushNode, FlushOrderer, FlushPlan, InsertOrder, PendingOp};
pub use identity_map::{IdentityMap, Instance, InstanceId, InstanceStatus, ObjectKey, Registration};
pub use lifecycle::ConnectionLifecycle;
pub use optimistic::{GuardedStatement, OptimisticValidator};
pub use result_cache::QueryResultCache;
pub use scope::{ScopeEntry, ScopeOptions, ScopeStack};

use asupersync::{Cx, Outcome};
use keystone_core::{
    AttributeInfo, ConstraintError, ConstraintErrorKind, Dialect, EntityInfo, Error,
    IsolationLevel, MultipleFoundError, NotFoundError, OptimisticCheckError, OptimisticOperation,
    PrimaryKey, ReferentialAction, Referrer, Result, Row, Schema, SchemaErrorKind,
    ScopeErrorKind, ValidationError, Value,
};
use keystone_pool::{Connector, Pool};
use keystone_query::{CacheStats, Filter, QueryKind, QueryRequest, QueryTranslator, RowLock, SqlTranslator};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Returning `Err` from a `before_*` callback aborts the operation.
type SessionEventFn = Box<dyn FnMut() -> std::result::Result<(), Error> + Send>;

/// Holds registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    #[allow(clippy::result_large_err)]
    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush executes pending changes.
    BeforeFlush,
    /// Fired after flush completes successfully.
    AfterFlush,
    /// Fired before the backend commit (after flush).
    BeforeCommit,
    /// Fired after commit completes successfully.
    AfterCommit,
    /// Fired after rollback, including rollbacks forced by an error.
    AfterRollback,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Flush pending changes before predicate queries.
    pub auto_flush: bool,
    /// Memoize select results until the next write.
    pub query_cache: bool,
    /// Log statements at info level instead of trace.
    pub sql_debug: bool,
    /// Isolation level for scopes that do not name one.
    pub isolation: IsolationLevel,
    /// Treat a re-read that contradicts a snapshot as a conflict.
    pub strict_unrepeatable_reads: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_flush: false,
            query_cache: true,
            sql_debug: false,
            isolation: IsolationLevel::ReadCommitted,
            strict_unrepeatable_reads: true,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_flush(mut self, enabled: bool) -> Self {
        self.auto_flush = enabled;
        self
    }

    pub fn query_cache(mut self, enabled: bool) -> Self {
        self.query_cache = enabled;
        self
    }

    pub fn sql_debug(mut self, enabled: bool) -> Self {
        self.sql_debug = enabled;
        self
    }

    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = level;
        self
    }

    pub fn strict_unrepeatable_reads(mut self, enabled: bool) -> Self {
        self.strict_unrepeatable_reads = enabled;
        self
    }
}

// ============================================================================
// Handles and State
// ============================================================================

/// Handle to an instance, valid for one session generation.
///
/// Generations end at commit and rollback; a handle from an earlier one is
/// rejected with [`ScopeErrorKind::StaleHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceRef {
    id: InstanceId,
    epoch: u64,
}

impl InstanceRef {
    pub fn id(&self) -> InstanceId {
        self.id
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// No unit of work; call `begin`.
    Inactive,
    Active,
    Flushing,
    Committing,
    /// The last unit of work was rolled back.
    RolledBack,
    /// Terminal.
    Closed,
}

/// One entry of [`Session::dirty_set`].
#[derive(Debug, Clone)]
pub struct DirtyEntry {
    pub instance: InstanceRef,
    pub entity: &'static str,
    pub status: InstanceStatus,
    /// Non-volatile attributes read or written in this generation.
    pub touched: Vec<&'static str>,
}

/// Debug information about session state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDebugInfo {
    pub state: SessionState,
    /// Scope nesting depth.
    pub depth: usize,
    /// Live instances in the identity map.
    pub tracked: usize,
    pub pending_new: usize,
    pub pending_dirty: usize,
    pub pending_delete: usize,
    /// Instances with at least one snapshot.
    pub touched: usize,
    pub cached_queries: usize,
    pub in_transaction: bool,
    pub writes_sent: bool,
    /// A locking select succeeded in the current transaction.
    pub locks_held: bool,
}

/// Which failures force the unit of work to roll back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Read,
    Write,
}

impl Phase {
    fn aborts_on(self, error: &Error) -> bool {
        match self {
            Phase::Write => error.requires_rollback(),
            Phase::Read => matches!(
                error,
                Error::OptimisticCheck(_) | Error::ConnectionLost(_)
            ),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// The Session is the unit-of-work manager.
///
/// It is bound to one task at a time and owns at most one pooled connection.
pub struct Session<K: Connector> {
    schema: Arc<Schema>,
    translator: Arc<dyn QueryTranslator>,
    config: SessionConfig,
    lifecycle: ConnectionLifecycle<K>,
    identity_map: IdentityMap,
    tracker: ChangeTracker,
    result_cache: QueryResultCache,
    scopes: ScopeStack,
    orderer: FlushOrderer,
    state: SessionState,
    /// Bumped whenever the identity map is cleared.
    epoch: u64,
    event_callbacks: SessionEventCallbacks,
}

impl<K: Connector> std::fmt::Debug for Session<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("depth", &self.scopes.depth())
            .field("epoch", &self.epoch)
            .field("tracked", &self.identity_map.len())
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

impl<K: Connector> Session<K> {
    /// Create a session drawing connections from `pool`.
    pub fn new(pool: Arc<Pool<K>>, schema: Arc<Schema>) -> Self {
        Self::with_config(pool, schema, SessionConfig::default())
    }

    /// Create a session with custom configuration.
    pub fn with_config(pool: Arc<Pool<K>>, schema: Arc<Schema>, config: SessionConfig) -> Self {
        let mut lifecycle = ConnectionLifecycle::new(pool);
        lifecycle.set_sql_debug(config.sql_debug);
        lifecycle.set_isolation(config.isolation);
        Self {
            identity_map: IdentityMap::new(Arc::clone(&schema)),
            schema,
            translator: Arc::new(SqlTranslator::new()),
            config,
            lifecycle,
            tracker: ChangeTracker::new(),
            result_cache: QueryResultCache::new(),
            scopes: ScopeStack::new(),
            orderer: FlushOrderer::new(),
            state: SessionState::Inactive,
            epoch: 0,
            event_callbacks: SessionEventCallbacks::default(),
        }
    }

    /// Replace the query translator.
    #[must_use]
    pub fn with_translator(self, translator: impl QueryTranslator + 'static) -> Self {
        self.with_shared_translator(Arc::new(translator))
    }

    /// Replace the query translator with one shared across sessions.
    #[must_use]
    pub fn with_shared_translator(mut self, translator: Arc<dyn QueryTranslator>) -> Self {
        self.translator = translator;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Scope nesting depth.
    pub fn depth(&self) -> usize {
        self.scopes.depth()
    }

    pub fn lifecycle(&self) -> &ConnectionLifecycle<K> {
        &self.lifecycle
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.result_cache.stats()
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a callback to run before flush.
    ///
    /// The callback can abort the flush by returning `Err`.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.before_flush.push(Box::new(f));
    }

    /// Register a callback to run after a successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_flush.push(Box::new(f));
    }

    /// Register a callback to run before commit (after flush).
    ///
    /// The callback can abort the commit by returning `Err`.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.before_commit.push(Box::new(f));
    }

    /// Register a callback to run after a successful commit.
    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_commit.push(Box::new(f));
    }

    /// Register a callback to run after rollback.
    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Enter a unit-of-work scope.
    ///
    /// Reentrant: a nested call shares the outer transaction and only bumps
    /// the depth. No statement is sent until the first database operation.
    #[allow(clippy::result_large_err)]
    pub fn begin(&mut self, options: ScopeOptions) -> Result<()> {
        match self.state {
            SessionState::Closed => return Err(closed_error()),
            SessionState::Flushing | SessionState::Committing => return Err(aborted_error()),
            SessionState::Inactive | SessionState::RolledBack | SessionState::Active => {}
        }
        let entry = self
            .scopes
            .enter(&options, self.config.isolation, self.lifecycle.sql_debug())?;
        if entry.depth == 1 {
            self.lifecycle.set_isolation(entry.isolation);
        }
        if let Some(enabled) = entry.sql_debug {
            self.lifecycle.set_sql_debug(enabled);
        }
        self.state = SessionState::Active;
        tracing::debug!(
            depth = entry.depth,
            isolation = entry.isolation.as_sql(),
            "scope entered"
        );
        Ok(())
    }

    /// Send pending changes without ending the transaction.
    ///
    /// Any failure rolls the unit of work back and clears the session.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_result!(self.ensure_active());
        let outcome = self.flush_inner(cx).await;
        self.settle(cx, outcome, Phase::Write).await
    }

    /// Flush, commit the backend transaction and start a new generation.
    ///
    /// The connection goes back to the pool when the outermost scope exits.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_result!(self.ensure_active());
        let outcome = self.commit_inner(cx).await;
        self.settle(cx, outcome, Phase::Write).await
    }

    async fn commit_inner(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.flush_inner(cx).await);
        try_result!(self.event_callbacks.fire(SessionEvent::BeforeCommit));

        self.state = SessionState::Committing;
        try_outcome!(self.lifecycle.commit(cx).await);

        self.clear_generation();
        self.exit_scope();
        tracing::debug!(depth = self.scopes.depth(), "committed");

        try_result!(self.event_callbacks.fire(SessionEvent::AfterCommit));
        Outcome::Ok(())
    }

    /// Discard pending changes and roll the backend transaction back.
    ///
    /// Session caches are cleared even from a nested scope. Rolling back an
    /// inactive session is a no-op.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.state {
            SessionState::Closed => return Outcome::Err(closed_error()),
            SessionState::Inactive | SessionState::RolledBack => return Outcome::Ok(()),
            SessionState::Flushing | SessionState::Committing => {
                self.abort(cx, "rolling back an interrupted flush").await;
                return Outcome::Ok(());
            }
            SessionState::Active => {}
        }

        let outcome = self.lifecycle.rollback(cx).await;
        self.clear_generation();
        self.exit_scope();
        if self.scopes.is_empty() {
            self.state = SessionState::RolledBack;
        }
        tracing::debug!(depth = self.scopes.depth(), "rolled back");

        try_outcome!(outcome);
        try_result!(self.event_callbacks.fire(SessionEvent::AfterRollback));
        Outcome::Ok(())
    }

    /// Roll back anything pending and close the session for good.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn close(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.state == SessionState::Closed {
            return Outcome::Ok(());
        }
        let outcome = self.lifecycle.rollback(cx).await;
        self.teardown();
        self.lifecycle.release();
        self.state = SessionState::Closed;
        outcome
    }

    /// Run DDL. Only allowed inside a scope opened with `allow_schema_mutation`.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn execute_schema(&mut self, cx: &Cx, sql: &str) -> Outcome<u64, Error> {
        try_result!(self.ensure_active());
        if !self.scopes.allows_schema_mutation() {
            return Outcome::Err(Error::scope(
                ScopeErrorKind::SchemaMutation,
                "schema mutation is not allowed in this scope",
            ));
        }
        let outcome = self.lifecycle.execute(cx, sql, &[]).await;
        self.result_cache.invalidate();
        self.settle(cx, outcome, Phase::Read).await
    }

    fn exit_scope(&mut self) {
        if let Some(previous) = self.scopes.exit() {
            self.lifecycle.set_sql_debug(previous);
        }
        if self.scopes.is_empty() {
            self.lifecycle.release();
            self.state = SessionState::Inactive;
        } else {
            self.state = SessionState::Active;
        }
    }

    #[allow(clippy::result_large_err)]
    fn ensure_active(&self) -> Result<()> {
        match self.state {
            SessionState::Active => Ok(()),
            SessionState::Inactive | SessionState::RolledBack => Err(Error::scope(
                ScopeErrorKind::Inactive,
                "no active unit of work; call begin() first",
            )),
            SessionState::Closed => Err(closed_error()),
            SessionState::Flushing | SessionState::Committing => Err(aborted_error()),
        }
    }

    /// Roll back and tear down when `outcome` failed in a way that leaves
    /// the unit of work unusable.
    async fn settle<T>(&mut self, cx: &Cx, outcome: Outcome<T, Error>, phase: Phase) -> Outcome<T, Error> {
        match outcome {
            Outcome::Err(e) if phase.aborts_on(&e) => {
                self.abort(cx, &e.to_string()).await;
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => {
                self.abort(cx, "cancelled").await;
                Outcome::Cancelled(r)
            }
            other => other,
        }
    }

    async fn abort(&mut self, cx: &Cx, reason: &str) {
        tracing::warn!(reason, depth = self.scopes.depth(), "unit of work aborted");
        if let Outcome::Err(e) = self.lifecycle.rollback(cx).await {
            tracing::warn!(error = %e, "rollback after abort failed");
        }
        self.teardown();
        self.lifecycle.release();
        self.state = SessionState::RolledBack;
        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterRollback) {
            tracing::warn!(error = %e, "after_rollback callback failed");
        }
    }

    fn clear_generation(&mut self) {
        self.identity_map.clear();
        self.tracker.clear();
        self.result_cache.clear();
        self.epoch += 1;
    }

    fn teardown(&mut self) {
        self.clear_generation();
        if let Some(previous) = self.scopes.clear() {
            self.lifecycle.set_sql_debug(previous);
        }
    }

    // ========================================================================
    // Handles
    // ========================================================================

    fn handle(&self, id: InstanceId) -> InstanceRef {
        InstanceRef {
            id,
            epoch: self.epoch,
        }
    }

    #[allow(clippy::result_large_err)]
    fn resolve(&self, handle: InstanceRef) -> Result<InstanceId> {
        if handle.epoch != self.epoch {
            return Err(Error::scope(
                ScopeErrorKind::StaleHandle,
                "handle belongs to an earlier unit of work",
            ));
        }
        if self.identity_map.get(handle.id).is_none() {
            return Err(deleted_error());
        }
        Ok(handle.id)
    }

    /// Like `resolve`, but a pending delete also counts as gone.
    #[allow(clippy::result_large_err)]
    fn resolve_live(&self, handle: InstanceRef) -> Result<InstanceId> {
        let id = self.resolve(handle)?;
        match self.identity_map.get(id).map(Instance::status) {
            Some(InstanceStatus::Deleted) | None => Err(deleted_error()),
            Some(_) => Ok(id),
        }
    }

    #[allow(clippy::result_large_err)]
    fn attribute_of(&self, id: InstanceId, name: &str) -> Result<&'static AttributeInfo> {
        let Some(info) = self.identity_map.get(id).map(Instance::info) else {
            return Err(deleted_error());
        };
        info.attribute(name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::UnknownAttribute,
                format!("{} has no attribute {}", info.name, name),
            )
        })
    }

    /// Value to send for `attr`: a pending link resolves to its target's key.
    fn current_value(&self, id: InstanceId, attr: &'static AttributeInfo) -> Option<Value> {
        let instance = self.identity_map.get(id)?;
        match instance.link(attr.name) {
            Some(target) => Some(
                self.identity_map
                    .get(target)
                    .and_then(Instance::key)
                    .and_then(PrimaryKey::single)
                    .cloned()
                    .unwrap_or(Value::Null),
            ),
            None => instance.value(attr.name).cloned(),
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Instances with unflushed operations and the attributes they touched.
    pub fn dirty_set(&self) -> Vec<DirtyEntry> {
        self.identity_map
            .iter()
            .filter(|(_, instance)| instance.status().is_pending())
            .map(|(id, instance)| {
                let touched = instance
                    .info()
                    .attributes
                    .iter()
                    .filter(|a| a.is_tracked())
                    .filter(|a| match instance.status() {
                        InstanceStatus::New => {
                            instance.has_value(a.name) || instance.link(a.name).is_some()
                        }
                        _ => self.tracker.is_touched(id, a.name),
                    })
                    .map(|a| a.name)
                    .collect();
                DirtyEntry {
                    instance: self.handle(id),
                    entity: instance.info().name,
                    status: instance.status(),
                    touched,
                }
            })
            .collect()
    }

    #[allow(clippy::result_large_err)]
    pub fn status_of(&self, handle: InstanceRef) -> Result<InstanceStatus> {
        let id = self.resolve(handle)?;
        self.identity_map
            .get(id)
            .map(Instance::status)
            .ok_or_else(deleted_error)
    }

    /// Concrete entity of an instance.
    #[allow(clippy::result_large_err)]
    pub fn entity_of(&self, handle: InstanceRef) -> Result<&'static EntityInfo> {
        let id = self.resolve(handle)?;
        self.identity_map
            .get(id)
            .map(Instance::info)
            .ok_or_else(deleted_error)
    }

    /// Primary key, once known.
    #[allow(clippy::result_large_err)]
    pub fn key_of(&self, handle: InstanceRef) -> Result<Option<PrimaryKey>> {
        let id = self.resolve(handle)?;
        Ok(self.identity_map.get(id).and_then(Instance::key).cloned())
    }

    /// Dump session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        let count = |status: InstanceStatus| {
            self.identity_map
                .iter()
                .filter(|(_, i)| i.status() == status)
                .count()
        };
        SessionDebugInfo {
            state: self.state,
            depth: self.scopes.depth(),
            tracked: self.identity_map.len(),
            pending_new: count(InstanceStatus::New),
            pending_dirty: count(InstanceStatus::Updated),
            pending_delete: count(InstanceStatus::Deleted),
            touched: self.tracker.len(),
            cached_queries: self.result_cache.len(),
            in_transaction: self.lifecycle.in_transaction(),
            writes_sent: self.lifecycle.writes_sent(),
            locks_held: self.lifecycle.locks_held(),
        }
    }

    // ========================================================================
    // Object Tracking
    // ========================================================================

    /// Register a new instance, pending INSERT.
    ///
    /// Scalar attributes are validated here. References may be linked later
    /// with [`set_ref`](Self::set_ref) and are checked at flush.
    #[allow(clippy::result_large_err)]
    pub fn create(
        &mut self,
        entity: &'static EntityInfo,
        values: Vec<(&str, Value)>,
    ) -> Result<InstanceRef> {
        self.ensure_active()?;
        let info = self.schema.resolve(entity)?;

        let mut errors = ValidationError::new();
        let mut stored: HashMap<&'static str, Value> = HashMap::with_capacity(values.len());
        for (name, value) in values {
            let Some(attr) = info.attribute(name) else {
                errors.add_unknown(name, info.name);
                continue;
            };
            if value.is_null() && !attr.nullable && !attr.auto_increment {
                errors.add_required(attr.name);
            }
            stored.insert(attr.name, value);
        }
        for attr in info.attributes {
            if attr.is_required() && !attr.is_reference() && !stored.contains_key(attr.name) {
                errors.add_required(attr.name);
            }
        }
        errors.into_result()?;

        let key = info
            .primary_key()
            .map(|a| stored.get(a.name).cloned())
            .collect::<Option<Vec<_>>>()
            .map(PrimaryKey::new)
            .filter(PrimaryKey::is_complete);
        if let Some(key) = &key {
            if self.identity_map.lookup(info, key).is_some() {
                return Err(Error::Constraint(ConstraintError {
                    kind: ConstraintErrorKind::DuplicateKey,
                    entity: info.name,
                    message: format!("an instance with key {} is already live", key),
                }));
            }
        }

        let id = self.identity_map.insert_new(info, key, stored);
        self.result_cache.invalidate();
        tracing::trace!(entity = info.name, "instance created");
        Ok(self.handle(id))
    }

    /// Read an attribute, capturing its snapshot on first touch.
    ///
    /// Seeds are materialized and lazy attributes fetched as needed.
    #[tracing::instrument(level = "trace", skip(self, cx))]
    pub async fn get(&mut self, cx: &Cx, instance: InstanceRef, attribute: &str) -> Outcome<Value, Error> {
        try_result!(self.ensure_active());
        let id = try_result!(self.resolve_live(instance));
        let outcome = self.read_attribute(cx, id, attribute).await;
        self.settle(cx, outcome, Phase::Read).await
    }

    async fn read_attribute(&mut self, cx: &Cx, id: InstanceId, attribute: &str) -> Outcome<Value, Error> {
        let attr = try_result!(self.attribute_of(id, attribute));
        let is_new = self
            .identity_map
            .get(id)
            .is_some_and(|i| i.status() == InstanceStatus::New);
        if attr.primary_key || is_new {
            return Outcome::Ok(self.current_value(id, attr).unwrap_or(Value::Null));
        }

        try_outcome!(self.ensure_loaded(cx, id).await);
        let value = match self.current_value(id, attr) {
            Some(value) => value,
            None => try_outcome!(self.fetch_column(cx, id, attr).await),
        };
        self.tracker.on_read(id, attr, &value);
        Outcome::Ok(value)
    }

    /// Write an attribute. The pre-write value becomes its snapshot if it
    /// had none.
    #[tracing::instrument(level = "trace", skip(self, cx, value))]
    pub async fn set(
        &mut self,
        cx: &Cx,
        instance: InstanceRef,
        attribute: &str,
        value: impl Into<Value>,
    ) -> Outcome<(), Error> {
        try_result!(self.ensure_active());
        let id = try_result!(self.resolve_live(instance));
        let attr = try_result!(self.attribute_of(id, attribute));
        let value = value.into();
        try_result!(check_assignable(attr, &value));
        let outcome = self.write_attribute(cx, id, attr, value, None).await;
        self.settle(cx, outcome, Phase::Read).await
    }

    async fn write_attribute(
        &mut self,
        cx: &Cx,
        id: InstanceId,
        attr: &'static AttributeInfo,
        value: Value,
        link: Option<InstanceId>,
    ) -> Outcome<(), Error> {
        let is_new = self
            .identity_map
            .get(id)
            .is_some_and(|i| i.status() == InstanceStatus::New);
        if !is_new {
            try_outcome!(self.ensure_loaded(cx, id).await);
            let baseline = match self.current_value(id, attr) {
                Some(value) => value,
                None if attr.is_tracked() => try_outcome!(self.fetch_column(cx, id, attr).await),
                None => Value::Null,
            };
            self.tracker.on_write(id, attr, &baseline);
        }

        if let Some(instance) = self.identity_map.get_mut(id) {
            instance.set_value(attr.name, value);
            if attr.is_reference() {
                instance.set_link(attr.name, link);
            }
            if instance.status() == InstanceStatus::Loaded {
                instance.set_status(InstanceStatus::Updated);
            }
        }
        self.result_cache.invalidate();
        Outcome::Ok(())
    }

    /// Follow a reference. An unloaded target comes back as a seed.
    #[tracing::instrument(level = "trace", skip(self, cx))]
    pub async fn get_ref(
        &mut self,
        cx: &Cx,
        instance: InstanceRef,
        attribute: &str,
    ) -> Outcome<Option<InstanceRef>, Error> {
        try_result!(self.ensure_active());
        let id = try_result!(self.resolve_live(instance));
        let attr = try_result!(self.attribute_of(id, attribute));
        let reference = try_result!(reference_of(attr));

        if let Some(target) = self.identity_map.get(id).and_then(|i| i.link(attr.name)) {
            return Outcome::Ok(Some(self.handle(target)));
        }
        let outcome = self.read_attribute(cx, id, attribute).await;
        let value = try_outcome!(self.settle(cx, outcome, Phase::Read).await);
        if value.is_null() {
            return Outcome::Ok(None);
        }
        let target_info = try_result!(self.schema.entity(reference.target));
        let target = self
            .identity_map
            .get_or_create(target_info, PrimaryKey::from(value));
        Outcome::Ok(Some(self.handle(target)))
    }

    /// Point a reference at `target`, or clear it with `None`.
    ///
    /// A target still pending INSERT is linked; its key is filled in at flush.
    #[tracing::instrument(level = "trace", skip(self, cx))]
    pub async fn set_ref(
        &mut self,
        cx: &Cx,
        instance: InstanceRef,
        attribute: &str,
        target: Option<InstanceRef>,
    ) -> Outcome<(), Error> {
        try_result!(self.ensure_active());
        let id = try_result!(self.resolve_live(instance));
        let attr = try_result!(self.attribute_of(id, attribute));
        let reference = try_result!(reference_of(attr));

        let (value, link) = match target {
            None => {
                try_result!(check_assignable(attr, &Value::Null));
                (Value::Null, None)
            }
            Some(handle) => {
                let target_id = try_result!(self.resolve_live(handle));
                let expected = try_result!(self.schema.entity(reference.target));
                let Some(target) = self.identity_map.get(target_id) else {
                    return Outcome::Err(deleted_error());
                };
                if !self.schema.is_a(target.info(), expected) {
                    let mut errors = ValidationError::new();
                    errors.add_custom(
                        attr.name,
                        format!("expects {}, got {}", expected.name, target.info().name),
                    );
                    return Outcome::Err(Error::Validation(errors));
                }
                let key = target
                    .key()
                    .and_then(PrimaryKey::single)
                    .cloned()
                    .unwrap_or(Value::Null);
                let link = (target.status() == InstanceStatus::New).then_some(target_id);
                (key, link)
            }
        };

        let outcome = self.write_attribute(cx, id, attr, value, link).await;
        self.settle(cx, outcome, Phase::Read).await
    }

    /// Mark an instance for deletion, applying each referrer's delete policy.
    ///
    /// Cascading children are deleted too, nullable references are cleared
    /// and a required, non-cascading reference blocks the whole delete with
    /// [`ConstraintErrorKind::CascadeBlocked`] before anything changes.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn delete(&mut self, cx: &Cx, instance: InstanceRef) -> Outcome<(), Error> {
        try_result!(self.ensure_active());
        let id = try_result!(self.resolve(instance));
        if self.identity_map.get(id).map(Instance::status) == Some(InstanceStatus::Deleted) {
            return Outcome::Ok(());
        }
        let outcome = self.delete_inner(cx, id).await;
        self.settle(cx, outcome, Phase::Read).await
    }

    async fn delete_inner(&mut self, cx: &Cx, id: InstanceId) -> Outcome<(), Error> {
        try_outcome!(self.ensure_loaded(cx, id).await);

        let mut victims = vec![id];
        let mut seen = HashSet::from([id]);
        let mut nullify: Vec<(InstanceId, &'static AttributeInfo)> = Vec::new();
        let mut queue = VecDeque::from([id]);

        while let Some(parent) = queue.pop_front() {
            let Some(info) = self.identity_map.get(parent).map(Instance::info) else {
                continue;
            };
            for referrer in self.schema.referrers(info) {
                let children = try_outcome!(self.referencing(cx, parent, referrer).await);
                let attr = referrer.attribute;
                let action = attr
                    .reference
                    .map_or(ReferentialAction::NoAction, |r| r.on_delete);
                for child in children {
                    if seen.contains(&child) {
                        continue;
                    }
                    match action {
                        ReferentialAction::Cascade => {
                            seen.insert(child);
                            victims.push(child);
                            queue.push_back(child);
                        }
                        ReferentialAction::SetNull => nullify.push((child, attr)),
                        ReferentialAction::NoAction if attr.nullable => nullify.push((child, attr)),
                        ReferentialAction::NoAction | ReferentialAction::Restrict => {
                            return Outcome::Err(self.cascade_blocked(parent, child, referrer));
                        }
                    }
                }
            }
        }

        for (child, attr) in nullify {
            if !seen.contains(&child) {
                try_outcome!(self.write_attribute(cx, child, attr, Value::Null, None).await);
            }
        }
        for &victim in &victims {
            match self.identity_map.get(victim).map(Instance::status) {
                Some(InstanceStatus::New) => {
                    self.identity_map.remove(victim);
                    self.tracker.forget(victim);
                }
                Some(_) => {
                    if let Some(instance) = self.identity_map.get_mut(victim) {
                        instance.set_status(InstanceStatus::Deleted);
                    }
                }
                None => {}
            }
        }
        self.result_cache.invalidate();
        tracing::debug!(victims = victims.len(), "delete planned");
        Outcome::Ok(())
    }

    /// Live instances whose `referrer` attribute points at `parent`,
    /// loading referencing rows from storage first.
    async fn referencing(
        &mut self,
        cx: &Cx,
        parent: InstanceId,
        referrer: Referrer,
    ) -> Outcome<Vec<InstanceId>, Error> {
        let Some((status, key)) = self
            .identity_map
            .get(parent)
            .map(|p| (p.status(), p.key().and_then(PrimaryKey::single).cloned()))
        else {
            return Outcome::Ok(Vec::new());
        };
        if status != InstanceStatus::New {
            if let Some(key) = &key {
                let filter = Filter::eq(referrer.attribute.name, key.clone());
                try_outcome!(self.select_ids(cx, referrer.entity, &filter, None, false).await);
            }
        }

        let attribute = referrer.attribute.name;
        let children = self
            .identity_map
            .iter()
            .filter(|(id, instance)| {
                *id != parent
                    && !instance.is_seed()
                    && instance.status() != InstanceStatus::Deleted
                    && self.schema.is_a(instance.info(), referrer.entity)
            })
            .filter(|(_, instance)| match instance.link(attribute) {
                Some(target) => target == parent,
                None => key.as_ref().is_some_and(|k| {
                    instance
                        .value(attribute)
                        .is_some_and(|v| same_value(v, k))
                }),
            })
            .map(|(id, _)| id)
            .collect();
        Outcome::Ok(children)
    }

    fn cascade_blocked(&self, parent: InstanceId, child: InstanceId, referrer: Referrer) -> Error {
        let label = |id| {
            self.identity_map
                .get(id)
                .map(Instance::label)
                .unwrap_or_default()
        };
        Error::Constraint(ConstraintError {
            kind: ConstraintErrorKind::CascadeBlocked,
            entity: referrer.entity.name,
            message: format!(
                "cannot delete {}: {} still references it through {}",
                label(parent),
                label(child),
                referrer.attribute.name
            ),
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Look an instance up by primary key, consulting the identity map first.
    #[tracing::instrument(level = "debug", skip(self, cx, entity, key), fields(entity = entity.name))]
    pub async fn get_by_key(
        &mut self,
        cx: &Cx,
        entity: &'static EntityInfo,
        key: impl Into<PrimaryKey>,
    ) -> Outcome<InstanceRef, Error> {
        try_result!(self.ensure_active());
        let outcome = self.get_by_key_inner(cx, entity, key.into(), None).await;
        self.settle(cx, outcome, Phase::Read).await
    }

    /// `SELECT ... FOR UPDATE` by primary key. Always goes to storage.
    #[tracing::instrument(level = "debug", skip(self, cx, entity, key), fields(entity = entity.name))]
    pub async fn get_by_key_for_update(
        &mut self,
        cx: &Cx,
        entity: &'static EntityInfo,
        key: impl Into<PrimaryKey>,
        nowait: bool,
    ) -> Outcome<InstanceRef, Error> {
        try_result!(self.ensure_active());
        let lock = Some(RowLock { nowait });
        let outcome = self.get_by_key_inner(cx, entity, key.into(), lock).await;
        self.settle(cx, outcome, Phase::Read).await
    }

    async fn get_by_key_inner(
        &mut self,
        cx: &Cx,
        entity: &'static EntityInfo,
        key: PrimaryKey,
        lock: Option<RowLock>,
    ) -> Outcome<InstanceRef, Error> {
        let info = try_result!(self.schema.resolve(entity));
        if lock.is_none() {
            if let Some(id) = self.identity_map.lookup(info, &key) {
                let status = self.identity_map.get(id).map(Instance::status);
                if status == Some(InstanceStatus::Deleted) {
                    return Outcome::Err(not_found(info, &key));
                }
                try_outcome!(self.ensure_loaded(cx, id).await);
                let matches = self
                    .identity_map
                    .get(id)
                    .is_some_and(|i| self.schema.is_a(i.info(), info));
                if !matches {
                    return Outcome::Err(not_found(info, &key));
                }
                return Outcome::Ok(self.handle(id));
            }
        }

        let filter = key_filter(info, &key);
        let ids = try_outcome!(self.select_ids(cx, info, &filter, lock, false).await);
        match ids.first() {
            Some(&id) => Outcome::Ok(self.handle(id)),
            None => Outcome::Err(not_found(info, &key)),
        }
    }

    /// Look up by unique attributes. More than one match is an error.
    #[tracing::instrument(level = "debug", skip(self, cx, entity, criteria), fields(entity = entity.name))]
    pub async fn get_or_none_by_unique(
        &mut self,
        cx: &Cx,
        entity: &'static EntityInfo,
        criteria: &[(&str, Value)],
    ) -> Outcome<Option<InstanceRef>, Error> {
        try_result!(self.ensure_active());
        if self.config.auto_flush {
            try_outcome!(self.flush(cx).await);
        }
        let info = try_result!(self.schema.resolve(entity));
        let Some(filter) = criteria
            .iter()
            .map(|(attr, value)| Filter::eq(*attr, value.clone()))
            .reduce(Filter::and)
        else {
            let mut errors = ValidationError::new();
            errors.add_custom(info.name, "unique lookup needs at least one attribute");
            return Outcome::Err(Error::Validation(errors));
        };

        let cacheable = self.config.query_cache;
        let outcome = self.select_ids(cx, info, &filter, None, cacheable).await;
        let ids = try_outcome!(self.settle(cx, outcome, Phase::Read).await);
        match ids.as_slice() {
            [] => Outcome::Ok(None),
            [id] => Outcome::Ok(Some(self.handle(*id))),
            many => Outcome::Err(Error::MultipleObjectsFound(MultipleFoundError {
                entity: info.name,
                count: many.len(),
            })),
        }
    }

    /// All instances of `entity` (and its subtypes) matching `predicate`.
    #[tracing::instrument(level = "debug", skip(self, cx, entity, predicate), fields(entity = entity.name))]
    pub async fn select_by_predicate(
        &mut self,
        cx: &Cx,
        entity: &'static EntityInfo,
        predicate: &Filter,
    ) -> Outcome<Vec<InstanceRef>, Error> {
        try_result!(self.ensure_active());
        if self.config.auto_flush {
            try_outcome!(self.flush(cx).await);
        }
        let info = try_result!(self.schema.resolve(entity));
        let cacheable = self.config.query_cache;
        let outcome = self.select_ids(cx, info, predicate, None, cacheable).await;
        let ids = try_outcome!(self.settle(cx, outcome, Phase::Read).await);
        Outcome::Ok(ids.into_iter().map(|id| self.handle(id)).collect())
    }

    /// `SELECT ... FOR UPDATE` variant of [`select_by_predicate`](Self::select_by_predicate).
    #[tracing::instrument(level = "debug", skip(self, cx, entity, predicate), fields(entity = entity.name))]
    pub async fn select_for_update(
        &mut self,
        cx: &Cx,
        entity: &'static EntityInfo,
        predicate: &Filter,
        nowait: bool,
    ) -> Outcome<Vec<InstanceRef>, Error> {
        try_result!(self.ensure_active());
        let info = try_result!(self.schema.resolve(entity));
        let lock = Some(RowLock { nowait });
        let outcome = self.select_ids(cx, info, predicate, lock, false).await;
        let ids = try_outcome!(self.settle(cx, outcome, Phase::Read).await);
        Outcome::Ok(ids.into_iter().map(|id| self.handle(id)).collect())
    }

    /// Set-based UPDATE. Bypasses the identity map.
    #[tracing::instrument(level = "debug", skip(self, cx, entity, assignments, predicate), fields(entity = entity.name))]
    pub async fn bulk_update(
        &mut self,
        cx: &Cx,
        entity: &'static EntityInfo,
        assignments: &[(&str, Value)],
        predicate: &Filter,
    ) -> Outcome<u64, Error> {
        try_result!(self.ensure_active());
        let outcome = self
            .bulk_inner(cx, entity, QueryKind::Update { assignments }, predicate)
            .await;
        self.settle(cx, outcome, Phase::Read).await
    }

    /// Set-based DELETE. Bypasses the identity map.
    #[tracing::instrument(level = "debug", skip(self, cx, entity, predicate), fields(entity = entity.name))]
    pub async fn bulk_delete(
        &mut self,
        cx: &Cx,
        entity: &'static EntityInfo,
        predicate: &Filter,
    ) -> Outcome<u64, Error> {
        try_result!(self.ensure_active());
        let outcome = self
            .bulk_inner(cx, entity, QueryKind::Delete, predicate)
            .await;
        self.settle(cx, outcome, Phase::Read).await
    }

    async fn bulk_inner(
        &mut self,
        cx: &Cx,
        entity: &'static EntityInfo,
        kind: QueryKind<'_>,
        predicate: &Filter,
    ) -> Outcome<u64, Error> {
        let info = try_result!(self.schema.resolve(entity));
        let dialect = try_outcome!(self.lifecycle.acquire(cx).await);
        let discriminator = self.schema.discriminator_filter(info);
        let request = QueryRequest {
            entity: info,
            kind,
            filter: predicate,
            discriminator: discriminator
                .as_ref()
                .map(|(column, values)| (*column, values.as_slice())),
        };
        let compiled = try_result!(self.translator.compile(&request, dialect));
        let affected = try_outcome!(
            self.lifecycle
                .execute(cx, &compiled.sql, &compiled.params)
                .await
        );
        self.result_cache.invalidate();
        tracing::debug!(entity = info.name, affected, "bulk statement executed");
        Outcome::Ok(affected)
    }

    /// Run a select and materialize every row.
    async fn select_ids(
        &mut self,
        cx: &Cx,
        info: &'static EntityInfo,
        filter: &Filter,
        lock: Option<RowLock>,
        cacheable: bool,
    ) -> Outcome<Vec<InstanceId>, Error> {
        let dialect = try_outcome!(self.lifecycle.acquire(cx).await);
        let columns = self.schema.select_columns(info);
        let discriminator = self.schema.discriminator_filter(info);
        let request = QueryRequest {
            entity: info,
            kind: QueryKind::Select {
                columns: columns.as_slice(),
                lock,
            },
            filter,
            discriminator: discriminator
                .as_ref()
                .map(|(column, values)| (*column, values.as_slice())),
        };
        let compiled = try_result!(self.translator.compile(&request, dialect));

        if cacheable {
            if let Some(ids) = self.result_cache.get(compiled.shape, &compiled.params) {
                tracing::trace!(entity = info.name, rows = ids.len(), "query result cache hit");
                return Outcome::Ok(ids);
            }
        }

        let rows = if lock.is_some() {
            try_outcome!(
                self.lifecycle
                    .query_locking(cx, &compiled.sql, &compiled.params)
                    .await
            )
        } else {
            try_outcome!(
                self.lifecycle
                    .query(cx, &compiled.sql, &compiled.params)
                    .await
            )
        };
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(id) = try_result!(self.materialize(info, row)) {
                ids.push(id);
            }
        }
        if cacheable {
            self.result_cache
                .put(compiled.shape, compiled.params, ids.clone());
        }
        Outcome::Ok(ids)
    }

    /// Register a loaded row, merging into a live instance if there is one.
    ///
    /// Returns `None` for rows whose instance is pending delete.
    #[allow(clippy::result_large_err)]
    fn materialize(&mut self, requested: &'static EntityInfo, row: &Row) -> Result<Option<InstanceId>> {
        let concrete = self.schema.resolve_row(requested, row)?;
        let mut key_values = Vec::new();
        for attr in concrete.primary_key() {
            key_values.push(row.require(attr.column)?.clone());
        }
        let key = PrimaryKey::new(key_values);
        let values: HashMap<&'static str, Value> = concrete
            .attributes
            .iter()
            .filter(|a| !a.primary_key)
            .filter_map(|a| row.get_by_name(a.column).map(|v| (a.name, v.clone())))
            .collect();

        let existing = self
            .identity_map
            .lookup(concrete, &key)
            .and_then(|id| self.identity_map.get(id).map(|i| (id, i.status())));
        match existing {
            Some((_, InstanceStatus::Deleted)) => Ok(None),
            Some((id, InstanceStatus::New)) => Ok(Some(id)),
            Some((_, InstanceStatus::Seed)) | None => {
                let (id, registration) = self.identity_map.register_loaded(concrete, key, values);
                tracing::trace!(entity = concrete.name, ?registration, "row materialized");
                Ok(Some(id))
            }
            Some((id, _)) => {
                self.merge_row(id, values)?;
                Ok(Some(id))
            }
        }
    }

    /// Refresh untouched attributes of a live instance from a re-read row.
    ///
    /// Pending writes keep their local value. A touched attribute whose stored
    /// value moved away from its snapshot was changed by another transaction.
    #[allow(clippy::result_large_err)]
    fn merge_row(&mut self, id: InstanceId, values: HashMap<&'static str, Value>) -> Result<()> {
        let Some(instance) = self.identity_map.get(id) else {
            return Ok(());
        };
        let info = instance.info();
        let pending = self.tracker.pending_writes(id);
        let mut refresh = Vec::new();
        let mut conflicts = Vec::new();
        for attr in info.attributes.iter().filter(|a| !a.primary_key) {
            let Some(stored) = values.get(attr.name) else {
                continue;
            };
            if pending.contains(attr.name) || instance.link(attr.name).is_some() {
                continue;
            }
            match self.tracker.snapshot(id, attr.name) {
                Some(snapshot) if !same_value(snapshot, stored) => conflicts.push(attr.name),
                Some(_) => {}
                None => refresh.push((attr.name, stored.clone())),
            }
        }

        if !conflicts.is_empty() {
            let key = instance.key().map(ToString::to_string).unwrap_or_default();
            if self.config.strict_unrepeatable_reads {
                tracing::warn!(
                    entity = info.name,
                    key = %key,
                    attributes = ?conflicts,
                    "re-read contradicts session snapshot"
                );
                return Err(Error::OptimisticCheck(OptimisticCheckError {
                    entity: info.name,
                    key,
                    operation: OptimisticOperation::Read,
                    attributes: conflicts,
                }));
            }
            tracing::debug!(entity = info.name, key = %key, "keeping session values over re-read");
        }

        if let Some(instance) = self.identity_map.get_mut(id) {
            for (attr, value) in refresh {
                instance.set_value(attr, value);
            }
        }
        Ok(())
    }

    /// Materialize a seed by loading its row.
    async fn ensure_loaded(&mut self, cx: &Cx, id: InstanceId) -> Outcome<(), Error> {
        let Some(instance) = self.identity_map.get(id) else {
            return Outcome::Ok(());
        };
        if !instance.is_seed() {
            return Outcome::Ok(());
        }
        let info = instance.info();
        let Some(key) = instance.key().cloned() else {
            return Outcome::Ok(());
        };
        let filter = key_filter(info, &key);
        let ids = try_outcome!(self.select_ids(cx, info, &filter, None, false).await);
        if !ids.contains(&id) {
            return Outcome::Err(not_found(info, &key));
        }
        tracing::trace!(entity = info.name, key = %key, "seed promoted");
        Outcome::Ok(())
    }

    /// Fetch one column not loaded with the row (lazy or defaulted).
    async fn fetch_column(
        &mut self,
        cx: &Cx,
        id: InstanceId,
        attr: &'static AttributeInfo,
    ) -> Outcome<Value, Error> {
        let Some((info, key)) = self
            .identity_map
            .get(id)
            .and_then(|i| i.key().cloned().map(|k| (i.info(), k)))
        else {
            return Outcome::Ok(Value::Null);
        };
        let dialect = try_outcome!(self.lifecycle.acquire(cx).await);
        let filter = key_filter(info, &key);
        let request = QueryRequest {
            entity: info,
            kind: QueryKind::Select {
                columns: std::slice::from_ref(&attr.column),
                lock: None,
            },
            filter: &filter,
            discriminator: None,
        };
        let compiled = try_result!(self.translator.compile(&request, dialect));
        let rows = try_outcome!(
            self.lifecycle
                .query(cx, &compiled.sql, &compiled.params)
                .await
        );
        let Some(row) = rows.first() else {
            return Outcome::Err(not_found(info, &key));
        };
        let value = try_result!(row.require(attr.column)).clone();
        if let Some(instance) = self.identity_map.get_mut(id) {
            instance.set_value(attr.name, value.clone());
        }
        tracing::trace!(entity = info.name, attribute = attr.name, "column fetched");
        Outcome::Ok(value)
    }

    // ========================================================================
    // Flush
    // ========================================================================

    async fn flush_inner(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_result!(self.event_callbacks.fire(SessionEvent::BeforeFlush));
        self.state = SessionState::Flushing;

        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        for (id, instance) in self.identity_map.iter() {
            let node = || FlushNode {
                id,
                seq: instance.seq(),
                label: instance.label(),
            };
            match instance.status() {
                InstanceStatus::New => inserts.push(node()),
                InstanceStatus::Updated => updates.push(node()),
                InstanceStatus::Deleted => deletes.push(node()),
                InstanceStatus::Seed | InstanceStatus::Loaded => {}
            }
        }

        if !(inserts.is_empty() && updates.is_empty() && deletes.is_empty()) {
            try_result!(self.validate_references(&inserts));
            let insert_edges = self.insert_edges(&inserts);
            let delete_edges = self.delete_edges(&deletes);
            let plan = try_result!(self.orderer.plan(
                &inserts,
                &insert_edges,
                &updates,
                &deletes,
                &delete_edges
            ));
            let (i, l, u, d) = plan.counts();
            tracing::debug!(inserts = i, links = l, updates = u, deletes = d, "flushing");

            let dialect = try_outcome!(self.lifecycle.acquire(cx).await);
            let validator = OptimisticValidator::new(dialect);
            let deferred: HashSet<(InstanceId, &'static str)> = plan
                .ops
                .iter()
                .filter_map(|op| match op {
                    PendingOp::Link(edge) => Some((edge.dependent, edge.attribute)),
                    _ => None,
                })
                .collect();

            for op in &plan.ops {
                match op {
                    PendingOp::Insert(id) => {
                        try_outcome!(self.flush_insert(cx, dialect, *id, &deferred).await)
                    }
                    PendingOp::Link(edge) => try_outcome!(self.flush_link(cx, &validator, edge).await),
                    PendingOp::Update(id) => try_outcome!(self.flush_update(cx, &validator, *id).await),
                    PendingOp::Delete(id) => try_outcome!(self.flush_delete(cx, &validator, *id).await),
                }
            }
            self.resolve_links();
            self.result_cache.invalidate();
        }

        self.state = SessionState::Active;
        try_result!(self.event_callbacks.fire(SessionEvent::AfterFlush));
        Outcome::Ok(())
    }

    /// Required references of pending inserts must be set by now.
    #[allow(clippy::result_large_err)]
    fn validate_references(&self, inserts: &[FlushNode]) -> Result<()> {
        let mut errors = ValidationError::new();
        for node in inserts {
            let Some(instance) = self.identity_map.get(node.id) else {
                continue;
            };
            for attr in instance.info().references().filter(|a| a.is_required()) {
                let linked = instance.link(attr.name).is_some();
                let valued = instance.value(attr.name).is_some_and(|v| !v.is_null());
                if !linked && !valued {
                    errors.add_required(format!("{}.{}", node.label, attr.name));
                }
            }
        }
        errors.into_result().map_err(Error::from)
    }

    /// Edges from pending inserts to the pending inserts they reference.
    fn insert_edges(&self, inserts: &[FlushNode]) -> Vec<DependencyEdge> {
        let mut edges = Vec::new();
        for node in inserts {
            let Some(instance) = self.identity_map.get(node.id) else {
                continue;
            };
            for attr in instance.info().references() {
                let Some(target) = instance.link(attr.name) else {
                    continue;
                };
                let pending = self
                    .identity_map
                    .get(target)
                    .is_some_and(|t| t.status() == InstanceStatus::New);
                if pending {
                    edges.push(DependencyEdge {
                        dependent: node.id,
                        depends_on: target,
                        attribute: attr.name,
                        nullable: attr.nullable,
                    });
                }
            }
        }
        edges
    }

    /// Edges between pending deletes; referencing rows go first.
    fn delete_edges(&self, deletes: &[FlushNode]) -> Vec<DependencyEdge> {
        let pending: HashSet<InstanceId> = deletes.iter().map(|n| n.id).collect();
        let mut edges = Vec::new();
        for node in deletes {
            let Some(info) = self.identity_map.get(node.id).map(Instance::info) else {
                continue;
            };
            for attr in info.references() {
                match self.reference_target(node.id, attr) {
                    Some(target) if target != node.id && pending.contains(&target) => {
                        edges.push(DependencyEdge {
                            dependent: node.id,
                            depends_on: target,
                            attribute: attr.name,
                            nullable: attr.nullable,
                        });
                    }
                    _ => {}
                }
            }
        }
        edges
    }

    fn reference_target(&self, id: InstanceId, attr: &'static AttributeInfo) -> Option<InstanceId> {
        let instance = self.identity_map.get(id)?;
        if let Some(target) = instance.link(attr.name) {
            return Some(target);
        }
        let value = instance.value(attr.name).filter(|v| !v.is_null())?;
        let target_info = self.schema.entity(attr.reference?.target).ok()?;
        self.identity_map
            .lookup(target_info, &PrimaryKey::from(value.clone()))
    }

    async fn flush_insert(
        &mut self,
        cx: &Cx,
        dialect: Dialect,
        id: InstanceId,
        deferred: &HashSet<(InstanceId, &'static str)>,
    ) -> Outcome<(), Error> {
        let Some(instance) = self.identity_map.get(id) else {
            return Outcome::Ok(());
        };
        let info = instance.info();
        let label = instance.label();
        let needs_key = instance.key().is_none() && info.has_generated_key();

        let mut columns = Vec::with_capacity(info.attributes.len() + 1);
        let mut params = Vec::with_capacity(info.attributes.len() + 1);
        let mut implicit_nulls = Vec::new();
        for attr in info.attributes {
            let value = if deferred.contains(&(id, attr.name)) {
                Some(Value::Null)
            } else {
                self.current_value(id, attr)
            };
            match value {
                Some(value) => {
                    columns.push(dialect.quote_identifier(attr.column));
                    params.push(value);
                }
                None if attr.auto_increment || attr.has_default => {}
                None => {
                    columns.push(dialect.quote_identifier(attr.column));
                    params.push(Value::Null);
                    implicit_nulls.push(attr.name);
                }
            }
        }
        if let Some(disc) = info.discriminator {
            columns.push(dialect.quote_identifier(disc.column));
            params.push(Value::from(disc.value));
        }

        let placeholders: Vec<String> = (1..=params.len()).map(|i| dialect.placeholder(i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            dialect.quote_identifier(info.table),
            columns.join(", "),
            placeholders.join(", ")
        );

        if needs_key {
            let generated = try_outcome!(self.lifecycle.insert(cx, &sql, &params).await);
            try_result!(self.identity_map.assign_key(id, PrimaryKey::from(generated)));
        } else {
            try_outcome!(self.lifecycle.execute(cx, &sql, &params).await);
        }
        if let Some(instance) = self.identity_map.get_mut(id) {
            for attr in implicit_nulls {
                instance.set_value(attr, Value::Null);
            }
            instance.set_status(InstanceStatus::Loaded);
        }
        self.tracker.forget(id);
        tracing::trace!(instance = %label, "inserted");
        Outcome::Ok(())
    }

    /// Fill in a foreign key deferred to break a cycle.
    async fn flush_link(
        &mut self,
        cx: &Cx,
        validator: &OptimisticValidator,
        edge: &DependencyEdge,
    ) -> Outcome<(), Error> {
        let Some(instance) = self.identity_map.get(edge.dependent) else {
            return Outcome::Ok(());
        };
        let info = instance.info();
        let (Some(key), Some(attr)) = (instance.key().cloned(), info.attribute(edge.attribute)) else {
            return Outcome::Ok(());
        };
        let value = self.current_value(edge.dependent, attr).unwrap_or(Value::Null);
        let stmt = validator.update_statement(info, &key, &[(attr, value)], &[]);
        let affected = try_outcome!(self.lifecycle.execute(cx, &stmt.sql, &stmt.params).await);
        try_result!(validator.check_rowcount(
            affected,
            info,
            &key,
            OptimisticOperation::Update,
            &stmt.guarded
        ));
        Outcome::Ok(())
    }

    async fn flush_update(
        &mut self,
        cx: &Cx,
        validator: &OptimisticValidator,
        id: InstanceId,
    ) -> Outcome<(), Error> {
        let Some(instance) = self.identity_map.get(id) else {
            return Outcome::Ok(());
        };
        let info = instance.info();
        let Some(key) = instance.key().cloned() else {
            return Outcome::Ok(());
        };
        let pending = self.tracker.pending_writes(id);
        let assignments: Vec<(&'static AttributeInfo, Value)> = info
            .attributes
            .iter()
            .filter(|a| pending.contains(a.name))
            .map(|a| (a, self.current_value(id, a).unwrap_or(Value::Null)))
            .collect();

        if !assignments.is_empty() {
            let guards = validator.guards(info, &self.tracker, id);
            let stmt = validator.update_statement(info, &key, &assignments, &guards);
            let affected = try_outcome!(self.lifecycle.execute(cx, &stmt.sql, &stmt.params).await);
            try_result!(validator.check_rowcount(
                affected,
                info,
                &key,
                OptimisticOperation::Update,
                &stmt.guarded
            ));
            for (attr, value) in &assignments {
                self.tracker.rebase(id, attr, value);
            }
        }
        if let Some(instance) = self.identity_map.get_mut(id) {
            instance.set_status(InstanceStatus::Loaded);
        }
        Outcome::Ok(())
    }

    async fn flush_delete(
        &mut self,
        cx: &Cx,
        validator: &OptimisticValidator,
        id: InstanceId,
    ) -> Outcome<(), Error> {
        let Some(instance) = self.identity_map.get(id) else {
            return Outcome::Ok(());
        };
        let info = instance.info();
        let Some(key) = instance.key().cloned() else {
            return Outcome::Ok(());
        };
        let guards = validator.guards(info, &self.tracker, id);
        let stmt = validator.delete_statement(info, &key, &guards);
        let affected = try_outcome!(self.lifecycle.execute(cx, &stmt.sql, &stmt.params).await);
        try_result!(validator.check_rowcount(
            affected,
            info,
            &key,
            OptimisticOperation::Delete,
            &stmt.guarded
        ));
        self.identity_map.remove(id);
        self.tracker.forget(id);
        Outcome::Ok(())
    }

    /// Replace links to flushed targets with their keys.
    fn resolve_links(&mut self) {
        let mut resolved = Vec::new();
        for (id, instance) in self.identity_map.iter() {
            for (attr, target) in instance.links() {
                let Some(target) = self.identity_map.get(target) else {
                    continue;
                };
                if target.status() == InstanceStatus::New {
                    continue;
                }
                if let Some(value) = target.key().and_then(PrimaryKey::single) {
                    resolved.push((id, attr, value.clone()));
                }
            }
        }
        for (id, attr, value) in resolved {
            if let Some(instance) = self.identity_map.get_mut(id) {
                instance.set_value(attr, value);
                instance.set_link(attr, None);
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn closed_error() -> Error {
    Error::scope(ScopeErrorKind::Closed, "session is closed")
}

fn aborted_error() -> Error {
    Error::scope(
        ScopeErrorKind::Aborted,
        "a flush or commit was interrupted; roll back before continuing",
    )
}

fn deleted_error() -> Error {
    Error::scope(ScopeErrorKind::InstanceDeleted, "instance has been deleted")
}

fn not_found(info: &'static EntityInfo, key: &PrimaryKey) -> Error {
    Error::ObjectNotFound(NotFoundError {
        entity: info.name,
        key: key.to_string(),
    })
}

#[allow(clippy::result_large_err)]
fn reference_of(attr: &'static AttributeInfo) -> Result<keystone_core::Reference> {
    attr.reference.ok_or_else(|| {
        Error::schema(
            SchemaErrorKind::Invalid,
            format!("{} is not a reference", attr.name),
        )
    })
}

#[allow(clippy::result_large_err)]
fn check_assignable(attr: &'static AttributeInfo, value: &Value) -> Result<()> {
    let mut errors = ValidationError::new();
    if attr.primary_key {
        errors.add_read_only(attr.name);
    } else if value.is_null() && !attr.nullable {
        errors.add_required(attr.name);
    }
    errors.into_result().map_err(Error::from)
}

/// Primary-key equality filter.
fn key_filter(info: &'static EntityInfo, key: &PrimaryKey) -> Filter {
    info.primary_key()
        .zip(key.values())
        .map(|(attr, value)| Filter::eq(attr.name, value.clone()))
        .reduce(Filter::and)
        .unwrap_or_else(Filter::all)
}

/// Value equality with integer widths normalized.
fn same_value(a: &Value, b: &Value) -> bool {
    a.clone().normalized() == b.clone().normalized()
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::manual_async_fn)] // Mock trait impls must match trait signatures
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use keystone_core::Connection;
    use std::future::Future;
    use std::sync::Mutex;

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn scope_kind(err: Error) -> ScopeErrorKind {
        match err {
            Error::SessionScope(e) => e.kind,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[derive(Debug, Default)]
    struct MockState {
        executed: Vec<(String, Vec<Value>)>,
        /// Rows returned by successive queries.
        results: VecDeque<Vec<Row>>,
        /// Rowcounts returned by successive data statements; default 1.
        affected: VecDeque<u64>,
        next_key: i64,
    }

    impl MockState {
        fn sql(&self) -> Vec<&str> {
            self.executed.iter().map(|(s, _)| s.as_str()).collect()
        }
    }

    #[derive(Debug)]
    struct MockConnection {
        state: Arc<Mutex<MockState>>,
    }

    impl Connection for MockConnection {
        fn query(
            &self,
            _cx: &Cx,
            sql: &str,
            params: &[Value],
        ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
            let mut guard = self.state.lock().expect("lock poisoned");
            guard.executed.push((sql.to_string(), params.to_vec()));
            let rows = guard.results.pop_front().unwrap_or_default();
            async move { Outcome::Ok(rows) }
        }

        fn execute(
            &self,
            _cx: &Cx,
            sql: &str,
            params: &[Value],
        ) -> impl Future<Output = Outcome<u64, Error>> + Send {
            let mut guard = self.state.lock().expect("lock poisoned");
            guard.executed.push((sql.to_string(), params.to_vec()));
            let control = ["BEGIN", "COMMIT", "ROLLBACK", "SET"]
                .iter()
                .any(|p| sql.starts_with(p));
            let affected = if control {
                0
            } else {
                guard.affected.pop_front().unwrap_or(1)
            };
            async move { Outcome::Ok(affected) }
        }

        fn insert(
            &self,
            _cx: &Cx,
            sql: &str,
            params: &[Value],
        ) -> impl Future<Output = Outcome<i64, Error>> + Send {
            let mut guard = self.state.lock().expect("lock poisoned");
            guard.executed.push((sql.to_string(), params.to_vec()));
            guard.next_key += 1;
            let key = guard.next_key;
            async move { Outcome::Ok(key) }
        }

        fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
            async { Outcome::Ok(()) }
        }
    }

    struct MockConnector {
        state: Arc<Mutex<MockState>>,
    }

    impl Connector for MockConnector {
        type Conn = MockConnection;

        fn connect(&self, _cx: &Cx) -> impl Future<Output = Outcome<MockConnection, Error>> + Send {
            let state = Arc::clone(&self.state);
            async move { Outcome::Ok(MockConnection { state }) }
        }
    }

    static AUTHOR_ATTRS: &[AttributeInfo] = &[
        AttributeInfo::new("id").primary_key(true).auto_increment(true),
        AttributeInfo::new("name"),
    ];
    static AUTHOR: EntityInfo = EntityInfo::new("Author", "authors", AUTHOR_ATTRS);

    static BOOK_ATTRS: &[AttributeInfo] = &[
        AttributeInfo::new("id").primary_key(true).auto_increment(true),
        AttributeInfo::new("title"),
        AttributeInfo::new("author_id").references("Author", ReferentialAction::Cascade),
    ];
    static BOOK: EntityInfo = EntityInfo::new("Book", "books", BOOK_ATTRS);

    fn session() -> (Session<MockConnector>, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let pool = Pool::new(
            MockConnector {
                state: Arc::clone(&state),
            },
            keystone_pool::PoolConfig::new(2),
        );
        let schema = Schema::builder()
            .entity(&AUTHOR)
            .entity(&BOOK)
            .build()
            .expect("valid schema");
        (Session::new(Arc::new(pool), Arc::new(schema)), state)
    }

    fn author_row(id: i64, name: &str) -> Row {
        Row::new(
            vec!["id".into(), "name".into()],
            vec![Value::BigInt(id), Value::from(name)],
        )
    }

    #[test]
    fn test_operations_require_begin() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (mut session, _) = session();

        let err = session
            .create(&AUTHOR, vec![("name", Value::from("Ann"))])
            .unwrap_err();
        assert_eq!(scope_kind(err), ScopeErrorKind::Inactive);

        session.begin(ScopeOptions::new()).unwrap();
        session
            .create(&AUTHOR, vec![("name", Value::from("Ann"))])
            .unwrap();

        rt.block_on(async {
            unwrap_outcome(session.close(&cx).await);
        });
        assert_eq!(session.state(), SessionState::Closed);
        let err = session.begin(ScopeOptions::new()).unwrap_err();
        assert_eq!(scope_kind(err), ScopeErrorKind::Closed);
    }

    #[test]
    fn test_create_validation() {
        let (mut session, _) = session();
        session.begin(ScopeOptions::new()).unwrap();

        match session.create(&AUTHOR, vec![("nickname", Value::from("x"))]) {
            Err(Error::Validation(e)) => assert_eq!(e.errors.len(), 2),
            other => panic!("unexpected result: {other:?}"),
        }

        let values = || vec![("id", Value::BigInt(5)), ("name", Value::from("Ann"))];
        session.create(&AUTHOR, values()).unwrap();
        match session.create(&AUTHOR, values()) {
            Err(Error::Constraint(e)) => assert_eq!(e.kind, ConstraintErrorKind::DuplicateKey),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_nested_scopes() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (mut session, state) = session();

        session.begin(ScopeOptions::new()).unwrap();
        let err = session
            .begin(ScopeOptions::new().isolation(IsolationLevel::Serializable))
            .unwrap_err();
        assert_eq!(scope_kind(err), ScopeErrorKind::IsolationEscalation);
        assert_eq!(session.depth(), 1);

        session.begin(ScopeOptions::new().sql_debug(true)).unwrap();
        assert!(session.lifecycle().sql_debug());
        assert_eq!(session.depth(), 2);

        rt.block_on(async {
            unwrap_outcome(session.commit(&cx).await);
            assert_eq!(session.depth(), 1);
            assert_eq!(session.state(), SessionState::Active);
            assert!(!session.lifecycle().sql_debug());
            unwrap_outcome(session.commit(&cx).await);
        });
        assert_eq!(session.state(), SessionState::Inactive);
        // Nothing was sent: no transaction was ever needed.
        assert!(state.lock().unwrap().executed.is_empty());
    }

    #[test]
    fn test_flush_inserts_parent_first() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (mut session, state) = session();

        rt.block_on(async {
            session.begin(ScopeOptions::new()).unwrap();
            let book = session
                .create(&BOOK, vec![("title", Value::from("Dune"))])
                .unwrap();
            let author = session
                .create(&AUTHOR, vec![("name", Value::from("Frank"))])
                .unwrap();
            unwrap_outcome(session.set_ref(&cx, book, "author_id", Some(author)).await);
            unwrap_outcome(session.commit(&cx).await);
        });

        let guard = state.lock().unwrap();
        assert_eq!(
            guard.sql(),
            vec![
                "BEGIN",
                "INSERT INTO \"authors\" (\"name\") VALUES ($1)",
                "INSERT INTO \"books\" (\"title\", \"author_id\") VALUES ($1, $2)",
                "COMMIT",
            ]
        );
        assert_eq!(
            guard.executed[2].1,
            vec![Value::from("Dune"), Value::BigInt(1)]
        );
    }

    #[test]
    fn test_identity_and_guarded_update() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (mut session, state) = session();
        state
            .lock()
            .unwrap()
            .results
            .push_back(vec![author_row(7, "Ann")]);

        rt.block_on(async {
            session.begin(ScopeOptions::new()).unwrap();
            let a = unwrap_outcome(session.get_by_key(&cx, &AUTHOR, 7_i64).await);
            let b = unwrap_outcome(session.get_by_key(&cx, &AUTHOR, 7_i64).await);
            assert_eq!(a, b);

            assert_eq!(unwrap_outcome(session.get(&cx, a, "name").await), Value::from("Ann"));
            unwrap_outcome(session.set(&cx, a, "name", "Bea").await);
            assert_eq!(session.status_of(a).unwrap(), InstanceStatus::Updated);

            let dirty = session.dirty_set();
            assert_eq!(dirty.len(), 1);
            assert_eq!(dirty[0].touched, vec!["name"]);
            unwrap_outcome(session.commit(&cx).await);
        });

        let guard = state.lock().unwrap();
        assert_eq!(
            guard.sql(),
            vec![
                "BEGIN",
                "SELECT \"id\", \"name\" FROM \"authors\" WHERE \"id\" = $1",
                "UPDATE \"authors\" SET \"name\" = $1 WHERE \"id\" = $2 AND \"name\" = $3",
                "COMMIT",
            ]
        );
        assert_eq!(
            guard.executed[2].1,
            vec![Value::from("Bea"), Value::BigInt(7), Value::from("Ann")]
        );
    }

    #[test]
    fn test_conflict_rolls_back_and_clears() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (mut session, state) = session();
        {
            let mut guard = state.lock().unwrap();
            guard.results.push_back(vec![author_row(7, "Ann")]);
            guard.affected.push_back(0);
        }

        rt.block_on(async {
            session.begin(ScopeOptions::new()).unwrap();
            let a = unwrap_outcome(session.get_by_key(&cx, &AUTHOR, 7_i64).await);
            unwrap_outcome(session.set(&cx, a, "name", "Bea").await);

            match session.commit(&cx).await {
                Outcome::Err(Error::OptimisticCheck(e)) => {
                    assert_eq!(e.entity, "Author");
                    assert_eq!(e.operation, OptimisticOperation::Update);
                }
                other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
            }
            assert_eq!(session.state(), SessionState::RolledBack);
            assert_eq!(session.depth(), 0);
            assert_eq!(scope_kind(session.status_of(a).unwrap_err()), ScopeErrorKind::StaleHandle);
        });

        assert_eq!(state.lock().unwrap().sql().last(), Some(&"ROLLBACK"));
    }

    #[test]
    fn test_events_fire_in_order() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (mut session, _) = session();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = Arc::clone(&log);
        session.on_before_flush(move || {
            l.lock().unwrap().push("before_flush");
            Ok(())
        });
        let l = Arc::clone(&log);
        session.on_after_flush(move || {
            l.lock().unwrap().push("after_flush");
            Ok(())
        });
        let l = Arc::clone(&log);
        session.on_before_commit(move || {
            l.lock().unwrap().push("before_commit");
            Ok(())
        });
        let l = Arc::clone(&log);
        session.on_after_commit(move || {
            l.lock().unwrap().push("after_commit");
            Ok(())
        });

        rt.block_on(async {
            session.begin(ScopeOptions::new()).unwrap();
            unwrap_outcome(session.commit(&cx).await);
        });
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before_flush", "after_flush", "before_commit", "after_commit"]
        );
    }

    #[test]
    fn test_failing_before_commit_aborts() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (mut session, _) = session();
        let rolled_back = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&rolled_back);
        session.on_before_commit(|| Err(Error::Custom("vetoed".into())));
        session.on_after_rollback(move || {
            *flag.lock().unwrap() = true;
            Ok(())
        });

        rt.block_on(async {
            session.begin(ScopeOptions::new()).unwrap();
            session
                .create(&AUTHOR, vec![("name", Value::from("Ann"))])
                .unwrap();
            match session.commit(&cx).await {
                Outcome::Err(Error::Custom(msg)) => assert_eq!(msg, "vetoed"),
                other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
            }
        });
        assert_eq!(session.state(), SessionState::RolledBack);
        assert!(*rolled_back.lock().unwrap());
        assert_eq!(session.debug_state().tracked, 0);
    }

    #[test]
    fn test_debug_state_serializes() {
        let (mut session, _) = session();
        session.begin(ScopeOptions::new()).unwrap();
        session
            .create(&AUTHOR, vec![("name", Value::from("Ann"))])
            .unwrap();

        let info = session.debug_state();
        assert_eq!(info.pending_new, 1);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["state"], "Active");
        assert_eq!(json["depth"], 1);
        assert_eq!(json["in_transaction"], false);
    }
}
