//! Keystone - session-scoped object persistence for Rust.
//!
//! Keystone keeps an identity map and a unit of work per session, and turns
//! in-memory changes into ordered, snapshot-guarded SQL:
//!
//! - One live instance per (entity, primary key) within a session
//! - Per-attribute snapshots captured on first read or write
//! - Parent-before-child inserts, with nullable foreign-key cycles broken by
//!   a follow-up UPDATE
//! - Lost updates surfaced as [`Error::OptimisticCheck`] instead of silently
//!   overwriting another transaction's work
//! - Single-table polymorphism keyed by a discriminator column
//! - Pooled connections with transparent recovery from a connection severed
//!   before anything was written
//!
//! # Quick Start
//!
//! ```ignore
//! use keystone::prelude::*;
//!
//! static ACCOUNT_ATTRS: &[AttributeInfo] = &[
//!     AttributeInfo::new("id").primary_key(true).auto_increment(true),
//!     AttributeInfo::new("owner"),
//!     AttributeInfo::new("balance"),
//! ];
//! static ACCOUNT: EntityInfo = EntityInfo::new("Account", "accounts", ACCOUNT_ATTRS);
//!
//! async fn withdraw(cx: &Cx, builder: &SessionBuilder<MyConnector>) -> Outcome<(), Error> {
//!     let mut session = builder.build();
//!     session.begin(ScopeOptions::new())?;
//!
//!     let account = session.get_by_key(cx, &ACCOUNT, 1_i64).await?;
//!     let balance = session.get(cx, account, "balance").await?;
//!     session.set(cx, account, "balance", balance.as_i64().unwrap_or(0) - 10).await?;
//!
//!     // UPDATE "accounts" SET "balance" = $1 WHERE "id" = $2 AND "balance" = $3
//!     session.commit(cx).await
//! }
//! ```

pub use keystone_core::{
    AttributeInfo,
    Connection,
    // Error taxonomy
    ConstraintError,
    ConstraintErrorKind,
    // asupersync re-exports
    Cx,
    CycleError,
    Dialect,
    Discriminator,
    EntityInfo,
    Error,
    ErrorClass,
    IsolationLevel,
    MultipleFoundError,
    NotFoundError,
    OptimisticCheckError,
    OptimisticOperation,
    Outcome,
    PrimaryKey,
    Reference,
    ReferentialAction,
    Result,
    Row,
    Schema,
    SchemaBuilder,
    ScopeError,
    ScopeErrorKind,
    ValidationError,
    Value,
};

pub use keystone_query::{
    CacheStats, CompilationCache, CompiledQuery, Filter, QueryKind, QueryRequest,
    QueryTranslator, RowLock, SqlTranslator,
};

pub use keystone_pool::{Connector, Pool, PoolConfig, PoolStats, PooledConnection};

pub use keystone_session::{
    DirtyEntry, InstanceRef, InstanceStatus, ScopeOptions, Session, SessionConfig,
    SessionDebugInfo, SessionEvent, SessionState,
};

// Session construction
pub mod session;
pub use session::SessionBuilder;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use keystone::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Schema descriptors
        AttributeInfo,
        // Core traits and types
        Connection,
        Connector,
        Cx,
        EntityInfo,
        Error,
        // Queries
        Filter,
        InstanceRef,
        InstanceStatus,
        IsolationLevel,
        Outcome,
        // Pool
        Pool,
        PoolConfig,
        PrimaryKey,
        ReferentialAction,
        Result,
        Row,
        Schema,
        ScopeOptions,
        // Session
        Session,
        SessionBuilder,
        SessionConfig,
        SessionState,
        Value,
    };
    pub use std::sync::Arc;
}
