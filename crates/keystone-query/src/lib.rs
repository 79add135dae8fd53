//! Query compilation for keystone.
//!
//! `keystone-query` is the predicate-to-SQL collaborator the session delegates
//! to. It owns three things:
//!
//! - [`Filter`], a predicate over attribute names
//! - [`QueryTranslator`] and its default [`SqlTranslator`]
//! - the process-wide [`CompilationCache`], keyed by query-shape hash and shared
//!   across sessions

pub mod cache;
pub mod filter;
pub mod translator;

pub use cache::{CacheStats, CachedStatement, CompilationCache, StatementCache, cache_key};
pub use filter::{CompareOp, Filter};
pub use translator::{
    CompiledQuery, QueryKind, QueryRequest, QueryTranslator, RowLock, SqlTranslator,
};
