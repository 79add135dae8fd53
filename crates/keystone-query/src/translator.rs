//! The query-translator collaborator.
//!
//! The session never assembles predicate SQL itself. It describes what it
//! wants as a [`QueryRequest`] and hands it to a [`QueryTranslator`], which
//! returns statement text plus the bound parameters in placeholder order.

use crate::cache::CompilationCache;
use crate::filter::Filter;
use keystone_core::{Dialect, EntityInfo, Result, Value};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Row-lock request attached to a select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowLock {
    /// Fail immediately instead of waiting for the lock.
    pub nowait: bool,
}

/// Statement family being compiled.
#[derive(Debug, Clone, Copy)]
pub enum QueryKind<'a> {
    Select {
        /// Columns to return, already resolved by the caller.
        columns: &'a [&'static str],
        lock: Option<RowLock>,
    },
    /// Set-based update; assignments name attributes.
    Update { assignments: &'a [(&'a str, Value)] },
    /// Set-based delete.
    Delete,
}

/// Everything a translator needs to compile one statement.
#[derive(Debug, Clone, Copy)]
pub struct QueryRequest<'a> {
    pub entity: &'static EntityInfo,
    pub kind: QueryKind<'a>,
    pub filter: &'a Filter,
    /// Discriminator column and the values admitted, for polymorphic subtrees.
    pub discriminator: Option<(&'static str, &'a [&'static str])>,
}

impl QueryRequest<'_> {
    /// Stable hash of the request's shape, independent of bound values.
    pub fn shape_hash(&self, dialect: Dialect) -> u64 {
        let mut h = std::collections::hash_map::DefaultHasher::new();
        self.entity.name.hash(&mut h);
        dialect.hash(&mut h);
        match self.kind {
            QueryKind::Select { columns, lock } => {
                0u8.hash(&mut h);
                columns.hash(&mut h);
                lock.hash(&mut h);
            }
            QueryKind::Update { assignments } => {
                1u8.hash(&mut h);
                for (attr, value) in assignments {
                    attr.hash(&mut h);
                    value.is_null().hash(&mut h);
                }
            }
            QueryKind::Delete => 2u8.hash(&mut h),
        }
        self.filter.hash_shape(&mut h);
        self.discriminator.hash(&mut h);
        h.finish()
    }
}

/// Statement text plus parameters.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub sql: Arc<str>,
    /// Identity of the compiled shape, used as the result-cache key.
    pub shape: u64,
    pub params: Vec<Value>,
}

/// Compiles predicates into statements.
pub trait QueryTranslator: Send + Sync {
    #[allow(clippy::result_large_err)]
    fn compile(&self, request: &QueryRequest<'_>, dialect: Dialect) -> Result<CompiledQuery>;
}

/// Default translator emitting plain ANSI SQL.
///
/// Statement text is memoized in the process-wide [`CompilationCache`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlTranslator;

impl SqlTranslator {
    pub fn new() -> Self {
        Self
    }

    #[allow(clippy::result_large_err)]
    fn render(request: &QueryRequest<'_>, dialect: Dialect) -> Result<String> {
        let table = dialect.quote_identifier(request.entity.table);
        let mut next = 1;
        let mut sql = String::new();
        let mut where_parts: Vec<String> = Vec::new();

        match request.kind {
            QueryKind::Select { columns, .. } => {
                let cols: Vec<String> =
                    columns.iter().map(|c| dialect.quote_identifier(c)).collect();
                sql.push_str(&format!("SELECT {} FROM {}", cols.join(", "), table));
            }
            QueryKind::Update { assignments } => {
                let mut sets = Vec::with_capacity(assignments.len());
                for (attr, value) in assignments {
                    let column = request
                        .entity
                        .attribute(attr)
                        .map(|a| a.column)
                        .ok_or_else(|| unknown_attribute(request.entity, attr))?;
                    let column = dialect.quote_identifier(column);
                    if value.is_null() {
                        sets.push(format!("{column} = NULL"));
                    } else {
                        sets.push(format!("{column} = {}", dialect.placeholder(next)));
                        next += 1;
                    }
                }
                sql.push_str(&format!("UPDATE {} SET {}", table, sets.join(", ")));
            }
            QueryKind::Delete => sql.push_str(&format!("DELETE FROM {table}")),
        }

        if !request.filter.is_all() {
            let mut clause = String::new();
            let wrap = matches!(request.filter, Filter::Or(_));
            request
                .filter
                .render(request.entity, dialect, &mut next, &mut clause)?;
            where_parts.push(if wrap { format!("({clause})") } else { clause });
        }

        if let Some((column, values)) = request.discriminator {
            let placeholders: Vec<String> = (0..values.len())
                .map(|i| dialect.placeholder(next + i))
                .collect();
            where_parts.push(format!(
                "{} IN ({})",
                dialect.quote_identifier(column),
                placeholders.join(", ")
            ));
        }

        if !where_parts.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_parts.join(" AND "));
        }

        if let QueryKind::Select {
            lock: Some(lock), ..
        } = request.kind
        {
            sql.push_str(dialect.for_update(lock.nowait));
        }
        Ok(sql)
    }

    fn bind(request: &QueryRequest<'_>) -> Vec<Value> {
        let mut params = Vec::new();
        if let QueryKind::Update { assignments } = request.kind {
            params.extend(
                assignments
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(_, v)| v.clone()),
            );
        }
        request.filter.bind(&mut params);
        if let Some((_, values)) = request.discriminator {
            params.extend(values.iter().map(|v| Value::from(*v)));
        }
        params
    }
}

impl QueryTranslator for SqlTranslator {
    fn compile(&self, request: &QueryRequest<'_>, dialect: Dialect) -> Result<CompiledQuery> {
        let shape = request.shape_hash(dialect);
        let sql = CompilationCache::global().get_or_compile(shape, || Self::render(request, dialect))?;
        Ok(CompiledQuery {
            sql,
            shape,
            params: Self::bind(request),
        })
    }
}

fn unknown_attribute(entity: &EntityInfo, attr: &str) -> keystone_core::Error {
    keystone_core::Error::schema(
        keystone_core::SchemaErrorKind::UnknownAttribute,
        format!("{} has no attribute {}", entity.name, attr),
    )
}
