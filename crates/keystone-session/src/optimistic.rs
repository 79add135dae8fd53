//! Optimistic concurrency guards.
//!
//! Every UPDATE and DELETE a flush sends is guarded by the snapshots of the
//! attributes the session actually read or wrote:
//!
//! ```text
//! UPDATE "accounts" SET "balance" = $1 WHERE "id" = $2 AND "balance" = $3
//! ```
//!
//! If another transaction changed one of those attributes in the meantime the
//! statement matches no row, and [`OptimisticValidator::check_rowcount`] turns
//! the zero rowcount into [`Error::OptimisticCheck`].

use crate::change_tracker::ChangeTracker;
use crate::identity_map::InstanceId;
use keystone_core::{
    AttributeInfo, Dialect, EntityInfo, Error, OptimisticCheckError, OptimisticOperation,
    PrimaryKey, Result, Value,
};

/// A guarded statement ready to execute.
#[derive(Debug, Clone)]
pub struct GuardedStatement {
    pub sql: String,
    pub params: Vec<Value>,
    /// Attributes whose snapshot is part of the WHERE clause.
    pub guarded: Vec<&'static str>,
}

/// Builds snapshot-guarded statements and interprets their rowcounts.
#[derive(Debug, Clone, Copy)]
pub struct OptimisticValidator {
    dialect: Dialect,
}

impl OptimisticValidator {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    /// Snapshot guards for one instance, in attribute declaration order.
    ///
    /// Only touched, non-volatile, non-key attributes take part.
    pub fn guards(
        &self,
        info: &'static EntityInfo,
        tracker: &ChangeTracker,
        id: InstanceId,
    ) -> Vec<(&'static AttributeInfo, Value)> {
        info.attributes
            .iter()
            .filter(|a| a.is_tracked() && !a.primary_key)
            .filter_map(|a| tracker.snapshot(id, a.name).map(|v| (a, v.clone())))
            .collect()
    }

    /// `UPDATE table SET ... WHERE key AND guards`.
    pub fn update_statement(
        &self,
        info: &'static EntityInfo,
        key: &PrimaryKey,
        assignments: &[(&'static AttributeInfo, Value)],
        guards: &[(&'static AttributeInfo, Value)],
    ) -> GuardedStatement {
        let mut params = Vec::with_capacity(assignments.len() + key.len() + guards.len());
        let sets: Vec<String> = assignments
            .iter()
            .map(|(attr, value)| {
                params.push(value.clone());
                format!(
                    "{} = {}",
                    self.dialect.quote_identifier(attr.column),
                    self.dialect.placeholder(params.len())
                )
            })
            .collect();
        let mut sql = format!(
            "UPDATE {} SET {}",
            self.dialect.quote_identifier(info.table),
            sets.join(", ")
        );
        let guarded = self.push_where(&mut sql, &mut params, info, key, guards);
        GuardedStatement {
            sql,
            params,
            guarded,
        }
    }

    /// `DELETE FROM table WHERE key AND guards`.
    pub fn delete_statement(
        &self,
        info: &'static EntityInfo,
        key: &PrimaryKey,
        guards: &[(&'static AttributeInfo, Value)],
    ) -> GuardedStatement {
        let mut params = Vec::with_capacity(key.len() + guards.len());
        let mut sql = format!("DELETE FROM {}", self.dialect.quote_identifier(info.table));
        let guarded = self.push_where(&mut sql, &mut params, info, key, guards);
        GuardedStatement {
            sql,
            params,
            guarded,
        }
    }

    fn push_where(
        &self,
        sql: &mut String,
        params: &mut Vec<Value>,
        info: &'static EntityInfo,
        key: &PrimaryKey,
        guards: &[(&'static AttributeInfo, Value)],
    ) -> Vec<&'static str> {
        let mut conditions = Vec::with_capacity(key.len() + guards.len());
        for (attr, value) in info.primary_key().zip(key.values()) {
            params.push(value.clone());
            conditions.push(format!(
                "{} = {}",
                self.dialect.quote_identifier(attr.column),
                self.dialect.placeholder(params.len())
            ));
        }
        let mut guarded = Vec::with_capacity(guards.len());
        for (attr, snapshot) in guards {
            let column = self.dialect.quote_identifier(attr.column);
            if snapshot.is_null() {
                conditions.push(format!("{column} IS NULL"));
            } else {
                params.push(snapshot.clone());
                conditions.push(format!(
                    "{column} = {}",
                    self.dialect.placeholder(params.len())
                ));
            }
            guarded.push(attr.name);
        }
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
        guarded
    }

    /// A guarded statement that matched no row means someone else changed it.
    #[allow(clippy::result_large_err)]
    pub fn check_rowcount(
        &self,
        affected: u64,
        info: &'static EntityInfo,
        key: &PrimaryKey,
        operation: OptimisticOperation,
        guarded: &[&'static str],
    ) -> Result<()> {
        if affected > 0 {
            return Ok(());
        }
        tracing::warn!(
            entity = info.name,
            key = %key,
            operation = operation.as_str(),
            "optimistic check failed"
        );
        Err(Error::OptimisticCheck(OptimisticCheckError {
            entity: info.name,
            key: key.to_string(),
            operation,
            attributes: guarded.to_vec(),
        }))
    }
}
