//! Core types and traits for keystone.
//!
//! This crate provides the foundations the session engine is built on:
//!
//! - `Value`, `Row` and `PrimaryKey` for data flowing to and from the backend
//! - `EntityInfo` / `AttributeInfo` descriptors and the validated `Schema`
//! - `Connection` trait, the SQL-execution collaborator
//! - `Error` taxonomy shared by every crate in the workspace
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod attribute;
pub mod connection;
pub mod entity;
pub mod error;
pub mod key;
pub mod row;
pub mod schema;
pub mod value;

pub use attribute::{AttributeInfo, Reference, ReferentialAction};
pub use connection::{Connection, Dialect, ErrorClass, IsolationLevel, classify_error};
pub use entity::{Discriminator, EntityInfo};
pub use error::{
    ConnectionError, ConnectionErrorKind, ConnectionLostError, ConstraintError,
    ConstraintErrorKind, CycleError, Error, FieldValidationError, MultipleFoundError,
    NotFoundError, OptimisticCheckError, OptimisticOperation, PoolError, PoolErrorKind,
    QueryError, QueryErrorKind, Result, SchemaError, SchemaErrorKind, ScopeError,
    ScopeErrorKind, TypeError, ValidationError, ValidationErrorKind,
};
pub use key::PrimaryKey;
pub use row::{ColumnInfo, Row};
pub use schema::{Referrer, Schema, SchemaBuilder};
pub use value::{Value, hash_values};
