//! Error types for keystone operations.

use std::fmt;

/// The primary error type for all keystone operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, refused, disconnected)
    Connection(ConnectionError),
    /// Query execution errors reported by the backend
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Pool errors
    Pool(PoolError),
    /// Schema descriptor errors
    Schema(SchemaError),
    /// Validation errors
    Validation(ValidationError),
    /// Key lookup returned no row
    ObjectNotFound(NotFoundError),
    /// Unique lookup returned more than one row
    MultipleObjectsFound(MultipleFoundError),
    /// A snapshot guard did not match the stored row
    OptimisticCheck(OptimisticCheckError),
    /// Unbreakable foreign-key cycle between pending inserts
    CyclicDependency(CycleError),
    /// Relational constraint enforced by the session itself
    Constraint(ConstraintError),
    /// The connection dropped after a write was sent
    ConnectionLost(ConnectionLostError),
    /// Operation outside an active session or with incompatible scope options
    SessionScope(ScopeError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection refused
    Refused,
    /// Connection pool exhausted
    PoolExhausted,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Row lock could not be granted without waiting (NOWAIT)
    LockNotAvailable,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Pool exhausted (no available connections)
    Exhausted,
    /// Pool is closed
    Closed,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Entity is not registered
    UnknownEntity,
    /// Attribute is not declared on the entity
    UnknownAttribute,
    /// Discriminator value has no registered subtype
    UnknownDiscriminator,
    /// Descriptor is inconsistent
    Invalid,
}

/// Validation error for attribute-level checks.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The errors grouped by attribute name
    pub errors: Vec<FieldValidationError>,
}

/// A single validation error for an attribute.
#[derive(Debug, Clone)]
pub struct FieldValidationError {
    /// The attribute name that failed validation
    pub field: String,
    /// The kind of validation that failed
    pub kind: ValidationErrorKind,
    /// Human-readable error message
    pub message: String,
}

/// The type of validation constraint that was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Required attribute is missing or null
    Required,
    /// Attribute is not declared on the entity
    Unknown,
    /// Attribute may not be written (primary key, discriminator)
    ReadOnly,
    /// Custom validation failed
    Custom,
}

impl ValidationError {
    /// Create a new empty validation error container.
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Check if there are any validation errors.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add a field validation error.
    pub fn add(
        &mut self,
        field: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(FieldValidationError {
            field: field.into(),
            kind,
            message: message.into(),
        });
    }

    /// Add a required attribute error.
    pub fn add_required(&mut self, field: impl Into<String>) {
        self.add(
            field,
            ValidationErrorKind::Required,
            "is required".to_string(),
        );
    }

    /// Add an unknown attribute error.
    pub fn add_unknown(&mut self, field: impl Into<String>, entity: &str) {
        self.add(
            field,
            ValidationErrorKind::Unknown,
            format!("is not an attribute of {entity}"),
        );
    }

    /// Add a read-only attribute error.
    pub fn add_read_only(&mut self, field: impl Into<String>) {
        self.add(
            field,
            ValidationErrorKind::ReadOnly,
            "cannot be modified".to_string(),
        );
    }

    /// Add a custom validation error.
    pub fn add_custom(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.add(field, ValidationErrorKind::Custom, message);
    }

    /// Convert to Result, returning Ok(()) if no errors, Err(self) otherwise.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl Default for ValidationError {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct NotFoundError {
    pub entity: &'static str,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct MultipleFoundError {
    pub entity: &'static str,
    pub count: usize,
}

/// Which statement a snapshot guard protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimisticOperation {
    Update,
    Delete,
    /// A re-read returned values that differ from the session's snapshot.
    Read,
}

impl OptimisticOperation {
    pub const fn as_str(self) -> &'static str {
        match self {
            OptimisticOperation::Update => "UPDATE",
            OptimisticOperation::Delete => "DELETE",
            OptimisticOperation::Read => "READ",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptimisticCheckError {
    pub entity: &'static str,
    pub key: String,
    pub operation: OptimisticOperation,
    /// Attributes whose stored value diverged, when known.
    pub attributes: Vec<&'static str>,
}

#[derive(Debug, Clone)]
pub struct CycleError {
    /// Instances on the cycle, first element repeated at the end.
    pub path: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ConstraintError {
    pub kind: ConstraintErrorKind,
    pub entity: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintErrorKind {
    /// Delete blocked by a required relation without cascade
    CascadeBlocked,
    /// A live instance already holds this key
    DuplicateKey,
}

#[derive(Debug)]
pub struct ConnectionLostError {
    pub message: String,
    pub sql: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone)]
pub struct ScopeError {
    pub kind: ScopeErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeErrorKind {
    /// No active session
    Inactive,
    /// Session has been closed
    Closed,
    /// Nested scope requested a stricter isolation level
    IsolationEscalation,
    /// Nested scope requested schema mutation the outer scope does not allow
    SchemaMutation,
    /// A flush or commit was interrupted; rollback is required
    Aborted,
    /// Handle belongs to a previous session generation
    StaleHandle,
    /// Handle refers to a deleted instance
    InstanceDeleted,
}

impl ScopeError {
    pub fn new(kind: ScopeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Optimistic conflicts are retryable by re-running the whole unit of work.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization
            ),
            Error::Pool(p) => matches!(p.kind, PoolErrorKind::Exhausted),
            Error::Connection(c) => matches!(c.kind, ConnectionErrorKind::PoolExhausted),
            Error::OptimisticCheck(_) => true,
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Connect
                    | ConnectionErrorKind::Disconnected
                    | ConnectionErrorKind::Refused
            ),
            Error::ConnectionLost(_) => true,
            _ => false,
        }
    }

    /// Does surfacing this error from a flush leave the transaction unusable?
    pub fn requires_rollback(&self) -> bool {
        !matches!(
            self,
            Error::ObjectNotFound(_) | Error::MultipleObjectsFound(_) | Error::SessionScope(_)
        )
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::ConnectionLost(c) => c.sql.as_deref(),
            _ => None,
        }
    }

    pub fn scope(kind: ScopeErrorKind, message: impl Into<String>) -> Self {
        Error::SessionScope(ScopeError::new(kind, message))
    }

    pub fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError {
            kind,
            message: message.into(),
        })
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::ObjectNotFound(e) => write!(f, "{}[{}] not found", e.entity, e.key),
            Error::MultipleObjectsFound(e) => write!(
                f,
                "multiple {} objects found ({} rows) where one was expected",
                e.entity, e.count
            ),
            Error::OptimisticCheck(e) => {
                write!(
                    f,
                    "Optimistic check failed on {} of {}[{}]",
                    e.operation.as_str(),
                    e.entity,
                    e.key
                )?;
                if !e.attributes.is_empty() {
                    write!(f, " (attributes: {})", e.attributes.join(", "))?;
                }
                Ok(())
            }
            Error::CyclicDependency(e) => {
                write!(f, "Cyclic dependency between pending inserts: {}", e.path.join(" -> "))
            }
            Error::Constraint(e) => write!(f, "Constraint error on {}: {}", e.entity, e.message),
            Error::ConnectionLost(e) => write!(
                f,
                "Connection lost after writes were sent, transaction outcome unknown: {}",
                e.message
            ),
            Error::SessionScope(e) => write!(f, "Session scope error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::ConnectionLost(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "validation passed")
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(f, "validation error on '{}': {}", err.field, err.message)
        } else {
            writeln!(f, "validation errors:")?;
            for err in &self.errors {
                writeln!(f, "  - {}: {}", err.field, err.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<ScopeError> for Error {
    fn from(err: ScopeError) -> Self {
        Error::SessionScope(err)
    }
}

impl From<ConstraintError> for Error {
    fn from(err: ConstraintError) -> Self {
        Error::Constraint(err)
    }
}

impl From<CycleError> for Error {
    fn from(err: CycleError) -> Self {
        Error::CyclicDependency(err)
    }
}

/// Result type alias for keystone operations.
pub type Result<T> = std::result::Result<T, Error>;
