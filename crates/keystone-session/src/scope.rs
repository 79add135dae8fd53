//! Reentrant unit-of-work scopes.
//!
//! `Session::begin` pushes a frame, `commit`/`rollback` pop one. Only the
//! outermost frame decides the transaction's isolation level and whether
//! schema mutation is allowed; nested frames may not ask for more.

use keystone_core::{Error, IsolationLevel, Result, ScopeErrorKind};

/// Options for one `begin`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeOptions {
    /// Isolation level; `None` uses the session default.
    pub isolation: Option<IsolationLevel>,
    /// Permit `execute_schema` inside this scope.
    pub allow_schema_mutation: bool,
    /// Log statements at info level for the duration of this scope.
    pub sql_debug: Option<bool>,
    /// Retry budget. Retrying a unit of work is up to the caller.
    pub retry: u32,
    /// Start the transaction eagerly. Transactions always start on first statement.
    pub immediate: bool,
}

impl ScopeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    pub fn allow_schema_mutation(mut self, allow: bool) -> Self {
        self.allow_schema_mutation = allow;
        self
    }

    pub fn sql_debug(mut self, enabled: bool) -> Self {
        self.sql_debug = Some(enabled);
        self
    }

    pub fn retry(mut self, attempts: u32) -> Self {
        self.retry = attempts;
        self
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    isolation: IsolationLevel,
    allow_schema_mutation: bool,
    /// Statement-logging setting to put back when this frame exits.
    restore_sql_debug: Option<bool>,
}

/// What the session has to apply after entering a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeEntry {
    /// Nesting depth after the push (1 for the outermost scope).
    pub depth: usize,
    pub isolation: IsolationLevel,
    pub sql_debug: Option<bool>,
}

/// Stack of active scopes for one session.
#[derive(Debug, Default)]
pub struct ScopeStack {
    frames: Vec<Frame>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a scope, rejecting nested requests the outer scope cannot honor.
    ///
    /// `default_isolation` applies to an outermost scope that names none;
    /// `current_sql_debug` is remembered so [`exit`](Self::exit) can restore it.
    #[allow(clippy::result_large_err)]
    pub fn enter(
        &mut self,
        options: &ScopeOptions,
        default_isolation: IsolationLevel,
        current_sql_debug: bool,
    ) -> Result<ScopeEntry> {
        if options.retry > 0 || options.immediate {
            tracing::debug!(
                retry = options.retry,
                immediate = options.immediate,
                "scope options accepted but not acted on"
            );
        }

        let frame = match self.frames.last() {
            None => Frame {
                isolation: options.isolation.unwrap_or(default_isolation),
                allow_schema_mutation: options.allow_schema_mutation,
                restore_sql_debug: options.sql_debug.map(|_| current_sql_debug),
            },
            Some(outer) => {
                if let Some(requested) = options.isolation {
                    if requested.is_stricter_than(outer.isolation) {
                        return Err(Error::scope(
                            ScopeErrorKind::IsolationEscalation,
                            format!(
                                "nested scope requested {} inside a {} transaction",
                                requested.as_sql(),
                                outer.isolation.as_sql()
                            ),
                        ));
                    }
                }
                if options.allow_schema_mutation && !outer.allow_schema_mutation {
                    return Err(Error::scope(
                        ScopeErrorKind::SchemaMutation,
                        "nested scope requested schema mutation the outer scope does not allow",
                    ));
                }
                Frame {
                    isolation: outer.isolation,
                    allow_schema_mutation: outer.allow_schema_mutation,
                    restore_sql_debug: options.sql_debug.map(|_| current_sql_debug),
                }
            }
        };

        self.frames.push(frame);
        Ok(ScopeEntry {
            depth: self.frames.len(),
            isolation: frame.isolation,
            sql_debug: options.sql_debug,
        })
    }

    /// Pop the innermost scope; returns the statement-logging setting to restore.
    pub fn exit(&mut self) -> Option<bool> {
        self.frames.pop().and_then(|f| f.restore_sql_debug)
    }

    /// Pop every scope; returns the setting in force before the first override.
    pub fn clear(&mut self) -> Option<bool> {
        let restore = self.frames.iter().find_map(|f| f.restore_sql_debug);
        self.frames.clear();
        restore
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Isolation of the outermost scope.
    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.frames.first().map(|f| f.isolation)
    }

    pub fn allows_schema_mutation(&self) -> bool {
        self.frames.last().is_some_and(|f| f.allow_schema_mutation)
    }
}
