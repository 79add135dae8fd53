//! In-memory relational backend for integration tests.
//!
//! `MemoryDb` executes the statement subset keystone generates (plain
//! INSERT/SELECT/UPDATE/DELETE with `$n` placeholders and AND-joined
//! predicates). It enforces NOT NULL, primary-key uniqueness and foreign-key
//! existence (deletes are RESTRICT), keeps a per-connection undo log so
//! ROLLBACK works, honors `FOR UPDATE` row locks, and can sever, cancel or
//! stall a statement on demand.
#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use asupersync::CancelReason;
use asupersync::runtime::{Runtime, RuntimeBuilder};
use keystone::prelude::*;
use keystone_core::{ConnectionError, ConnectionErrorKind, QueryError, QueryErrorKind};
use regex::Regex;

// ============================================================================
// Test Schema
// ============================================================================

pub static ACCOUNT_ATTRS: &[AttributeInfo] = &[
    AttributeInfo::new("id").primary_key(true).auto_increment(true),
    AttributeInfo::new("owner"),
    AttributeInfo::new("balance"),
    AttributeInfo::new("seen_at").nullable(true).volatile(true),
];
pub static ACCOUNT: EntityInfo = EntityInfo::new("Account", "accounts", ACCOUNT_ATTRS);

pub static AUTHOR_ATTRS: &[AttributeInfo] = &[
    AttributeInfo::new("id").primary_key(true).auto_increment(true),
    AttributeInfo::new("name"),
    AttributeInfo::new("bio").nullable(true).lazy(true),
];
pub static AUTHOR: EntityInfo = EntityInfo::new("Author", "authors", AUTHOR_ATTRS);

pub static BOOK_ATTRS: &[AttributeInfo] = &[
    AttributeInfo::new("id").primary_key(true).auto_increment(true),
    AttributeInfo::new("title"),
    AttributeInfo::new("author").column("author_id").references("Author", ReferentialAction::Cascade),
];
pub static BOOK: EntityInfo = EntityInfo::new("Book", "books", BOOK_ATTRS);

/// Required and not cascading: blocks deleting its book.
pub static REVIEW_ATTRS: &[AttributeInfo] = &[
    AttributeInfo::new("id").primary_key(true).auto_increment(true),
    AttributeInfo::new("body"),
    AttributeInfo::new("book").column("book_id").references("Book", ReferentialAction::NoAction),
];
pub static REVIEW: EntityInfo = EntityInfo::new("Review", "reviews", REVIEW_ATTRS);

/// Nullable: cleared when its book goes away.
pub static STICKER_ATTRS: &[AttributeInfo] = &[
    AttributeInfo::new("id").primary_key(true).auto_increment(true),
    AttributeInfo::new("label"),
    AttributeInfo::new("book")
        .column("book_id")
        .nullable(true)
        .references("Book", ReferentialAction::NoAction),
];
pub static STICKER: EntityInfo = EntityInfo::new("Sticker", "stickers", STICKER_ATTRS);

pub static COUNTRY_ATTRS: &[AttributeInfo] = &[
    AttributeInfo::new("id").primary_key(true).auto_increment(true),
    AttributeInfo::new("name"),
    AttributeInfo::new("capital")
        .column("capital_id")
        .nullable(true)
        .references("City", ReferentialAction::SetNull),
];
pub static COUNTRY: EntityInfo = EntityInfo::new("Country", "countries", COUNTRY_ATTRS);

pub static CITY_ATTRS: &[AttributeInfo] = &[
    AttributeInfo::new("id").primary_key(true).auto_increment(true),
    AttributeInfo::new("name"),
    AttributeInfo::new("country").column("country_id").references("Country", ReferentialAction::Cascade),
];
pub static CITY: EntityInfo = EntityInfo::new("City", "cities", CITY_ATTRS);

pub static LEFT_ATTRS: &[AttributeInfo] = &[
    AttributeInfo::new("id").primary_key(true).auto_increment(true),
    AttributeInfo::new("right").column("right_id").references("Right", ReferentialAction::NoAction),
];
pub static LEFT: EntityInfo = EntityInfo::new("Left", "lefts", LEFT_ATTRS);

pub static RIGHT_ATTRS: &[AttributeInfo] = &[
    AttributeInfo::new("id").primary_key(true).auto_increment(true),
    AttributeInfo::new("left").column("left_id").references("Left", ReferentialAction::NoAction),
];
pub static RIGHT: EntityInfo = EntityInfo::new("Right", "rights", RIGHT_ATTRS);

pub static EMPLOYEE_ATTRS: &[AttributeInfo] = &[
    AttributeInfo::new("id").primary_key(true).auto_increment(true),
    AttributeInfo::new("name"),
];
pub static EMPLOYEE: EntityInfo =
    EntityInfo::new("Employee", "employees", EMPLOYEE_ATTRS).discriminator("kind", "employee");

pub static MANAGER_ATTRS: &[AttributeInfo] = &[
    AttributeInfo::new("id").primary_key(true).auto_increment(true),
    AttributeInfo::new("name"),
    AttributeInfo::new("budget").nullable(true),
];
pub static MANAGER: EntityInfo = EntityInfo::new("Manager", "employees", MANAGER_ATTRS)
    .inherits("Employee")
    .discriminator("kind", "manager");

pub static ENGINEER_ATTRS: &[AttributeInfo] = &[
    AttributeInfo::new("id").primary_key(true).auto_increment(true),
    AttributeInfo::new("name"),
    AttributeInfo::new("language").nullable(true),
];
pub static ENGINEER: EntityInfo = EntityInfo::new("Engineer", "employees", ENGINEER_ATTRS)
    .inherits("Employee")
    .discriminator("kind", "engineer");

pub static ENTITIES: &[&EntityInfo] = &[
    &ACCOUNT, &AUTHOR, &BOOK, &REVIEW, &STICKER, &COUNTRY, &CITY, &LEFT, &RIGHT, &EMPLOYEE,
    &MANAGER, &ENGINEER,
];

pub fn schema() -> Arc<Schema> {
    let mut builder = Schema::builder();
    for entity in ENTITIES.iter().copied() {
        builder = builder.entity(entity);
    }
    Arc::new(builder.build().expect("valid test schema"))
}

// ============================================================================
// Harness
// ============================================================================

pub fn runtime() -> Runtime {
    RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime")
}

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

pub fn pool(db: &MemoryDb) -> Arc<Pool<MemoryConnector>> {
    Arc::new(Pool::new(
        db.connector(),
        PoolConfig::new(8).max_idle(4).test_on_checkout(true),
    ))
}

pub fn builder(db: &MemoryDb) -> SessionBuilder<MemoryConnector> {
    SessionBuilder::new(pool(db), schema())
}

pub fn session(db: &MemoryDb) -> Session<MemoryConnector> {
    builder(db).build()
}

// ============================================================================
// MemoryDb
// ============================================================================

type Record = HashMap<&'static str, Value>;

#[derive(Debug, Clone)]
struct Column {
    name: &'static str,
    not_null: bool,
    /// Referenced table and its key column.
    references: Option<(&'static str, &'static str)>,
}

#[derive(Debug)]
struct Table {
    columns: Vec<Column>,
    key: &'static str,
    generated: bool,
    next_id: i64,
    rows: Vec<Record>,
}

impl Table {
    fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn position(&self, key: &Value) -> Option<usize> {
        self.rows
            .iter()
            .position(|r| r.get(self.key).is_some_and(|v| same(v, key)))
    }
}

#[derive(Debug)]
enum Undo {
    Inserted { table: &'static str, key: Value },
    Updated { table: &'static str, key: Value, old: Record },
    Deleted { table: &'static str, record: Record },
}

#[derive(Debug, Default)]
struct DbState {
    tables: HashMap<&'static str, Table>,
    /// Statements that reached a live connection, in arrival order.
    log: Vec<String>,
    undo: HashMap<u64, Vec<Undo>>,
    /// (table, key) -> connection holding the row lock.
    locks: HashMap<(&'static str, String), u64>,
    dead: HashSet<u64>,
    /// One-shot: sever the connection that sends the next statement with this prefix.
    sever: Option<String>,
    /// One-shot: answer the next statement with this prefix as cancelled, unexecuted.
    cancel: Option<String>,
    /// One-shot: execute the next statement with this prefix, then stay pending for one poll.
    stall: Option<String>,
    next_conn: u64,
}

/// Shared in-memory database. Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryDb {
    state: Arc<Mutex<DbState>>,
}

struct Reply {
    rows: Vec<Row>,
    affected: u64,
    key: i64,
}

impl Reply {
    fn count(affected: u64) -> Self {
        Self {
            rows: Vec::new(),
            affected,
            key: 0,
        }
    }
}

impl MemoryDb {
    /// Create tables for `entities`; subtypes share their root's table.
    pub fn new(entities: &[&'static EntityInfo]) -> Self {
        let mut tables: HashMap<&'static str, Table> = HashMap::new();
        let lookup = |name: &str| entities.iter().find(|e| e.name == name).copied();

        let mut ordered: Vec<&'static EntityInfo> = entities.to_vec();
        ordered.sort_by_key(|e| e.parent.is_some());
        for info in ordered {
            let root = info.parent.is_none();
            let table = tables.entry(info.table).or_insert_with(|| {
                let key = info.primary_key().next().expect("entity has a key");
                Table {
                    columns: Vec::new(),
                    key: key.column,
                    generated: key.auto_increment,
                    next_id: 1,
                    rows: Vec::new(),
                }
            });
            for attr in info.attributes {
                if table.column(attr.column).is_some() {
                    continue;
                }
                let references = attr.reference.and_then(|r| lookup(r.target)).map(|target| {
                    let key = target.primary_key().next().expect("target has a key");
                    (target.table, key.column)
                });
                table.columns.push(Column {
                    name: attr.column,
                    not_null: root && !attr.nullable && !attr.primary_key,
                    references,
                });
            }
            if let Some(disc) = info.discriminator {
                if table.column(disc.column).is_none() {
                    table.columns.push(Column {
                        name: disc.column,
                        not_null: true,
                        references: None,
                    });
                }
            }
        }

        Self {
            state: Arc::new(Mutex::new(DbState {
                tables,
                ..DbState::default()
            })),
        }
    }

    /// Database with every test entity.
    pub fn standard() -> Self {
        let entities: Vec<&'static EntityInfo> = ENTITIES.iter().copied().collect();
        Self::new(&entities)
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { db: self.clone() }
    }

    fn lock(&self) -> MutexGuard<'_, DbState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a committed row directly, returning its key.
    pub fn seed(&self, table: &str, values: &[(&str, Value)]) -> i64 {
        let columns: Vec<String> = values.iter().map(|(c, _)| format!("\"{c}\"")).collect();
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("${i}")).collect();
        let sql = format!(
            "INSERT INTO \"{table}\" ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );
        let params: Vec<Value> = values.iter().map(|(_, v)| v.clone()).collect();
        let mut state = self.lock();
        let reply = state.run(u64::MAX, &sql, &params).expect("seed row");
        state.undo.remove(&u64::MAX);
        reply.key
    }

    /// Committed value of one column, if the row exists.
    pub fn value(&self, table: &str, key: i64, column: &str) -> Option<Value> {
        let state = self.lock();
        let table = state.tables.get(table)?;
        let index = table.position(&Value::BigInt(key))?;
        Some(table.rows[index].get(column).cloned().unwrap_or(Value::Null))
    }

    pub fn exists(&self, table: &str, key: i64) -> bool {
        let state = self.lock();
        state
            .tables
            .get(table)
            .and_then(|t| t.position(&Value::BigInt(key)))
            .is_some()
    }

    pub fn count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Statements received so far.
    pub fn statements(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// Received statements starting with `prefix`.
    pub fn statements_starting(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .log
            .iter()
            .filter(|s| s.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Sever the connection that sends the next statement starting with `prefix`.
    pub fn sever_on(&self, prefix: &str) {
        self.lock().sever = Some(prefix.to_string());
    }

    /// Report the next statement starting with `prefix` as cancelled.
    pub fn cancel_on(&self, prefix: &str) {
        self.lock().cancel = Some(prefix.to_string());
    }

    /// Make the next statement starting with `prefix` yield once before replying.
    pub fn stall_on(&self, prefix: &str) {
        self.lock().stall = Some(prefix.to_string());
    }

    /// Connections opened so far.
    pub fn opened(&self) -> u64 {
        self.lock().next_conn
    }

    fn open(&self) -> MemoryConnection {
        let mut state = self.lock();
        state.next_conn += 1;
        MemoryConnection {
            id: state.next_conn,
            db: self.clone(),
        }
    }

    fn execute(&self, conn: u64, sql: &str, params: &[Value]) -> Result<Reply> {
        let mut state = self.lock();
        if state.dead.contains(&conn) {
            return Err(disconnected(conn));
        }
        if state.sever.as_deref().is_some_and(|p| sql.starts_with(p)) {
            state.sever = None;
            state.kill(conn);
            return Err(disconnected(conn));
        }
        state.log.push(sql.to_string());
        state.run(conn, sql, params)
    }

    /// Run `sql` for a connection entry point, applying any armed fault.
    fn respond<T>(
        &self,
        conn: u64,
        sql: &str,
        params: &[Value],
        pick: fn(Reply) -> T,
    ) -> (Stall, Outcome<T, Error>) {
        let (cancel, stall) = {
            let mut state = self.lock();
            let cancel = state.cancel.as_deref().is_some_and(|p| sql.starts_with(p));
            if cancel {
                state.cancel = None;
            }
            let stall = state.stall.as_deref().is_some_and(|p| sql.starts_with(p));
            if stall {
                state.stall = None;
            }
            (cancel, stall)
        };
        if cancel {
            return (
                Stall(false),
                Outcome::Cancelled(CancelReason::user("statement cancelled")),
            );
        }
        let outcome = match self.execute(conn, sql, params) {
            Ok(reply) => Outcome::Ok(pick(reply)),
            Err(e) => Outcome::Err(e),
        };
        (Stall(stall), outcome)
    }

    fn is_alive(&self, conn: u64) -> bool {
        !self.lock().dead.contains(&conn)
    }
}

impl DbState {
    fn kill(&mut self, conn: u64) {
        self.dead.insert(conn);
        self.rollback(conn);
    }

    fn rollback(&mut self, conn: u64) {
        let undo = self.undo.remove(&conn).unwrap_or_default();
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::Inserted { table, key } => {
                    if let Some(t) = self.tables.get_mut(table) {
                        if let Some(i) = t.position(&key) {
                            t.rows.remove(i);
                        }
                    }
                }
                Undo::Updated { table, key, old } => {
                    if let Some(t) = self.tables.get_mut(table) {
                        if let Some(i) = t.position(&key) {
                            t.rows[i] = old;
                        }
                    }
                }
                Undo::Deleted { table, record } => {
                    if let Some(t) = self.tables.get_mut(table) {
                        t.rows.push(record);
                    }
                }
            }
        }
        self.locks.retain(|_, holder| *holder != conn);
    }

    fn run(&mut self, conn: u64, sql: &str, params: &[Value]) -> Result<Reply> {
        let verb = sql.split_whitespace().next().unwrap_or_default();
        match verb {
            "BEGIN" | "SET" | "CREATE" | "ALTER" | "DROP" => Ok(Reply::count(0)),
            "COMMIT" => {
                self.undo.remove(&conn);
                self.locks.retain(|_, holder| *holder != conn);
                Ok(Reply::count(0))
            }
            "ROLLBACK" => {
                self.rollback(conn);
                Ok(Reply::count(0))
            }
            "INSERT" => self.insert(conn, sql, params),
            "SELECT" => self.select(conn, sql, params),
            "UPDATE" => self.update(conn, sql, params),
            "DELETE" => self.delete(conn, sql, params),
            _ => Err(syntax(sql, "unsupported statement")),
        }
    }

    fn table(&self, sql: &str, name: &str) -> Result<&'static str> {
        self.tables
            .keys()
            .find(|t| **t == name)
            .copied()
            .ok_or_else(|| syntax(sql, &format!("no such table {name}")))
    }

    fn insert(&mut self, conn: u64, sql: &str, params: &[Value]) -> Result<Reply> {
        let re = Regex::new(r#"^INSERT INTO "(\w+)" \(([^)]*)\) VALUES \(([^)]*)\)$"#)
            .expect("valid regex");
        let caps = re
            .captures(sql)
            .ok_or_else(|| syntax(sql, "malformed INSERT"))?;
        let name = self.table(sql, &caps[1])?;
        let columns = quoted_names(&caps[2]);
        let values = placeholders(sql, &caps[3], params)?;

        let table = self.tables.get(name).ok_or_else(|| syntax(sql, "no table"))?;
        let mut record: Record = table.columns.iter().map(|c| (c.name, Value::Null)).collect();
        record.insert(table.key, Value::Null);
        for (column, value) in columns.iter().zip(values) {
            let Some(key) = record.keys().find(|k| **k == column.as_str()).copied() else {
                return Err(syntax(sql, &format!("no such column {column}")));
            };
            record.insert(key, value);
        }

        let key_column = table.key;
        let mut key = record.get(key_column).cloned().unwrap_or(Value::Null);
        if key.is_null() {
            if !table.generated {
                return Err(violation(sql, "23502", &format!("{key_column} may not be NULL")));
            }
            key = Value::BigInt(table.next_id);
            record.insert(key_column, key.clone());
        }
        if table.position(&key).is_some() {
            return Err(violation(sql, "23505", &format!("duplicate key {key} in {name}")));
        }
        self.check_row(sql, name, &record)?;

        let generated = key.as_i64().unwrap_or(0);
        if let Some(table) = self.tables.get_mut(name) {
            table.next_id = table.next_id.max(generated + 1);
            table.rows.push(record);
        }
        self.undo
            .entry(conn)
            .or_default()
            .push(Undo::Inserted { table: name, key });
        Ok(Reply {
            rows: Vec::new(),
            affected: 1,
            key: generated,
        })
    }

    fn select(&mut self, conn: u64, sql: &str, params: &[Value]) -> Result<Reply> {
        let re = Regex::new(
            r#"^SELECT (.+?) FROM "(\w+)"(?: WHERE (.+?))?( FOR UPDATE( NOWAIT)?)?$"#,
        )
        .expect("valid regex");
        let caps = re
            .captures(sql)
            .ok_or_else(|| syntax(sql, "malformed SELECT"))?;
        let name = self.table(sql, &caps[2])?;
        let columns = quoted_names(&caps[1]);
        let conditions = match caps.get(3) {
            Some(m) => parse_conditions(sql, m.as_str(), params)?,
            None => Vec::new(),
        };
        let locking = caps.get(4).is_some();
        let nowait = caps.get(5).is_some();

        let table = self.tables.get(name).ok_or_else(|| syntax(sql, "no table"))?;
        let matched: Vec<&Record> = table
            .rows
            .iter()
            .filter(|r| conditions.iter().all(|c| c.matches(r)))
            .collect();

        if locking {
            let keys: Vec<String> = matched
                .iter()
                .map(|r| lock_key(r.get(table.key).unwrap_or(&Value::Null)))
                .collect();
            for key in &keys {
                if let Some(holder) = self.locks.get(&(name, key.clone())) {
                    if *holder != conn {
                        let message = if nowait {
                            "could not obtain lock on row"
                        } else {
                            "row is locked by another transaction"
                        };
                        return Err(Error::Query(QueryError {
                            kind: QueryErrorKind::LockNotAvailable,
                            sql: Some(sql.to_string()),
                            sqlstate: Some("55P03".to_string()),
                            message: message.to_string(),
                            source: None,
                        }));
                    }
                }
            }
            for key in keys {
                self.locks.insert((name, key), conn);
            }
        }

        let table = self.tables.get(name).ok_or_else(|| syntax(sql, "no table"))?;
        let names: Vec<String> = columns.clone();
        let rows = table
            .rows
            .iter()
            .filter(|r| conditions.iter().all(|c| c.matches(r)))
            .map(|r| {
                let values = names
                    .iter()
                    .map(|c| r.get(c.as_str()).cloned().unwrap_or(Value::Null))
                    .collect();
                Row::new(names.clone(), values)
            })
            .collect();
        Ok(Reply {
            rows,
            affected: 0,
            key: 0,
        })
    }

    fn update(&mut self, conn: u64, sql: &str, params: &[Value]) -> Result<Reply> {
        let re = Regex::new(r#"^UPDATE "(\w+)" SET (.+?)(?: WHERE (.+))?$"#).expect("valid regex");
        let caps = re
            .captures(sql)
            .ok_or_else(|| syntax(sql, "malformed UPDATE"))?;
        let name = self.table(sql, &caps[1])?;
        let assignment = Regex::new(r#"^"(\w+)" = (NULL|\$(\d+))$"#).expect("valid regex");
        let mut sets = Vec::new();
        for part in caps[2].split(", ") {
            let a = assignment
                .captures(part)
                .ok_or_else(|| syntax(sql, "malformed assignment"))?;
            let value = match a.get(3) {
                Some(n) => param(sql, n.as_str(), params)?,
                None => Value::Null,
            };
            sets.push((a[1].to_string(), value));
        }
        let conditions = match caps.get(3) {
            Some(m) => parse_conditions(sql, m.as_str(), params)?,
            None => Vec::new(),
        };

        let table = self.tables.get(name).ok_or_else(|| syntax(sql, "no table"))?;
        let key_column = table.key;
        let mut changes = Vec::new();
        for record in table.rows.iter().filter(|r| conditions.iter().all(|c| c.matches(r))) {
            let mut updated = record.clone();
            for (column, value) in &sets {
                let Some(col) = table.column(column) else {
                    return Err(syntax(sql, &format!("no such column {column}")));
                };
                updated.insert(col.name, value.clone());
            }
            changes.push((record.clone(), updated));
        }
        for (_, updated) in &changes {
            self.check_row(sql, name, updated)?;
        }

        let affected = changes.len() as u64;
        for (old, updated) in changes {
            let key = old.get(key_column).cloned().unwrap_or(Value::Null);
            if let Some(table) = self.tables.get_mut(name) {
                if let Some(i) = table.position(&key) {
                    table.rows[i] = updated;
                }
            }
            self.undo
                .entry(conn)
                .or_default()
                .push(Undo::Updated { table: name, key, old });
        }
        Ok(Reply::count(affected))
    }

    fn delete(&mut self, conn: u64, sql: &str, params: &[Value]) -> Result<Reply> {
        let re = Regex::new(r#"^DELETE FROM "(\w+)"(?: WHERE (.+))?$"#).expect("valid regex");
        let caps = re
            .captures(sql)
            .ok_or_else(|| syntax(sql, "malformed DELETE"))?;
        let name = self.table(sql, &caps[1])?;
        let conditions = match caps.get(2) {
            Some(m) => parse_conditions(sql, m.as_str(), params)?,
            None => Vec::new(),
        };

        let table = self.tables.get(name).ok_or_else(|| syntax(sql, "no table"))?;
        let key_column = table.key;
        let doomed: Vec<Value> = table
            .rows
            .iter()
            .filter(|r| conditions.iter().all(|c| c.matches(r)))
            .map(|r| r.get(key_column).cloned().unwrap_or(Value::Null))
            .collect();

        for key in &doomed {
            for (other_name, other) in &self.tables {
                for column in other.columns.iter().filter(|c| c.references.map(|r| r.0) == Some(name)) {
                    let referenced = other.rows.iter().any(|r| {
                        r.get(column.name).is_some_and(|v| same(v, key))
                            && !(*other_name == name && doomed.iter().any(|d| {
                                r.get(key_column).is_some_and(|k| same(k, d))
                            }))
                    });
                    if referenced {
                        return Err(violation(
                            sql,
                            "23503",
                            &format!("{name} {key} is still referenced from {other_name}.{}", column.name),
                        ));
                    }
                }
            }
        }

        for key in &doomed {
            if let Some(table) = self.tables.get_mut(name) {
                if let Some(i) = table.position(key) {
                    let record = table.rows.remove(i);
                    self.undo
                        .entry(conn)
                        .or_default()
                        .push(Undo::Deleted { table: name, record });
                }
            }
        }
        Ok(Reply::count(doomed.len() as u64))
    }

    /// NOT NULL and foreign-key checks for a row about to be stored.
    fn check_row(&self, sql: &str, name: &'static str, record: &Record) -> Result<()> {
        let Some(table) = self.tables.get(name) else {
            return Ok(());
        };
        for column in &table.columns {
            let value = record.get(column.name).unwrap_or(&Value::Null);
            if value.is_null() {
                if column.not_null {
                    return Err(violation(
                        sql,
                        "23502",
                        &format!("{name}.{} may not be NULL", column.name),
                    ));
                }
                continue;
            }
            if let Some((target, target_key)) = column.references {
                let found = self.tables.get(target).is_some_and(|t| {
                    t.rows
                        .iter()
                        .any(|r| r.get(target_key).is_some_and(|k| same(k, value)))
                });
                if !found {
                    return Err(violation(
                        sql,
                        "23503",
                        &format!("{name}.{} references missing {target} {value}", column.name),
                    ));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Predicates
// ============================================================================

#[derive(Debug)]
enum Condition {
    Compare { column: String, op: String, value: Value },
    IsNull { column: String, negated: bool },
    In { column: String, values: Vec<Value> },
    Constant(bool),
}

impl Condition {
    fn matches(&self, record: &Record) -> bool {
        let get = |column: &str| record.get(column).cloned().unwrap_or(Value::Null);
        match self {
            Condition::Compare { column, op, value } => {
                let stored = get(column);
                if stored.is_null() || value.is_null() {
                    return false;
                }
                let ordering = compare(&stored, value);
                match op.as_str() {
                    "=" => ordering == Some(Ordering::Equal),
                    "<>" => ordering.is_some_and(|o| o != Ordering::Equal),
                    "<" => ordering == Some(Ordering::Less),
                    "<=" => ordering.is_some_and(|o| o != Ordering::Greater),
                    ">" => ordering == Some(Ordering::Greater),
                    ">=" => ordering.is_some_and(|o| o != Ordering::Less),
                    _ => false,
                }
            }
            Condition::IsNull { column, negated } => get(column).is_null() != *negated,
            Condition::In { column, values } => {
                let stored = get(column);
                values.iter().any(|v| same(&stored, v))
            }
            Condition::Constant(b) => *b,
        }
    }
}

fn parse_conditions(sql: &str, clause: &str, params: &[Value]) -> Result<Vec<Condition>> {
    let compare = Regex::new(r#"^"(\w+)" (=|<>|<=|>=|<|>) \$(\d+)$"#).expect("valid regex");
    let is_null = Regex::new(r#"^"(\w+)" IS (NOT )?NULL$"#).expect("valid regex");
    let in_list = Regex::new(r#"^"(\w+)" IN \(([^)]*)\)$"#).expect("valid regex");

    let mut out = Vec::new();
    for part in clause.split(" AND ") {
        let part = match part.strip_prefix('(') {
            Some(inner) => inner.strip_suffix(')').unwrap_or(inner),
            None => part,
        };
        if let Some(c) = compare.captures(part) {
            out.push(Condition::Compare {
                column: c[1].to_string(),
                op: c[2].to_string(),
                value: param(sql, &c[3], params)?,
            });
        } else if let Some(c) = is_null.captures(part) {
            out.push(Condition::IsNull {
                column: c[1].to_string(),
                negated: c.get(2).is_some(),
            });
        } else if let Some(c) = in_list.captures(part) {
            out.push(Condition::In {
                column: c[1].to_string(),
                values: placeholders(sql, &c[2], params)?,
            });
        } else if part == "1 = 1" {
            out.push(Condition::Constant(true));
        } else if part == "1 = 0" {
            out.push(Condition::Constant(false));
        } else {
            return Err(syntax(sql, &format!("unsupported condition {part}")));
        }
    }
    Ok(out)
}

fn quoted_names(list: &str) -> Vec<String> {
    let re = Regex::new(r#""(\w+)""#).expect("valid regex");
    re.captures_iter(list).map(|c| c[1].to_string()).collect()
}

fn placeholders(sql: &str, list: &str, params: &[Value]) -> Result<Vec<Value>> {
    let re = Regex::new(r"\$(\d+)").expect("valid regex");
    re.captures_iter(list)
        .map(|c| param(sql, &c[1], params))
        .collect()
}

fn param(sql: &str, index: &str, params: &[Value]) -> Result<Value> {
    index
        .parse::<usize>()
        .ok()
        .and_then(|i| params.get(i.checked_sub(1)?))
        .cloned()
        .ok_or_else(|| syntax(sql, &format!("missing parameter ${index}")))
}

fn same(a: &Value, b: &Value) -> bool {
    a.clone().normalized() == b.clone().normalized()
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => Some(x.cmp(&y)),
        _ => match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => Some(x.cmp(y)),
            _ => same(a, b).then_some(Ordering::Equal),
        },
    }
}

fn lock_key(value: &Value) -> String {
    format!("{:?}", value.clone().normalized())
}

fn disconnected(conn: u64) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Disconnected,
        message: format!("connection {conn} was severed"),
        source: None,
    })
}

fn violation(sql: &str, sqlstate: &str, message: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Constraint,
        sql: Some(sql.to_string()),
        sqlstate: Some(sqlstate.to_string()),
        message: message.to_string(),
        source: None,
    })
}

fn syntax(sql: &str, message: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Syntax,
        sql: Some(sql.to_string()),
        sqlstate: Some("42601".to_string()),
        message: message.to_string(),
        source: None,
    })
}

// ============================================================================
// Connection
// ============================================================================

/// Pending for one poll when set, ready afterwards.
pub struct Stall(bool);

impl Future for Stall {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0 {
            self.0 = false;
            cx.waker().wake_by_ref();
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    db: MemoryDb,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Connection for MemoryConnection {
    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let (stall, outcome) = self.db.respond(self.id, sql, params, |r| r.rows);
        async move {
            stall.await;
            outcome
        }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let (stall, outcome) = self.db.respond(self.id, sql, params, |r| r.affected);
        async move {
            stall.await;
            outcome
        }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let (stall, outcome) = self.db.respond(self.id, sql, params, |r| r.key);
        async move {
            stall.await;
            outcome
        }
    }

    fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = if self.db.is_alive(self.id) {
            Outcome::Ok(())
        } else {
            Outcome::Err(disconnected(self.id))
        };
        async move { outcome }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        // A closed connection takes its open transaction with it.
        let mut state = self.db.lock();
        if !state.dead.contains(&self.id) {
            state.rollback(self.id);
        }
    }
}

pub struct MemoryConnector {
    db: MemoryDb,
}

impl Connector for MemoryConnector {
    type Conn = MemoryConnection;

    fn connect(&self, _cx: &Cx) -> impl Future<Output = Outcome<MemoryConnection, Error>> + Send {
        let conn = self.db.open();
        async move { Outcome::Ok(conn) }
    }
}
