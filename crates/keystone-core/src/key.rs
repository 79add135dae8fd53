//! Primary key values.

use crate::value::{Value, hash_values};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A simple or composite primary key.
///
/// Integer components are widened on construction so a key built from an
/// `i32` literal matches one read back from the backend as `BIGINT`.
#[derive(Debug, Clone)]
pub struct PrimaryKey(Vec<Value>);

impl PrimaryKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values.into_iter().map(Value::normalized).collect())
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The single component of a simple key.
    pub fn single(&self) -> Option<&Value> {
        match self.0.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    /// A key with a NULL component is not a usable identity.
    pub fn is_complete(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|v| !v.is_null())
    }
}

impl PartialEq for PrimaryKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for PrimaryKey {}

impl Hash for PrimaryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(hash_values(&self.0));
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        Ok(())
    }
}

impl From<Value> for PrimaryKey {
    fn from(v: Value) -> Self {
        Self::new(vec![v])
    }
}

impl From<Vec<Value>> for PrimaryKey {
    fn from(v: Vec<Value>) -> Self {
        Self::new(v)
    }
}

impl From<i64> for PrimaryKey {
    fn from(v: i64) -> Self {
        Self::new(vec![Value::BigInt(v)])
    }
}

impl From<i32> for PrimaryKey {
    fn from(v: i32) -> Self {
        Self::new(vec![Value::Int(v)])
    }
}

impl From<&str> for PrimaryKey {
    fn from(v: &str) -> Self {
        Self::new(vec![Value::from(v)])
    }
}
