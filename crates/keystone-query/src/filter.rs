//! Predicates over entity attributes.
//!
//! A [`Filter`] names attributes, never columns; the translator maps them to
//! columns when it compiles a statement. Two filters with the same structure
//! but different values share a [`shape_hash`](Filter::shape_hash), which is
//! what the compilation cache keys on.

use keystone_core::{Dialect, EntityInfo, Error, Result, SchemaErrorKind, Value};
use std::hash::{Hash, Hasher};

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub const fn as_sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// A boolean predicate over one entity's attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every row.
    All,
    /// `attribute <op> value`
    Compare {
        attribute: String,
        op: CompareOp,
        value: Value,
    },
    /// `attribute IS [NOT] NULL`
    IsNull { attribute: String, negated: bool },
    /// `attribute IN (values...)`
    In { attribute: String, values: Vec<Value> },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn all() -> Self {
        Filter::All
    }

    pub fn eq(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Eq, value)
    }

    pub fn ne(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Ne, value)
    }

    pub fn lt(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Lt, value)
    }

    pub fn le(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Le, value)
    }

    pub fn gt(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Gt, value)
    }

    pub fn ge(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Ge, value)
    }

    pub fn compare(attribute: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Filter::Compare {
            attribute: attribute.into(),
            op,
            value: value.into(),
        }
    }

    pub fn is_null(attribute: impl Into<String>) -> Self {
        Filter::IsNull {
            attribute: attribute.into(),
            negated: false,
        }
    }

    pub fn is_not_null(attribute: impl Into<String>) -> Self {
        Filter::IsNull {
            attribute: attribute.into(),
            negated: true,
        }
    }

    pub fn in_list(attribute: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In {
            attribute: attribute.into(),
            values,
        }
    }

    /// Conjunction with `other`, flattening nested conjunctions and dropping `All`.
    #[must_use]
    pub fn and(self, other: Filter) -> Self {
        let mut parts = Vec::new();
        for f in [self, other] {
            match f {
                Filter::All => {}
                Filter::And(inner) => parts.extend(inner),
                f => parts.push(f),
            }
        }
        match parts.len() {
            0 => Filter::All,
            1 => parts.pop().unwrap_or(Filter::All),
            _ => Filter::And(parts),
        }
    }

    #[must_use]
    pub fn or(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, _) | (_, Filter::All) => Filter::All,
            (Filter::Or(mut left), Filter::Or(right)) => {
                left.extend(right);
                Filter::Or(left)
            }
            (Filter::Or(mut left), f) => {
                left.push(f);
                Filter::Or(left)
            }
            (f, other) => Filter::Or(vec![f, other]),
        }
    }

    #[must_use]
    pub fn not(self) -> Self {
        Filter::Not(Box::new(self))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Filter::All)
    }

    /// Hash of the structure only; values do not participate.
    ///
    /// NULL-ness of compared values does, since `= NULL` renders as `IS NULL`.
    pub fn shape_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash_shape(&mut hasher);
        hasher.finish()
    }

    pub(crate) fn hash_shape<H: Hasher>(&self, h: &mut H) {
        match self {
            Filter::All => 0u8.hash(h),
            Filter::Compare {
                attribute, op, value,
            } => {
                1u8.hash(h);
                attribute.hash(h);
                op.hash(h);
                value.is_null().hash(h);
            }
            Filter::IsNull { attribute, negated } => {
                2u8.hash(h);
                attribute.hash(h);
                negated.hash(h);
            }
            Filter::In { attribute, values } => {
                3u8.hash(h);
                attribute.hash(h);
                values.len().hash(h);
            }
            Filter::And(parts) => {
                4u8.hash(h);
                parts.len().hash(h);
                for p in parts {
                    p.hash_shape(h);
                }
            }
            Filter::Or(parts) => {
                5u8.hash(h);
                parts.len().hash(h);
                for p in parts {
                    p.hash_shape(h);
                }
            }
            Filter::Not(inner) => {
                6u8.hash(h);
                inner.hash_shape(h);
            }
        }
    }

    /// Append bound parameters in the order [`render`](Filter::render) emits placeholders.
    pub fn bind(&self, out: &mut Vec<Value>) {
        match self {
            Filter::All | Filter::IsNull { .. } => {}
            Filter::Compare { op, value, .. } => {
                if !(value.is_null() && matches!(op, CompareOp::Eq | CompareOp::Ne)) {
                    out.push(value.clone());
                }
            }
            Filter::In { values, .. } => out.extend(values.iter().cloned()),
            Filter::And(parts) | Filter::Or(parts) => {
                for p in parts {
                    p.bind(out);
                }
            }
            Filter::Not(inner) => inner.bind(out),
        }
    }

    /// Render as SQL against `entity`, numbering placeholders from `*next`.
    #[allow(clippy::result_large_err)]
    pub fn render(
        &self,
        entity: &EntityInfo,
        dialect: Dialect,
        next: &mut usize,
        out: &mut String,
    ) -> Result<()> {
        match self {
            Filter::All => out.push_str("1 = 1"),
            Filter::Compare {
                attribute,
                op,
                value,
            } => {
                let column = quoted_column(entity, attribute, dialect)?;
                match (op, value.is_null()) {
                    (CompareOp::Eq, true) => out.push_str(&format!("{column} IS NULL")),
                    (CompareOp::Ne, true) => out.push_str(&format!("{column} IS NOT NULL")),
                    _ => {
                        out.push_str(&format!(
                            "{column} {} {}",
                            op.as_sql(),
                            dialect.placeholder(*next)
                        ));
                        *next += 1;
                    }
                }
            }
            Filter::IsNull { attribute, negated } => {
                let column = quoted_column(entity, attribute, dialect)?;
                let not = if *negated { "NOT " } else { "" };
                out.push_str(&format!("{column} IS {not}NULL"));
            }
            Filter::In { attribute, values } => {
                let column = quoted_column(entity, attribute, dialect)?;
                if values.is_empty() {
                    out.push_str("1 = 0");
                } else {
                    let placeholders: Vec<String> = (0..values.len())
                        .map(|i| dialect.placeholder(*next + i))
                        .collect();
                    *next += values.len();
                    out.push_str(&format!("{column} IN ({})", placeholders.join(", ")));
                }
            }
            Filter::And(parts) => render_joined(parts, " AND ", entity, dialect, next, out)?,
            Filter::Or(parts) => render_joined(parts, " OR ", entity, dialect, next, out)?,
            Filter::Not(inner) => {
                out.push_str("NOT (");
                inner.render(entity, dialect, next, out)?;
                out.push(')');
            }
        }
        Ok(())
    }
}

#[allow(clippy::result_large_err)]
fn render_joined(
    parts: &[Filter],
    separator: &str,
    entity: &EntityInfo,
    dialect: Dialect,
    next: &mut usize,
    out: &mut String,
) -> Result<()> {
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push_str(separator);
        }
        let wrap = matches!(part, Filter::And(_) | Filter::Or(_)) && parts.len() > 1;
        if wrap {
            out.push('(');
        }
        part.render(entity, dialect, next, out)?;
        if wrap {
            out.push(')');
        }
    }
    Ok(())
}

#[allow(clippy::result_large_err)]
fn quoted_column(entity: &EntityInfo, attribute: &str, dialect: Dialect) -> Result<String> {
    let attr = entity.attribute(attribute).ok_or_else(|| {
        Error::schema(
            SchemaErrorKind::UnknownAttribute,
            format!("{} has no attribute {}", entity.name, attribute),
        )
    })?;
    Ok(dialect.quote_identifier(attr.column))
}
