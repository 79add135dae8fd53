//! Entity descriptors.
//!
//! An [`EntityInfo`] is the resolved schema of one persistent type: its table,
//! its ordered attributes and, for polymorphic hierarchies, where it sits in the
//! single-table inheritance tree.
//!
//! ```ignore
//! static EMPLOYEE: EntityInfo = EntityInfo::new("Employee", "employees", EMPLOYEE_ATTRS)
//!     .discriminator("kind", "employee");
//! static MANAGER: EntityInfo = EntityInfo::new("Manager", "employees", MANAGER_ATTRS)
//!     .inherits("Employee")
//!     .discriminator("kind", "manager");
//! ```

use crate::attribute::AttributeInfo;

/// Discriminator column and the value selecting one concrete subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discriminator {
    pub column: &'static str,
    pub value: &'static str,
}

/// Resolved schema of one entity type.
#[derive(Debug, Clone, Copy)]
pub struct EntityInfo {
    /// Entity name, unique within a schema
    pub name: &'static str,
    /// Table holding the rows (the hierarchy root's table for subtypes)
    pub table: &'static str,
    /// All persistent attributes, inherited ones included
    pub attributes: &'static [AttributeInfo],
    /// Parent entity in a single-table hierarchy
    pub parent: Option<&'static str>,
    /// Polymorphic identity of this entity
    pub discriminator: Option<Discriminator>,
}

impl EntityInfo {
    pub const fn new(
        name: &'static str,
        table: &'static str,
        attributes: &'static [AttributeInfo],
    ) -> Self {
        Self {
            name,
            table,
            attributes,
            parent: None,
            discriminator: None,
        }
    }

    /// Declare this entity a subtype of `parent`.
    pub const fn inherits(mut self, parent: &'static str) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Set the discriminator column and this entity's value in it.
    pub const fn discriminator(mut self, column: &'static str, value: &'static str) -> Self {
        self.discriminator = Some(Discriminator { column, value });
        self
    }

    /// Look up an attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&'static AttributeInfo> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Look up an attribute by column name.
    pub fn attribute_by_column(&self, column: &str) -> Option<&'static AttributeInfo> {
        self.attributes.iter().find(|a| a.column == column)
    }

    /// Primary key attributes in declaration order.
    pub fn primary_key(&self) -> impl Iterator<Item = &'static AttributeInfo> {
        self.attributes.iter().filter(|a| a.primary_key)
    }

    pub fn primary_key_columns(&self) -> Vec<&'static str> {
        self.primary_key().map(|a| a.column).collect()
    }

    /// Foreign-key attributes.
    pub fn references(&self) -> impl Iterator<Item = &'static AttributeInfo> {
        self.attributes.iter().filter(|a| a.reference.is_some())
    }

    /// Whether the backend assigns the key on insert.
    pub fn has_generated_key(&self) -> bool {
        let mut pk = self.primary_key();
        matches!((pk.next(), pk.next()), (Some(a), None) if a.auto_increment)
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_polymorphic(&self) -> bool {
        self.discriminator.is_some()
    }

    /// Same entity, compared by name.
    pub fn same_as(&self, other: &EntityInfo) -> bool {
        self.name == other.name
    }
}
