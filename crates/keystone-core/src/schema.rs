//! Schema registry.
//!
//! The [`Schema`] is the resolved descriptor set a session works against. It
//! validates entity definitions once, answers reverse-relationship questions
//! for cascade planning, and owns the discriminator registry that maps a
//! stored discriminator value to the concrete entity to materialize.

use crate::Result;
use crate::attribute::{AttributeInfo, ReferentialAction};
use crate::entity::EntityInfo;
use crate::error::{Error, SchemaErrorKind};
use crate::row::Row;
use std::collections::HashMap;

/// An attribute on some entity that references another entity.
#[derive(Debug, Clone, Copy)]
pub struct Referrer {
    pub entity: &'static EntityInfo,
    pub attribute: &'static AttributeInfo,
}

/// Builder collecting entity descriptors before validation.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    entities: Vec<&'static EntityInfo>,
}

impl SchemaBuilder {
    #[must_use]
    pub fn entity(mut self, info: &'static EntityInfo) -> Self {
        self.entities.push(info);
        self
    }

    /// Validate the descriptors and build the registry.
    #[allow(clippy::result_large_err)]
    pub fn build(self) -> Result<Schema> {
        let mut entities = HashMap::new();
        for info in &self.entities {
            if entities.insert(info.name, *info).is_some() {
                return Err(invalid(format!("entity {} registered twice", info.name)));
            }
            if info.primary_key().next().is_none() {
                return Err(invalid(format!("entity {} has no primary key", info.name)));
            }
        }

        let mut schema = Schema {
            entities,
            subtypes: HashMap::new(),
            referrers: HashMap::new(),
        };

        for &info in &self.entities {
            schema.check_hierarchy(info)?;
            schema.check_references(info)?;
        }

        for &info in &self.entities {
            let root = schema.root_of(info);
            if let Some(disc) = info.discriminator {
                if schema
                    .subtypes
                    .insert((root.name, disc.value), info)
                    .is_some()
                {
                    return Err(invalid(format!(
                        "discriminator value '{}' used twice under {}",
                        disc.value, root.name
                    )));
                }
            }
            for attribute in info.references() {
                if let Some(reference) = attribute.reference {
                    schema
                        .referrers
                        .entry(reference.target)
                        .or_default()
                        .push(Referrer {
                            entity: info,
                            attribute,
                        });
                }
            }
        }

        tracing::debug!(
            entities = schema.entities.len(),
            polymorphic = schema.subtypes.len(),
            "Schema built"
        );
        Ok(schema)
    }
}

/// Validated set of entity descriptors.
#[derive(Debug)]
pub struct Schema {
    entities: HashMap<&'static str, &'static EntityInfo>,
    /// (root name, discriminator value) -> concrete entity
    subtypes: HashMap<(&'static str, &'static str), &'static EntityInfo>,
    /// target entity name -> attributes referencing it
    referrers: HashMap<&'static str, Vec<Referrer>>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Resolve an entity by name.
    #[allow(clippy::result_large_err)]
    pub fn entity(&self, name: &str) -> Result<&'static EntityInfo> {
        self.entities.get(name).copied().ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::UnknownEntity,
                format!("entity {name} is not registered"),
            )
        })
    }

    /// Resolve a descriptor handed in by application code against this registry.
    #[allow(clippy::result_large_err)]
    pub fn resolve(&self, info: &EntityInfo) -> Result<&'static EntityInfo> {
        self.entity(info.name)
    }

    /// Hierarchy root of `info` (itself when it has no parent).
    pub fn root_of(&self, info: &'static EntityInfo) -> &'static EntityInfo {
        let mut current = info;
        // Bounded so a malformed parent cycle cannot spin forever.
        for _ in 0..=self.entities.len() {
            match current.parent.and_then(|p| self.entities.get(p)) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }

    /// Whether `concrete` is `ancestor` or one of its subtypes.
    pub fn is_a(&self, concrete: &'static EntityInfo, ancestor: &EntityInfo) -> bool {
        let mut current = Some(concrete);
        while let Some(info) = current {
            if info.same_as(ancestor) {
                return true;
            }
            current = info.parent.and_then(|p| self.entities.get(p).copied());
        }
        false
    }

    /// `info` and every registered subtype below it, `info` first.
    pub fn descendants(&self, info: &'static EntityInfo) -> Vec<&'static EntityInfo> {
        let mut out = vec![info];
        let mut others: Vec<_> = self
            .entities
            .values()
            .copied()
            .filter(|e| !e.same_as(info) && self.is_a(e, info))
            .collect();
        others.sort_by_key(|e| e.name);
        out.extend(others);
        out
    }

    /// Columns to select when loading `info` polymorphically.
    ///
    /// Covers every non-lazy attribute of every subtype plus the discriminator,
    /// so any row in the table can be materialized as its concrete type.
    pub fn select_columns(&self, info: &'static EntityInfo) -> Vec<&'static str> {
        let mut columns: Vec<&'static str> = Vec::new();
        for entity in self.descendants(info) {
            for attr in entity.attributes.iter().filter(|a| !a.lazy) {
                if !columns.contains(&attr.column) {
                    columns.push(attr.column);
                }
            }
        }
        if let Some(disc) = self.root_of(info).discriminator {
            if !columns.contains(&disc.column) {
                columns.push(disc.column);
            }
        }
        columns
    }

    /// Discriminator filter restricting a query on `info` to its subtree.
    ///
    /// Returns `None` for non-polymorphic entities and for hierarchy roots.
    pub fn discriminator_filter(
        &self,
        info: &'static EntityInfo,
    ) -> Option<(&'static str, Vec<&'static str>)> {
        if info.is_root() {
            return None;
        }
        let column = self.root_of(info).discriminator?.column;
        let values = self
            .descendants(info)
            .iter()
            .filter_map(|e| e.discriminator.map(|d| d.value))
            .collect();
        Some((column, values))
    }

    /// Pick the concrete entity for a loaded row.
    #[allow(clippy::result_large_err)]
    pub fn resolve_row(&self, requested: &'static EntityInfo, row: &Row) -> Result<&'static EntityInfo> {
        let root = self.root_of(requested);
        let Some(disc) = root.discriminator else {
            return Ok(requested);
        };
        let value = row.require(disc.column)?;
        let Some(text) = value.as_str() else {
            return Err(Error::schema(
                SchemaErrorKind::UnknownDiscriminator,
                format!("discriminator {} holds {}", disc.column, value),
            ));
        };
        self.subtypes
            .get(&(root.name, text))
            .copied()
            .ok_or_else(|| {
                Error::schema(
                    SchemaErrorKind::UnknownDiscriminator,
                    format!("no subtype of {} for discriminator '{}'", root.name, text),
                )
            })
    }

    /// Attributes referencing `info` or any of its ancestors.
    pub fn referrers(&self, info: &'static EntityInfo) -> Vec<Referrer> {
        let mut out = Vec::new();
        let mut current = Some(info);
        while let Some(entity) = current {
            if let Some(list) = self.referrers.get(entity.name) {
                out.extend(list.iter().copied());
            }
            current = entity.parent.and_then(|p| self.entities.get(p).copied());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    #[allow(clippy::result_large_err)]
    fn check_hierarchy(&self, info: &'static EntityInfo) -> Result<()> {
        let Some(parent_name) = info.parent else {
            return Ok(());
        };
        let parent = self.entity(parent_name).map_err(|_| {
            invalid(format!("{} inherits unknown entity {}", info.name, parent_name))
        })?;
        let root = self.root_of(info);
        if root.parent.is_some() || root.same_as(info) {
            return Err(invalid(format!("inheritance cycle through {}", info.name)));
        }
        if info.table != root.table {
            return Err(invalid(format!(
                "{} must share table {} with hierarchy root {}",
                info.name, root.table, root.name
            )));
        }
        match (root.discriminator, info.discriminator) {
            (Some(r), Some(d)) if r.column == d.column => {}
            _ => {
                return Err(invalid(format!(
                    "{} and its root {} need a discriminator on the same column",
                    info.name, root.name
                )));
            }
        }
        for attr in parent.attributes {
            if info.attribute(attr.name).is_none() {
                return Err(invalid(format!(
                    "{} does not declare inherited attribute {}",
                    info.name, attr.name
                )));
            }
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn check_references(&self, info: &'static EntityInfo) -> Result<()> {
        for attr in info.references() {
            let Some(reference) = attr.reference else {
                continue;
            };
            let target = self.entity(reference.target).map_err(|_| {
                invalid(format!(
                    "{}.{} references unknown entity {}",
                    info.name, attr.name, reference.target
                ))
            })?;
            if target.primary_key().count() != 1 {
                return Err(invalid(format!(
                    "{}.{} references {} which has a composite key",
                    info.name, attr.name, target.name
                )));
            }
            if reference.on_delete == ReferentialAction::SetNull && !attr.nullable {
                return Err(invalid(format!(
                    "{}.{} uses SET NULL but is not nullable",
                    info.name, attr.name
                )));
            }
            if attr.primary_key {
                return Err(invalid(format!(
                    "{}.{} cannot be both key and reference",
                    info.name, attr.name
                )));
            }
        }
        Ok(())
    }
}

fn invalid(message: String) -> Error {
    Error::schema(SchemaErrorKind::Invalid, message)
}
