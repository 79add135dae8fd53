//! Identity Map pattern for tracking unique object instances per primary key.
//!
//! The Identity Map ensures that each database row corresponds to exactly one
//! instance within a session:
//!
//! - **Uniqueness**: Same (hierarchy root, key) always resolves to the same instance
//! - **Cache**: Avoids redundant queries for instances already loaded
//! - **Consistency**: Changes to an instance are visible through every handle to it
//!
//! # Design
//!
//! Instances live in an arena owned by the map and are addressed by
//! [`InstanceId`]. Identity is keyed on the hierarchy root rather than the
//! concrete entity, so a `Manager` loaded through an `Employee` query and the
//! same row loaded directly as a `Manager` share one slot.
//!
//! A slot is either a *seed* (key only, created when a relationship is followed
//! before its target is loaded) or *materialized*. Promotion from seed to
//! materialized happens in place, so existing ids keep pointing at the same
//! instance.

use keystone_core::error::{ConstraintError, ConstraintErrorKind};
use keystone_core::{EntityInfo, Error, PrimaryKey, Result, Schema, Value};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Arena index of an instance within one session generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(usize);

impl InstanceId {
    pub fn index(self) -> usize {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }
}

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InstanceStatus {
    /// Key-only placeholder, not yet materialized.
    Seed,
    /// Created by application code, pending INSERT.
    New,
    /// Materialized from storage, unchanged.
    Loaded,
    /// Loaded and modified, pending UPDATE.
    Updated,
    /// Pending DELETE.
    Deleted,
}

impl InstanceStatus {
    /// Whether this status carries an unflushed operation.
    pub const fn is_pending(self) -> bool {
        matches!(
            self,
            InstanceStatus::New | InstanceStatus::Updated | InstanceStatus::Deleted
        )
    }
}

/// Identity of a persisted row: hierarchy root plus primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub root: &'static str,
    pub key: PrimaryKey,
}

/// One entity instance tracked by the session.
#[derive(Debug)]
pub struct Instance {
    info: &'static EntityInfo,
    key: Option<PrimaryKey>,
    status: InstanceStatus,
    /// Attribute name -> current value. Absent means not fetched yet.
    values: HashMap<&'static str, Value>,
    /// Reference attribute -> in-session target, kept until the target has a key.
    links: HashMap<&'static str, InstanceId>,
    /// Creation order, used to break ordering ties.
    seq: u64,
}

impl Instance {
    pub fn info(&self) -> &'static EntityInfo {
        self.info
    }

    pub fn key(&self) -> Option<&PrimaryKey> {
        self.key.as_ref()
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_seed(&self) -> bool {
        self.status == InstanceStatus::Seed
    }

    /// Current value of an attribute, `None` if it has not been fetched.
    pub fn value(&self, attribute: &str) -> Option<&Value> {
        self.values.get(attribute)
    }

    pub fn has_value(&self, attribute: &str) -> bool {
        self.values.contains_key(attribute)
    }

    pub fn link(&self, attribute: &str) -> Option<InstanceId> {
        self.links.get(attribute).copied()
    }

    pub(crate) fn links(&self) -> impl Iterator<Item = (&'static str, InstanceId)> + '_ {
        self.links.iter().map(|(a, id)| (*a, *id))
    }

    pub(crate) fn set_value(&mut self, attribute: &'static str, value: Value) {
        self.values.insert(attribute, value);
    }

    pub(crate) fn set_link(&mut self, attribute: &'static str, target: Option<InstanceId>) {
        match target {
            Some(id) => {
                self.links.insert(attribute, id);
            }
            None => {
                self.links.remove(attribute);
            }
        }
    }

    pub(crate) fn set_status(&mut self, status: InstanceStatus) {
        self.status = status;
    }

    /// Human-readable identity for logs and error messages.
    pub fn label(&self) -> String {
        match &self.key {
            Some(key) => format!("{}[{}]", self.info.name, key),
            None => format!("{}[new #{}]", self.info.name, self.seq),
        }
    }
}

/// How [`IdentityMap::register_loaded`] resolved a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// No instance existed; a loaded one was created.
    Created,
    /// A seed was materialized in place.
    Promoted,
    /// A materialized instance already holds this identity; nothing was changed.
    Existing,
}

/// Per-session map from (root, key) to the single live instance.
#[derive(Debug)]
pub struct IdentityMap {
    schema: Arc<Schema>,
    slots: Vec<Option<Instance>>,
    index: HashMap<ObjectKey, InstanceId>,
    next_seq: u64,
}

impl IdentityMap {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            slots: Vec::new(),
            index: HashMap::new(),
            next_seq: 0,
        }
    }

    fn object_key(&self, info: &'static EntityInfo, key: PrimaryKey) -> ObjectKey {
        ObjectKey {
            root: self.schema.root_of(info).name,
            key,
        }
    }

    fn alloc(&mut self, instance: Instance) -> InstanceId {
        let id = InstanceId(self.slots.len());
        self.slots.push(Some(instance));
        id
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn key_values(info: &'static EntityInfo, key: &PrimaryKey) -> HashMap<&'static str, Value> {
        info.primary_key()
            .zip(key.values())
            .map(|(attr, v)| (attr.name, v.clone()))
            .collect()
    }

    /// Find the live instance for `key`, if any.
    pub fn lookup(&self, info: &'static EntityInfo, key: &PrimaryKey) -> Option<InstanceId> {
        self.index.get(&self.object_key(info, key.clone())).copied()
    }

    /// Return the instance for `key`, registering a seed if none exists.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn get_or_create(&mut self, info: &'static EntityInfo, key: PrimaryKey) -> InstanceId {
        if let Some(id) = self.lookup(info, &key) {
            return id;
        }
        let seq = self.next_seq();
        let values = Self::key_values(info, &key);
        let id = self.alloc(Instance {
            info,
            key: Some(key.clone()),
            status: InstanceStatus::Seed,
            values,
            links: HashMap::new(),
            seq,
        });
        let object_key = self.object_key(info, key);
        self.index.insert(object_key, id);
        id
    }

    /// Record a row read from storage.
    ///
    /// A seed holding the same identity is promoted in place. A materialized
    /// instance is left untouched so the caller can decide how to merge.
    #[tracing::instrument(level = "trace", skip(self, values))]
    pub fn register_loaded(
        &mut self,
        info: &'static EntityInfo,
        key: PrimaryKey,
        values: HashMap<&'static str, Value>,
    ) -> (InstanceId, Registration) {
        if let Some(id) = self.lookup(info, &key) {
            if let Some(instance) = self.get_mut(id) {
                if !instance.is_seed() {
                    return (id, Registration::Existing);
                }
                instance.info = info;
                instance.values.extend(values);
                instance.status = InstanceStatus::Loaded;
            }
            return (id, Registration::Promoted);
        }
        let seq = self.next_seq();
        let mut all = Self::key_values(info, &key);
        all.extend(values);
        let id = self.alloc(Instance {
            info,
            key: Some(key.clone()),
            status: InstanceStatus::Loaded,
            values: all,
            links: HashMap::new(),
            seq,
        });
        let object_key = self.object_key(info, key);
        self.index.insert(object_key, id);
        (id, Registration::Created)
    }

    /// Register an instance created by application code.
    ///
    /// Callers check for a live duplicate first; an explicit key is indexed
    /// right away, a generated one is indexed later by [`assign_key`](Self::assign_key).
    pub fn insert_new(
        &mut self,
        info: &'static EntityInfo,
        key: Option<PrimaryKey>,
        values: HashMap<&'static str, Value>,
    ) -> InstanceId {
        let seq = self.next_seq();
        let id = self.alloc(Instance {
            info,
            key: key.clone(),
            status: InstanceStatus::New,
            values,
            links: HashMap::new(),
            seq,
        });
        if let Some(key) = key {
            let object_key = self.object_key(info, key);
            self.index.insert(object_key, id);
        }
        id
    }

    /// Give a new instance the key the backend generated for it.
    #[allow(clippy::result_large_err)]
    pub fn assign_key(&mut self, id: InstanceId, key: PrimaryKey) -> Result<()> {
        let Some(info) = self.get(id).map(Instance::info) else {
            return Ok(());
        };
        let object_key = self.object_key(info, key.clone());
        if let Some(existing) = self.index.get(&object_key) {
            if *existing != id {
                return Err(Error::Constraint(ConstraintError {
                    kind: ConstraintErrorKind::DuplicateKey,
                    entity: info.name,
                    message: format!("key {} is already held by another instance", key),
                }));
            }
        }
        let pk_values = Self::key_values(info, &key);
        if let Some(instance) = self.get_mut(id) {
            instance.values.extend(pk_values);
            instance.key = Some(key);
        }
        self.index.insert(object_key, id);
        Ok(())
    }

    /// Deregister an instance whose delete has been flushed.
    pub fn remove(&mut self, id: InstanceId) -> Option<Instance> {
        let instance = self.slots.get_mut(id.0)?.take()?;
        if let Some(key) = instance.key.clone() {
            let object_key = self.object_key(instance.info, key);
            if self.index.get(&object_key) == Some(&id) {
                self.index.remove(&object_key);
            }
        }
        Some(instance)
    }

    pub fn get(&self, id: InstanceId) -> Option<&Instance> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, id: InstanceId) -> Option<&mut Instance> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Whether `id` was allocated in this generation (even if since removed).
    pub fn was_allocated(&self, id: InstanceId) -> bool {
        id.0 < self.slots.len()
    }

    /// Live instances in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (InstanceId, &Instance)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|inst| (InstanceId(i), inst)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every instance. Ids from before the clear must not be reused.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
    }
}
