//! Type and instance registries.
//!
//! Both are plain maps behind `parking_lot` locks. Locks are held only for a
//! lookup or a mutation, never across an await.

use super::{CharacterAgentInstance, CharacterAgentType, TypeDescriptor};
use crate::error::{Result, RuntimeError, SnapshotError};
use crate::id::{InstanceId, TypeId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Registered character types, keyed by id.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: RwLock<BTreeMap<TypeId, Arc<CharacterAgentType>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a type. Never calls the backend.
    pub fn register(&self, descriptor: TypeDescriptor) -> Result<TypeId> {
        let id = descriptor.id().clone();
        if self.types.read().contains_key(&id) {
            return Err(RuntimeError::TypeConflict {
                type_id: id,
                reason: "a type with this id is already registered".to_string(),
            });
        }

        let agent_type = Arc::new(descriptor.build()?);

        let mut types = self.types.write();
        if types.contains_key(&id) {
            return Err(RuntimeError::TypeConflict {
                type_id: id,
                reason: "a type with this id is already registered".to_string(),
            });
        }
        debug!(
            type_id = %id,
            provenance = ?agent_type.provenance(),
            properties = agent_type.schema().len(),
            "Registered character type"
        );
        types.insert(id.clone(), agent_type);
        Ok(id)
    }

    pub fn get(&self, id: &TypeId) -> Result<Arc<CharacterAgentType>> {
        self.types
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownType(id.clone()))
    }

    pub fn contains(&self, id: &TypeId) -> bool {
        self.types.read().contains_key(id)
    }

    /// All registered types, ordered by id.
    pub fn list(&self) -> Vec<Arc<CharacterAgentType>> {
        self.types.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Live character instances, keyed by id.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: RwLock<HashMap<InstanceId, Arc<CharacterAgentInstance>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, instance: CharacterAgentInstance) -> Arc<CharacterAgentInstance> {
        let instance = Arc::new(instance);
        log_registered(&instance);
        self.instances
            .write()
            .insert(instance.id(), instance.clone());
        instance
    }

    /// Insert a batch, but only into an empty registry. The emptiness check
    /// and the inserts happen under one write lock, so nothing can slip in
    /// between them.
    pub(crate) fn insert_all_if_empty(
        &self,
        batch: impl IntoIterator<Item = CharacterAgentInstance>,
    ) -> Result<usize> {
        let mut instances = self.instances.write();
        if !instances.is_empty() {
            return Err(SnapshotError::SessionNotEmpty(instances.len()).into());
        }
        for instance in batch {
            let instance = Arc::new(instance);
            log_registered(&instance);
            instances.insert(instance.id(), instance);
        }
        Ok(instances.len())
    }

    pub fn get(&self, id: InstanceId) -> Result<Arc<CharacterAgentInstance>> {
        self.instances
            .read()
            .get(&id)
            .cloned()
            .ok_or(RuntimeError::UnknownInstance(id))
    }

    /// Oldest instance with the given display name.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<CharacterAgentInstance>> {
        self.instances
            .read()
            .values()
            .filter(|i| i.name() == name)
            .min_by_key(|i| (i.created_at(), i.id()))
            .cloned()
    }

    /// Every instance with the given display name, oldest first.
    pub fn find_all_by_name(&self, name: &str) -> Vec<Arc<CharacterAgentInstance>> {
        let mut found: Vec<_> = self
            .instances
            .read()
            .values()
            .filter(|i| i.name() == name)
            .cloned()
            .collect();
        found.sort_by_key(|i| (i.created_at(), i.id()));
        found
    }

    /// All instances, oldest first.
    pub fn list(&self) -> Vec<Arc<CharacterAgentInstance>> {
        let mut all: Vec<_> = self.instances.read().values().cloned().collect();
        all.sort_by_key(|i| (i.created_at(), i.id()));
        all
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn log_registered(instance: &CharacterAgentInstance) {
    debug!(
        instance = %instance.id(),
        name = instance.name(),
        type_id = %instance.agent_type().id(),
        "Registered character instance"
    );
}
