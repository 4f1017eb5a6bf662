//! The entity store the sync layer mirrors into.
//!
//! The sync layer never owns entity data. It drives an [`EntityStore`]
//! supplied by the application (usually a thin adapter over the game's ECS)
//! and only keeps the id correspondence itself.

use crate::error::{SyncError, SyncResult};
use crate::ids::LocalEntityId;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Component payload: component name to component value.
pub type Components = Map<String, Value>;

/// Snapshot of a stored entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRecord {
    pub id: LocalEntityId,
    pub components: Components,
}

/// Storage backend the sync handlers create, update and remove entities in.
///
/// Implementations must be safe to call from several connection loops at
/// once.
pub trait EntityStore: Send + Sync {
    /// Creates an empty entity and returns its id.
    fn create_entity(&self) -> SyncResult<LocalEntityId>;

    fn get_entity(&self, id: LocalEntityId) -> Option<EntityRecord>;

    fn remove_entity(&self, id: LocalEntityId) -> SyncResult<()>;

    /// Applies a component payload to an existing entity.
    fn apply_components(&self, id: LocalEntityId, components: &Components) -> SyncResult<()>;
}

/// A concurrent in-process [`EntityStore`].
///
/// Applying components merges by key: components present in the payload
/// replace the stored value, others are left alone.
#[derive(Debug)]
pub struct InMemoryEntityStore {
    entities: DashMap<LocalEntityId, Components>,
    next_id: AtomicU64,
}

impl Default for InMemoryEntityStore {
    fn default() -> Self {
        Self {
            entities: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Ids of all stored entities, ascending.
    pub fn entity_ids(&self) -> Vec<LocalEntityId> {
        let mut ids: Vec<_> = self.entities.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub fn component(&self, id: LocalEntityId, name: &str) -> Option<Value> {
        self.entities.get(&id)?.get(name).cloned()
    }
}

impl EntityStore for InMemoryEntityStore {
    fn create_entity(&self) -> SyncResult<LocalEntityId> {
        let id = LocalEntityId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entities.insert(id, Components::new());
        trace!("Created entity {}", id);
        Ok(id)
    }

    fn get_entity(&self, id: LocalEntityId) -> Option<EntityRecord> {
        self.entities.get(&id).map(|components| EntityRecord {
            id,
            components: components.clone(),
        })
    }

    fn remove_entity(&self, id: LocalEntityId) -> SyncResult<()> {
        if self.entities.remove(&id).is_none() {
            return Err(SyncError::UnknownEntity(id));
        }
        trace!("Removed entity {}", id);
        Ok(())
    }

    fn apply_components(&self, id: LocalEntityId, components: &Components) -> SyncResult<()> {
        let mut stored = self
            .entities
            .get_mut(&id)
            .ok_or(SyncError::UnknownEntity(id))?;
        for (name, value) in components {
            stored.insert(name.clone(), value.clone());
        }
        Ok(())
    }
}
