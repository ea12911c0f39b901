//! In-memory collaborators for embedding the engine without SQLite, and for tests.

use crate::error::StateError;
use crate::nonce;
use crate::ports::{Authorizer, EntityResolver, MirrorStore, TreeStore};
use crate::types::{Capability, EntityId, MirrorEntries, SourceTree};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

fn poisoned() -> StateError {
    StateError::Io(std::io::Error::other("in-memory store lock poisoned"))
}

#[derive(Debug, Clone)]
struct MemoryEntity {
    slug: String,
    name: String,
    items: SourceTree,
}

/// Host-side tree store keyed by entity id.
#[derive(Debug, Default)]
pub struct MemoryTreeStore {
    entities: Mutex<BTreeMap<EntityId, MemoryEntity>>,
}

impl MemoryTreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<EntityId, MemoryEntity>>, StateError> {
        self.entities.lock().map_err(|_| poisoned())
    }

    pub fn insert_entity(
        &self,
        entity_id: EntityId,
        slug: impl Into<String>,
        name: impl Into<String>,
        items: SourceTree,
    ) -> Result<(), StateError> {
        self.lock()?.insert(
            entity_id,
            MemoryEntity {
                slug: slug.into(),
                name: name.into(),
                items,
            },
        );
        Ok(())
    }

    pub fn set_items(&self, entity_id: EntityId, items: SourceTree) -> Result<(), StateError> {
        let mut guard = self.lock()?;
        let entity = guard
            .get_mut(&entity_id)
            .ok_or_else(|| StateError::entity_not_found(entity_id))?;
        entity.items = items;
        Ok(())
    }

    pub fn remove_entity(&self, entity_id: EntityId) -> Result<(), StateError> {
        self.lock()?.remove(&entity_id);
        Ok(())
    }
}

impl TreeStore for MemoryTreeStore {
    fn read_tree(&self, entity_id: EntityId) -> Result<Option<SourceTree>, StateError> {
        Ok(self.lock()?.get(&entity_id).map(|e| e.items.clone()))
    }
}

impl EntityResolver for MemoryTreeStore {
    fn slug_of(&self, entity_id: EntityId) -> Result<Option<String>, StateError> {
        Ok(self.lock()?.get(&entity_id).map(|e| e.slug.clone()))
    }

    fn name_of(&self, entity_id: EntityId) -> Result<Option<String>, StateError> {
        Ok(self.lock()?.get(&entity_id).map(|e| e.name.clone()))
    }

    fn id_of(&self, slug: &str) -> Result<Option<EntityId>, StateError> {
        Ok(self
            .lock()?
            .iter()
            .find(|(_, e)| e.slug == slug)
            .map(|(id, _)| *id))
    }
}

/// Mirror store that starts uninitialized unless built with [`Self::initialized`].
#[derive(Debug, Default)]
pub struct MemoryMirrorStore {
    entries: Mutex<Option<MirrorEntries>>,
}

impl MemoryMirrorStore {
    pub fn uninitialized() -> Self {
        Self::default()
    }

    pub fn initialized() -> Self {
        Self {
            entries: Mutex::new(Some(MirrorEntries::new())),
        }
    }

    /// Current contents, for assertions.
    pub fn snapshot(&self) -> Result<Option<MirrorEntries>, StateError> {
        self.read()
    }
}

impl MirrorStore for MemoryMirrorStore {
    fn read(&self) -> Result<Option<MirrorEntries>, StateError> {
        Ok(self.entries.lock().map_err(|_| poisoned())?.clone())
    }

    fn write(&self, entries: &MirrorEntries) -> Result<(), StateError> {
        *self.entries.lock().map_err(|_| poisoned())? = Some(entries.clone());
        Ok(())
    }
}

/// Authorizer with a fixed capability answer and nonce secret.
#[derive(Debug, Clone)]
pub struct StaticAuthorizer {
    pub allowed: bool,
    pub secret: String,
}

impl StaticAuthorizer {
    pub fn allow_all(secret: impl Into<String>) -> Self {
        Self {
            allowed: true,
            secret: secret.into(),
        }
    }

    pub fn deny_all() -> Self {
        Self {
            allowed: false,
            secret: String::new(),
        }
    }
}

impl Authorizer for StaticAuthorizer {
    fn current_actor_can(&self, _capability: Capability) -> bool {
        self.allowed
    }

    fn verify(&self, token: &str, action: &str) -> bool {
        self.allowed && nonce::verify(&self.secret, action, token)
    }
}
