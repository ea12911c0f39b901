//! Collaborator boundaries the sync engine depends on.
//!
//! The host owns the source tree and authorization; a sibling subsystem owns
//! the mirror. SQLite-backed adapters live in `treemirror-state`, in-memory
//! ones in [`crate::memory`].

use crate::error::StateError;
use crate::types::{Capability, EntityId, MirrorEntries, SourceTree};

pub trait TreeStore {
    /// Current items of the entity in menu order, `None` if the entity is unknown.
    fn read_tree(&self, entity_id: EntityId) -> Result<Option<SourceTree>, StateError>;
}

pub trait MirrorStore {
    /// Whole mirror mapping, or `None` when the mirror has never been initialized.
    fn read(&self) -> Result<Option<MirrorEntries>, StateError>;

    /// Replace the whole mirror mapping.
    fn write(&self, entries: &MirrorEntries) -> Result<(), StateError>;
}

pub trait Authorizer {
    fn current_actor_can(&self, capability: Capability) -> bool;

    /// Validate a request-origin token (CSRF nonce) for `action`.
    fn verify(&self, token: &str, action: &str) -> bool;
}

pub trait EntityResolver {
    fn slug_of(&self, entity_id: EntityId) -> Result<Option<String>, StateError>;
    fn name_of(&self, entity_id: EntityId) -> Result<Option<String>, StateError>;
    /// Reverse lookup used by slug-addressed endpoints.
    fn id_of(&self, slug: &str) -> Result<Option<EntityId>, StateError>;
}
