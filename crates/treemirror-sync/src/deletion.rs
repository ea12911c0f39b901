//! Synchronous mirror cleanup when a source entity is about to be deleted.
//!
//! Runs from the host's pre-delete hook, while the slug is still known, and
//! bypasses the queue.

use crate::context::SyncContext;
use crate::keys::resolve_key;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use treemirror_core::error::SyncError;
use treemirror_core::types::{Capability, EntityId, EntityMetadata};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeletionOutcome {
    Removed { storage_key: String },
    NotFound,
    MirrorUnavailable,
    Unauthorized,
}

pub fn propagate_deletion(
    ctx: &SyncContext<'_>,
    entity_id: EntityId,
    metadata: &EntityMetadata,
) -> Result<DeletionOutcome, SyncError> {
    if !ctx.authorizer.current_actor_can(Capability::ManageMenus) {
        debug!(entity_id, slug = %metadata.slug, "Deletion not propagated, actor lacks capability");
        return Ok(DeletionOutcome::Unauthorized);
    }

    let Some(mut entries) = ctx.mirror.read()? else {
        debug!(entity_id, slug = %metadata.slug, "Mirror not initialized, nothing to remove");
        return Ok(DeletionOutcome::MirrorUnavailable);
    };

    // A declared-key match can land on an entry stored under another live
    // entity's slug (`a_b` declared by `a-b`). That entry is left alone.
    let resolved = resolve_key(&entries, &metadata.slug).map(|r| r.storage_key.to_string());
    let storage_key = match resolved {
        Some(key) if key != metadata.slug && owned_by_other(ctx, &key, entity_id)? => {
            warn!(
                entity_id,
                slug = %metadata.slug,
                storage_key = %key,
                "Mirror entry belongs to another entity, not removed"
            );
            None
        }
        other => other,
    };
    let outcome = match storage_key {
        Some(storage_key) => {
            entries.remove(&storage_key);
            ctx.mirror.write(&entries)?;
            info!(
                entity_id,
                slug = %metadata.slug,
                storage_key = %storage_key,
                "Mirror entry removed for deleted entity"
            );
            DeletionOutcome::Removed { storage_key }
        }
        None => {
            debug!(entity_id, slug = %metadata.slug, "No mirror entry for deleted entity");
            DeletionOutcome::NotFound
        }
    };

    ctx.signals.clear_all(&metadata.slug)?;
    Ok(outcome)
}

fn owned_by_other(
    ctx: &SyncContext<'_>,
    storage_key: &str,
    entity_id: EntityId,
) -> Result<bool, SyncError> {
    Ok(ctx
        .entities
        .id_of(storage_key)?
        .is_some_and(|owner| owner != entity_id))
}
