//! Write trigger: one session per host request.
//!
//! The host feeds every tree event of the request into [`SyncSession::handle`]
//! and calls [`SyncSession::finish`] once at end of request. Public-facing
//! requests and actors without the capability are gated out entirely.

use crate::context::SyncContext;
use crate::deletion::{DeletionOutcome, propagate_deletion};
use crate::queue::{Capture, DrainReport, SyncQueue};
use tracing::debug;
use treemirror_core::error::SyncError;
use treemirror_core::types::{Capability, RequestOrigin, TreeEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// Request is not allowed to sync; nothing happened.
    Gated,
    Queued,
    /// A job for the entity already exists this request.
    Absorbed,
    Deleted(DeletionOutcome),
}

pub struct SyncSession<'a> {
    ctx: SyncContext<'a>,
    origin: RequestOrigin,
    queue: SyncQueue,
}

impl<'a> SyncSession<'a> {
    pub fn new(ctx: SyncContext<'a>, origin: RequestOrigin) -> Self {
        Self {
            ctx,
            origin,
            queue: SyncQueue::new(),
        }
    }

    pub fn context(&self) -> &SyncContext<'a> {
        &self.ctx
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn is_gated(&self) -> bool {
        !self.origin.may_sync() || !self.ctx.authorizer.current_actor_can(Capability::ManageMenus)
    }

    pub fn handle(&mut self, event: TreeEvent) -> Result<Handled, SyncError> {
        if self.is_gated() {
            debug!(entity_id = event.entity_id(), origin = ?self.origin, "Tree event ignored, request not allowed to sync");
            return Ok(Handled::Gated);
        }

        let (entity_id, capture) = match event {
            TreeEvent::Created(id) | TreeEvent::Changed(id) => (id, Capture::Snapshot),
            TreeEvent::ItemChanged(id, _) | TreeEvent::ItemDeleted(id, _) => (id, Capture::Skip),
            TreeEvent::Deleting(id, metadata) => {
                self.queue.remove(id);
                let outcome = propagate_deletion(&self.ctx, id, &metadata)?;
                return Ok(Handled::Deleted(outcome));
            }
        };

        if self.queue.enqueue(&self.ctx, entity_id, capture)? {
            Ok(Handled::Queued)
        } else {
            Ok(Handled::Absorbed)
        }
    }

    /// End-of-request drain. Consumes the session so it runs exactly once.
    pub fn finish(mut self) -> DrainReport {
        if self.is_gated() {
            return DrainReport::default();
        }
        self.queue.drain(&self.ctx)
    }
}
