//! Request-scoped sync queue.
//!
//! At most one job per entity per request. The first enqueue captures the
//! pre-edit snapshot; later events for the same entity are absorbed so the
//! snapshot always reflects the state before the request's first change.

use crate::context::SyncContext;
use crate::executor::{SyncOutcome, execute};
use crate::normalize::normalize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{debug, warn};
use treemirror_core::error::SyncError;
use treemirror_core::signals::{SyncCompleted, SyncFailed, SyncInProgress};
use treemirror_core::types::{EntityId, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// Normalize the current tree and keep it as the pre-edit snapshot.
    Snapshot,
    /// Queue without a snapshot; the tree has already been mutated.
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncJob {
    pub entity_id: EntityId,
    pub slug: String,
    pub before: Option<Snapshot>,
}

/// Flat, serializable view of one drained job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub entity_id: EntityId,
    pub slug: String,
    /// `success`, `skipped` or `failed`.
    pub outcome: String,
    /// Write reason, skip kind, or fault message.
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct DrainReport {
    pub outcomes: Vec<(SyncJob, SyncOutcome)>,
}

impl DrainReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_success()).count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, SyncOutcome::Skipped(_)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, SyncOutcome::Failed(_)))
            .count()
    }

    pub fn summaries(&self) -> Vec<JobSummary> {
        self.outcomes
            .iter()
            .map(|(job, outcome)| {
                let (label, reason) = match outcome {
                    SyncOutcome::Success(success) => ("success", success.reason.as_str().to_string()),
                    SyncOutcome::Skipped(skip) => ("skipped", skip.failure().kind.as_str().to_string()),
                    SyncOutcome::Failed(err) => ("failed", err.to_string()),
                };
                JobSummary {
                    entity_id: job.entity_id,
                    slug: job.slug.clone(),
                    outcome: label.to_string(),
                    reason,
                }
            })
            .collect()
    }

    pub fn outcome_for(&self, slug: &str) -> Option<&SyncOutcome> {
        self.outcomes
            .iter()
            .find(|(job, _)| job.slug == slug)
            .map(|(_, outcome)| outcome)
    }
}

#[derive(Debug, Default)]
pub struct SyncQueue {
    jobs: BTreeMap<EntityId, SyncJob>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn contains(&self, entity_id: EntityId) -> bool {
        self.jobs.contains_key(&entity_id)
    }

    pub fn job(&self, entity_id: EntityId) -> Option<&SyncJob> {
        self.jobs.get(&entity_id)
    }

    pub fn remove(&mut self, entity_id: EntityId) -> Option<SyncJob> {
        self.jobs.remove(&entity_id)
    }

    /// Queue a job for `entity_id`. Returns `false` when one is already queued.
    ///
    /// Never touches the mirror. Marks the entity as syncing right away so an
    /// observer can start polling before the drain runs.
    pub fn enqueue(
        &mut self,
        ctx: &SyncContext<'_>,
        entity_id: EntityId,
        capture: Capture,
    ) -> Result<bool, SyncError> {
        if self.jobs.contains_key(&entity_id) {
            debug!(entity_id, "Sync job already queued, event absorbed");
            return Ok(false);
        }

        let slug = ctx
            .entities
            .slug_of(entity_id)?
            .ok_or(SyncError::UnresolvedEntity { entity_id })?;
        let before = match capture {
            Capture::Snapshot => capture_snapshot(ctx, entity_id, &slug),
            Capture::Skip => None,
        };

        ctx.signals.set::<SyncInProgress>(&slug, &true)?;
        debug!(
            entity_id,
            slug = %slug,
            snapshot = before.is_some(),
            "Sync job queued"
        );
        self.jobs.insert(
            entity_id,
            SyncJob {
                entity_id,
                slug,
                before,
            },
        );
        Ok(true)
    }

    /// Run every queued job and empty the queue.
    ///
    /// One job's fault or panic never stops the others. `sync_in_progress` is
    /// cleared for every job regardless of outcome.
    pub fn drain(&mut self, ctx: &SyncContext<'_>) -> DrainReport {
        let jobs = std::mem::take(&mut self.jobs);
        let mut report = DrainReport::default();

        for (_, job) in jobs {
            let outcome = catch_unwind(AssertUnwindSafe(|| execute(ctx, &job)))
                .unwrap_or_else(|payload| {
                    let message = panic_message(payload.as_ref());
                    warn!(slug = %job.slug, panic = %message, "Sync job panicked");
                    SyncOutcome::Failed(SyncError::Panicked(message))
                });

            if let Err(err) = ctx.signals.clear::<SyncInProgress>(&job.slug) {
                warn!(slug = %job.slug, error = %err, "Failed to clear in-progress signal");
            }
            if let Some(failure) = outcome.failure() {
                let recorded = ctx
                    .signals
                    .clear::<SyncCompleted>(&job.slug)
                    .and_then(|()| ctx.signals.set::<SyncFailed>(&job.slug, &failure));
                if let Err(err) = recorded {
                    warn!(slug = %job.slug, error = %err, "Failed to record sync failure");
                }
            }
            report.outcomes.push((job, outcome));
        }

        debug!(
            succeeded = report.succeeded(),
            skipped = report.skipped(),
            failed = report.failed(),
            "Sync queue drained"
        );
        report
    }
}

/// Pre-edit snapshot, absent when the tree is empty or cannot be read.
fn capture_snapshot(ctx: &SyncContext<'_>, entity_id: EntityId, slug: &str) -> Option<Snapshot> {
    let items = match ctx.tree.read_tree(entity_id) {
        Ok(Some(items)) if !items.is_empty() => items,
        Ok(_) => return None,
        Err(err) => {
            warn!(entity_id, slug, error = %err, "Snapshot capture failed, continuing without");
            return None;
        }
    };
    match catch_unwind(AssertUnwindSafe(|| normalize(&items, ctx.filter))) {
        Ok(Ok(snapshot)) => Some(snapshot),
        Ok(Err(err)) => {
            warn!(entity_id, slug, error = %err, "Snapshot capture failed, continuing without");
            None
        }
        Err(payload) => {
            warn!(
                entity_id,
                slug,
                panic = %panic_message(payload.as_ref()),
                "Item filter panicked during snapshot capture"
            );
            None
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
