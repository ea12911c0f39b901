use crate::context::SyncContext;
use crate::detector::{DetectInput, Verdict, WriteReason, detect};
use crate::keys::{resolve_key, sanitize_key};
use crate::normalize::normalize;
use crate::queue::SyncJob;
use tracing::{info, warn};
use treemirror_core::error::{StateError, SyncError};
use treemirror_core::signals::{
    ConflictNotice, FailureKind, KeyMigrated, KeyMigration, KeyMigrationPending, MirrorInactive,
    OverrideEnabled, Refusal, SyncCompleted, SyncEnabled, SyncFailed, SyncFailure,
};
use treemirror_core::types::{MirrorEntry, MirrorPayload};

/// Expected, non-fault reasons a job did not write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MirrorUnavailable,
    Refused(Refusal),
}

impl SkipReason {
    pub fn failure(&self) -> SyncFailure {
        let kind = match self {
            Self::MirrorUnavailable => FailureKind::MirrorUnavailable,
            Self::Refused(refusal) => refusal.failure_kind(),
        };
        SyncFailure {
            kind,
            message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSuccess {
    pub reason: WriteReason,
    pub storage_key: String,
    pub declared_key: String,
    /// Top-level items written.
    pub items: usize,
    pub key_migrated: Option<KeyMigration>,
}

#[derive(Debug)]
pub enum SyncOutcome {
    Success(SyncSuccess),
    Skipped(SkipReason),
    Failed(SyncError),
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Value recorded under `sync_failed` for any non-success.
    pub fn failure(&self) -> Option<SyncFailure> {
        match self {
            Self::Success(_) => None,
            Self::Skipped(reason) => Some(reason.failure()),
            Self::Failed(err) => Some(SyncFailure {
                kind: FailureKind::WriteFault,
                message: Some(err.to_string()),
            }),
        }
    }
}

/// Run one job. Faults are converted to [`SyncOutcome::Failed`], never returned.
pub fn execute(ctx: &SyncContext<'_>, job: &SyncJob) -> SyncOutcome {
    match try_execute(ctx, job) {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(
                slug = %job.slug,
                entity_id = job.entity_id,
                error = %err,
                "Mirror write failed"
            );
            SyncOutcome::Failed(err)
        }
    }
}

fn try_execute(ctx: &SyncContext<'_>, job: &SyncJob) -> Result<SyncOutcome, SyncError> {
    let slug = job.slug.as_str();

    let Some(mut entries) = ctx.mirror.read()? else {
        ctx.signals.set::<MirrorInactive>(slug, &true)?;
        info!(slug, "Mirror store not initialized, skipping sync");
        return Ok(SyncOutcome::Skipped(SkipReason::MirrorUnavailable));
    };

    let override_enabled = ctx.signals.get::<OverrideEnabled>(slug)?.unwrap_or(false);
    let sync_hint = ctx.signals.get::<SyncEnabled>(slug)?;
    let verdict = detect(&DetectInput {
        slug,
        resolved: resolve_key(&entries, slug),
        before: job.before.as_deref(),
        override_enabled,
        sync_hint,
    })?;

    let reason = match verdict {
        Verdict::Write(reason) => reason,
        Verdict::Refuse(refusal) => {
            warn!(
                slug,
                entity_id = job.entity_id,
                reason = refusal.failure_kind().as_str(),
                "Mirror write refused"
            );
            ctx.signals.set::<ConflictNotice>(slug, &refusal)?;
            ctx.signals.set::<SyncEnabled>(slug, &false)?;
            return Ok(SyncOutcome::Skipped(SkipReason::Refused(refusal)));
        }
    };

    let items = ctx
        .tree
        .read_tree(job.entity_id)?
        .ok_or(SyncError::TreeNotFound {
            entity_id: job.entity_id,
        })?;
    let normalized = normalize(&items, ctx.filter)?;
    let data = normalized
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()
        .map_err(StateError::serialization)?;

    let declared_key = sanitize_key(slug);
    let previous = entries.get(slug);
    let global = previous
        .map(|entry| entry.global)
        .unwrap_or(ctx.config.sync.global_entries);
    let key_migrated = previous
        .filter(|entry| entry.declared_key != declared_key)
        .map(|entry| KeyMigration {
            from: entry.declared_key.clone(),
            to: declared_key.clone(),
        });
    let name = ctx
        .entities
        .name_of(job.entity_id)?
        .unwrap_or_else(|| slug.to_string());

    entries.insert(
        slug.to_string(),
        MirrorEntry {
            storage_key: slug.to_string(),
            declared_key: declared_key.clone(),
            name,
            global,
            payload: MirrorPayload::json(data),
        },
    );
    ctx.mirror.write(&entries)?;
    info!(
        slug,
        entity_id = job.entity_id,
        reason = reason.as_str(),
        items = normalized.len(),
        "Mirror entry written"
    );

    // The write has landed; from here a signal error is logged, never returned.
    if let Some(migration) = &key_migrated {
        info!(slug, from = %migration.from, to = %migration.to, "Declared key migrated");
        after_write(
            slug,
            "key_migrated",
            ctx.signals.set::<KeyMigrated>(slug, migration),
        );
        after_write(
            slug,
            "key_migration_pending",
            ctx.signals.clear::<KeyMigrationPending>(slug),
        );
    }
    after_write(slug, "sync_completed", ctx.signals.set::<SyncCompleted>(slug, &true));
    after_write(slug, "sync_failed", ctx.signals.clear::<SyncFailed>(slug));
    after_write(
        slug,
        "override_enabled",
        ctx.signals.clear::<OverrideEnabled>(slug),
    );
    after_write(
        slug,
        "conflict_notice",
        ctx.signals.clear::<ConflictNotice>(slug),
    );
    after_write(
        slug,
        "mirror_inactive",
        ctx.signals.clear::<MirrorInactive>(slug),
    );
    after_write(slug, "sync_enabled", ctx.signals.set::<SyncEnabled>(slug, &true));

    Ok(SyncOutcome::Success(SyncSuccess {
        reason,
        storage_key: slug.to_string(),
        declared_key,
        items: normalized.len(),
        key_migrated,
    }))
}

fn after_write(slug: &str, topic: &str, result: Result<(), StateError>) {
    if let Err(err) = result {
        warn!(slug, topic, error = %err, "Signal update after mirror write failed");
    }
}
