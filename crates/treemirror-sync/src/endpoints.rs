//! Status, override and completion-poll operations, independent of transport.

use crate::context::SyncContext;
use crate::keys::{resolve_key, sanitize_key};
use crate::normalize::{canonical_json, canonical_value_json, normalize};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use treemirror_core::error::EndpointError;
use treemirror_core::nonce;
use treemirror_core::signals::{
    ConflictNotice, FailureKind, KeyMigrated, KeyMigration, KeyMigrationPending, MirrorInactive,
    OverrideEnabled, Refusal, SyncCompleted, SyncEnabled, SyncFailed, SyncInProgress,
};
use treemirror_core::types::{Capability, EntityId};

/// What the editor should tell the user, highest precedence first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Notice {
    InactiveMirror,
    SlugCollision { storage_key: String },
    Conflict { refusal: Refusal },
    OutOfSync,
    MigrationPending { migration: KeyMigration },
    Syncing,
    Idle,
}

impl Notice {
    pub fn message(&self) -> String {
        match self {
            Self::InactiveMirror => "The mirror store is not active; changes are not being mirrored.".into(),
            Self::SlugCollision { storage_key } => format!(
                "Another entity already uses this key (stored under `{storage_key}`). Rename one of them or enable override."
            ),
            Self::Conflict { refusal } => match refusal {
                Refusal::Collision { storage_key } => format!(
                    "Last sync was refused: key collides with `{storage_key}`."
                ),
                Refusal::Unverifiable { .. } => {
                    "Last sync was refused: the mirror could not be verified against the previous state.".into()
                }
                Refusal::ExternalDrift => {
                    "Last sync was refused: the mirror was changed elsewhere since editing began.".into()
                }
            },
            Self::OutOfSync => "The mirror differs from this tree.".into(),
            Self::MigrationPending { migration } => format!(
                "The declared key will change from `{}` to `{}` on next save.",
                migration.from, migration.to
            ),
            Self::Syncing => "Syncing to mirror...".into(),
            Self::Idle => "Mirror is up to date.".into(),
        }
    }

    /// Notices for which the override control is useful.
    pub fn offers_override(&self) -> bool {
        matches!(
            self,
            Self::SlugCollision { .. } | Self::Conflict { .. } | Self::OutOfSync
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub slug: String,
    pub notice: Notice,
    pub override_enabled: bool,
    /// Freshly computed "mirror matches tree" hint; `None` without a mirror.
    pub sync_enabled: Option<bool>,
    /// A sync attempt is underway or its outcome has not been consumed yet.
    pub poll: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideReport {
    pub slug: String,
    pub override_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub sync_completed: bool,
    pub sync_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_migrated: Option<KeyMigration>,
}

fn validate_slug(slug: &str) -> Result<(), EndpointError> {
    if slug.trim().is_empty() {
        return Err(EndpointError::InvalidInput("slug must not be empty".into()));
    }
    Ok(())
}

fn lookup(ctx: &SyncContext<'_>, slug: &str) -> Result<EntityId, EndpointError> {
    validate_slug(slug)?;
    ctx.entities
        .id_of(slug)?
        .ok_or_else(|| EndpointError::EntityNotFound {
            slug: slug.to_string(),
        })
}

fn authorize(ctx: &SyncContext<'_>, token: &str, action: &str) -> Result<(), EndpointError> {
    if !ctx.authorizer.current_actor_can(Capability::ManageMenus)
        || !ctx.authorizer.verify(token, action)
    {
        return Err(EndpointError::forbidden(action));
    }
    Ok(())
}

/// Compute the notice for `slug`. For actors who may manage menus this also
/// refreshes the `sync_enabled` hint and the pending key migration; anyone
/// else gets a read-only report.
pub fn status(ctx: &SyncContext<'_>, slug: &str) -> Result<StatusReport, EndpointError> {
    let entity_id = lookup(ctx, slug)?;
    let signals = &ctx.signals;
    let records = ctx.authorizer.current_actor_can(Capability::ManageMenus);

    let override_enabled = signals.get::<OverrideEnabled>(slug)?.unwrap_or(false);
    let in_progress = signals.is_set::<SyncInProgress>(slug)?;
    let poll = in_progress
        || signals.is_set::<SyncCompleted>(slug)?
        || signals.is_set::<SyncFailed>(slug)?;
    let report = |notice: Notice, sync_enabled: Option<bool>| StatusReport {
        slug: slug.to_string(),
        notice,
        override_enabled,
        sync_enabled,
        poll,
    };

    let Some(entries) = ctx.mirror.read()? else {
        if records {
            signals.set::<MirrorInactive>(slug, &true)?;
        }
        return Ok(report(Notice::InactiveMirror, None));
    };
    if records {
        signals.clear::<MirrorInactive>(slug)?;
    }

    let resolved = resolve_key(&entries, slug);
    if let Some(resolved) = resolved
        && resolved.is_collision(slug)
    {
        return Ok(report(
            Notice::SlugCollision {
                storage_key: resolved.storage_key.to_string(),
            },
            Some(false),
        ));
    }

    // Own entry only from here on.
    let in_sync = match resolved {
        Some(resolved) => {
            let items = ctx.tree.read_tree(entity_id)?.unwrap_or_default();
            let current = canonical_json(&normalize(&items, ctx.filter)?)?;
            current == canonical_value_json(&resolved.entry.payload.data)
        }
        None => true,
    };

    let migration = resolved
        .map(|r| &r.entry.declared_key)
        .filter(|declared| **declared != sanitize_key(slug))
        .map(|declared| KeyMigration {
            from: declared.clone(),
            to: sanitize_key(slug),
        });
    if records {
        signals.set::<SyncEnabled>(slug, &in_sync)?;
        match &migration {
            Some(migration) => signals.set::<KeyMigrationPending>(slug, migration)?,
            None => signals.clear::<KeyMigrationPending>(slug)?,
        }
        debug!(slug, in_sync, "Sync hint refreshed");
    }

    let notice = if let Some(refusal) = signals.get::<ConflictNotice>(slug)? {
        Notice::Conflict { refusal }
    } else if !in_sync {
        Notice::OutOfSync
    } else if let Some(migration) = migration {
        Notice::MigrationPending { migration }
    } else if in_progress {
        Notice::Syncing
    } else {
        Notice::Idle
    };
    Ok(report(notice, Some(in_sync)))
}

/// Grant or revoke the time-bounded override for `slug`.
pub fn set_override(
    ctx: &SyncContext<'_>,
    slug: &str,
    enabled: bool,
    token: &str,
) -> Result<OverrideReport, EndpointError> {
    validate_slug(slug)?;
    authorize(ctx, token, &nonce::override_action(slug))?;
    lookup(ctx, slug)?;

    if enabled {
        ctx.signals.set::<OverrideEnabled>(slug, &true)?;
    } else {
        ctx.signals.clear::<OverrideEnabled>(slug)?;
    }
    info!(slug, enabled, "Override updated");
    Ok(OverrideReport {
        slug: slug.to_string(),
        override_enabled: enabled,
    })
}

/// Report and consume the outcome signals of the last sync attempt.
pub fn poll_completion(
    ctx: &SyncContext<'_>,
    slug: &str,
    token: &str,
) -> Result<CompletionReport, EndpointError> {
    validate_slug(slug)?;
    authorize(ctx, token, &nonce::poll_action(slug))?;

    let sync_completed = ctx.signals.take::<SyncCompleted>(slug)?.unwrap_or(false);
    let failure = ctx.signals.take::<SyncFailed>(slug)?;
    let key_migrated = ctx.signals.take::<KeyMigrated>(slug)?;

    Ok(CompletionReport {
        sync_completed,
        sync_failed: failure.is_some(),
        failure_reason: failure.as_ref().map(|f| f.kind),
        failure_message: failure.and_then(|f| f.message),
        key_migrated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SyncSession;
    use serde_json::json;
    use treemirror_core::config::Config;
    use treemirror_core::memory::{MemoryMirrorStore, MemoryTreeStore, StaticAuthorizer};
    use treemirror_core::ports::MirrorStore;
    use treemirror_core::signals::{MemorySignalBackend, SyncFailure};
    use treemirror_core::types::{MirrorEntry, MirrorPayload, RequestOrigin, SourceItem, TreeEvent};

    const SECRET: &str = "test-secret";

    struct Fixture {
        tree: MemoryTreeStore,
        mirror: MemoryMirrorStore,
        signals: MemorySignalBackend,
        auth: StaticAuthorizer,
        config: Config,
    }

    impl Fixture {
        fn new(mirror: MemoryMirrorStore) -> Self {
            let tree = MemoryTreeStore::new();
            tree.insert_entity(1, "main-menu", "Main", vec![SourceItem::new(1, "A", "/a")])
                .unwrap();
            Self {
                tree,
                mirror,
                signals: MemorySignalBackend::new(),
                auth: StaticAuthorizer::allow_all(SECRET),
                config: Config::default(),
            }
        }

        fn ctx(&self) -> SyncContext<'_> {
            SyncContext::new(
                &self.tree,
                &self.tree,
                &self.mirror,
                &self.signals,
                &self.auth,
                &self.config,
            )
        }

        fn put(&self, storage_key: &str, declared_key: &str, data: Vec<serde_json::Value>) {
            let mut entries = self.mirror.snapshot().unwrap().unwrap_or_default();
            entries.insert(
                storage_key.into(),
                MirrorEntry {
                    storage_key: storage_key.into(),
                    declared_key: declared_key.into(),
                    name: storage_key.into(),
                    global: true,
                    payload: MirrorPayload::json(data),
                },
            );
            self.mirror.write(&entries).unwrap();
        }
    }

    #[test]
    fn unknown_slug_and_empty_slug() {
        let fx = Fixture::new(MemoryMirrorStore::initialized());
        let ctx = fx.ctx();
        assert!(matches!(
            status(&ctx, "nope"),
            Err(EndpointError::EntityNotFound { .. })
        ));
        assert!(matches!(status(&ctx, " "), Err(EndpointError::InvalidInput(_))));
    }

    #[test]
    fn status_without_manage_capability_writes_no_signals() {
        let mut fx = Fixture::new(MemoryMirrorStore::initialized());
        fx.auth = StaticAuthorizer::deny_all();
        fx.put("main-menu", "main-menu", vec![json!({"label": "edited"})]);
        let ctx = fx.ctx();

        let report = status(&ctx, "main-menu").unwrap();
        assert_eq!(report.notice, Notice::OutOfSync);
        assert_eq!(report.sync_enabled, Some(false));
        assert_eq!(ctx.signals.get::<SyncEnabled>("main-menu").unwrap(), None);
        assert!(!ctx.signals.is_set::<KeyMigrationPending>("main-menu").unwrap());

        let fx = Fixture {
            auth: StaticAuthorizer::deny_all(),
            ..Fixture::new(MemoryMirrorStore::uninitialized())
        };
        let ctx = fx.ctx();
        assert_eq!(status(&ctx, "main-menu").unwrap().notice, Notice::InactiveMirror);
        assert!(!ctx.signals.is_set::<MirrorInactive>("main-menu").unwrap());
    }

    #[test]
    fn inactive_mirror_wins() {
        let fx = Fixture::new(MemoryMirrorStore::uninitialized());
        let ctx = fx.ctx();
        ctx.signals.set::<SyncInProgress>("main-menu", &true).unwrap();
        let report = status(&ctx, "main-menu").unwrap();
        assert_eq!(report.notice, Notice::InactiveMirror);
        assert!(report.poll);
        assert_eq!(report.sync_enabled, None);
    }

    #[test]
    fn idle_after_sync_and_out_of_sync_after_edit() {
        let fx = Fixture::new(MemoryMirrorStore::initialized());
        let mut session = SyncSession::new(fx.ctx(), RequestOrigin::Admin);
        session.handle(TreeEvent::Created(1)).unwrap();
        session.finish();

        let ctx = fx.ctx();
        let report = status(&ctx, "main-menu").unwrap();
        assert_eq!(report.notice, Notice::Idle);
        assert_eq!(report.sync_enabled, Some(true));
        assert!(report.poll);

        fx.tree
            .set_items(1, vec![SourceItem::new(1, "Changed", "/a")])
            .unwrap();
        let report = status(&ctx, "main-menu").unwrap();
        assert_eq!(report.notice, Notice::OutOfSync);
        assert!(report.notice.offers_override());
        assert_eq!(ctx.signals.get::<SyncEnabled>("main-menu").unwrap(), Some(false));
    }

    #[test]
    fn collision_beats_conflict_notice() {
        let fx = Fixture::new(MemoryMirrorStore::initialized());
        fx.tree.insert_entity(2, "main_menu", "Other", Vec::new()).unwrap();
        fx.put("main-menu", "main_menu", Vec::new());
        let ctx = fx.ctx();
        ctx.signals
            .set::<ConflictNotice>("main_menu", &Refusal::ExternalDrift)
            .unwrap();

        let report = status(&ctx, "main_menu").unwrap();
        assert_eq!(
            report.notice,
            Notice::SlugCollision {
                storage_key: "main-menu".into()
            }
        );
    }

    #[test]
    fn legacy_key_reports_pending_migration() {
        let fx = Fixture::new(MemoryMirrorStore::initialized());
        fx.put(
            "main-menu",
            "main-menu",
            vec![json!({"label": "A", "url": "/a", "children": []})],
        );
        let ctx = fx.ctx();
        let report = status(&ctx, "main-menu").unwrap();
        let expected = KeyMigration {
            from: "main-menu".into(),
            to: "main_menu".into(),
        };
        assert_eq!(
            report.notice,
            Notice::MigrationPending {
                migration: expected.clone()
            }
        );
        assert_eq!(
            ctx.signals.get::<KeyMigrationPending>("main-menu").unwrap(),
            Some(expected)
        );
    }

    #[test]
    fn override_requires_valid_nonce() {
        let fx = Fixture::new(MemoryMirrorStore::initialized());
        let ctx = fx.ctx();
        let wrong = nonce::issue(SECRET, &nonce::poll_action("main-menu"));
        assert!(matches!(
            set_override(&ctx, "main-menu", true, &wrong),
            Err(EndpointError::Forbidden { .. })
        ));

        let token = nonce::issue(SECRET, &nonce::override_action("main-menu"));
        let report = set_override(&ctx, "main-menu", true, &token).unwrap();
        assert!(report.override_enabled);
        assert!(status(&ctx, "main-menu").unwrap().override_enabled);

        set_override(&ctx, "main-menu", false, &token).unwrap();
        assert!(!ctx.signals.is_set::<OverrideEnabled>("main-menu").unwrap());
    }

    #[test]
    fn poll_consumes_outcome_signals() {
        let fx = Fixture::new(MemoryMirrorStore::initialized());
        let ctx = fx.ctx();
        let token = nonce::issue(SECRET, &nonce::poll_action("main-menu"));
        ctx.signals
            .set::<SyncFailed>(
                "main-menu",
                &SyncFailure {
                    kind: FailureKind::ExternalDrift,
                    message: None,
                },
            )
            .unwrap();

        let first = poll_completion(&ctx, "main-menu", &token).unwrap();
        assert!(!first.sync_completed);
        assert!(first.sync_failed);
        assert_eq!(first.failure_reason, Some(FailureKind::ExternalDrift));

        let second = poll_completion(&ctx, "main-menu", &token).unwrap();
        assert_eq!(second, CompletionReport::default());
    }

    #[test]
    fn poll_rejects_denied_actor() {
        let mut fx = Fixture::new(MemoryMirrorStore::initialized());
        fx.auth = StaticAuthorizer::deny_all();
        let ctx = fx.ctx();
        let token = nonce::issue(SECRET, &nonce::poll_action("main-menu"));
        assert!(matches!(
            poll_completion(&ctx, "main-menu", &token),
            Err(EndpointError::Forbidden { .. })
        ));
    }
}
