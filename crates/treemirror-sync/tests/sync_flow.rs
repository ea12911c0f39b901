use rusqlite::Connection;
use serde_json::Value;
use tempfile::{TempDir, tempdir};
use treemirror_core::config::Config;
use treemirror_core::memory::StaticAuthorizer;
use treemirror_core::nonce;
use treemirror_core::ports::MirrorStore;
use treemirror_core::signals::{ConflictNotice, FailureKind, Refusal, SyncFailed};
use treemirror_core::types::{
    EntityId, EntityMetadata, MirrorEntries, RequestOrigin, SourceItem, TreeEvent,
};
use treemirror_state::entities::{self, SqliteTreeStore};
use treemirror_state::mirror::{self, SqliteMirrorStore};
use treemirror_state::signals::SqliteSignalBackend;
use treemirror_state::{db, schema};
use treemirror_sync::deletion::DeletionOutcome;
use treemirror_sync::endpoints::{self, Notice};
use treemirror_sync::executor::{SkipReason, SyncOutcome};
use treemirror_sync::normalize::{NoopFilter, canonical_json, canonical_value_json, normalize};
use treemirror_sync::poll::{PollState, PollingClient, drive};
use treemirror_sync::queue::DrainReport;
use treemirror_sync::session::Handled;
use treemirror_sync::{SyncContext, SyncSession};

const SECRET: &str = "integration-secret";

struct Harness {
    _dir: TempDir,
    conn: Connection,
    auth: StaticAuthorizer,
    config: Config,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let conn = db::open_connection(&dir.path().join("state.db")).unwrap();
        schema::create_tables(&conn).unwrap();
        mirror::initialize(&conn).unwrap();
        Self {
            _dir: dir,
            conn,
            auth: StaticAuthorizer::allow_all(SECRET),
            config: Config::default(),
        }
    }

    /// One simulated admin request: apply `edit`, feed its events, drain.
    fn request(&self, edit: impl FnOnce(&Connection) -> Vec<TreeEvent>) -> DrainReport {
        let tree = SqliteTreeStore::new(&self.conn);
        let mirror = SqliteMirrorStore::new(&self.conn);
        let signals = SqliteSignalBackend::new(&self.conn);
        let ctx = SyncContext::new(&tree, &tree, &mirror, &signals, &self.auth, &self.config);
        let mut session = SyncSession::new(ctx, RequestOrigin::Admin);
        for event in edit(&self.conn) {
            session.handle(event).unwrap();
        }
        session.finish()
    }

    /// Host-style save: `Changed` fires before the items are rewritten.
    fn save(&self, entity_id: EntityId, items: Vec<SourceItem>) -> DrainReport {
        self.request(|conn| {
            let mut events = vec![TreeEvent::Changed(entity_id)];
            events.extend(entities::replace_items(conn, entity_id, &items).unwrap());
            events
        })
    }

    fn with_ctx<T>(&self, f: impl FnOnce(&SyncContext<'_>) -> T) -> T {
        let tree = SqliteTreeStore::new(&self.conn);
        let mirror = SqliteMirrorStore::new(&self.conn);
        let signals = SqliteSignalBackend::new(&self.conn);
        let ctx = SyncContext::new(&tree, &tree, &mirror, &signals, &self.auth, &self.config);
        f(&ctx)
    }

    fn mirror(&self) -> MirrorEntries {
        SqliteMirrorStore::new(&self.conn).read().unwrap().unwrap()
    }
}

fn item(id: u64, label: &str) -> SourceItem {
    SourceItem::new(id, label, format!("/{}", label.to_lowercase()))
}

fn canonical_tree(items: &[SourceItem]) -> String {
    canonical_json(&normalize(items, &NoopFilter).unwrap()).unwrap()
}

#[test]
fn drift_is_refused_until_override_then_current_tree_wins() {
    let h = Harness::new();
    let id = entities::create_entity(&h.conn, "main-menu", "Main Menu").unwrap();

    // Create with [A, B]: first-time sync.
    let report = h.request(|conn| {
        let mut events = vec![TreeEvent::Created(id)];
        events.extend(entities::replace_items(conn, id, &[item(1, "A"), item(2, "B")]).unwrap());
        events
    });
    assert_eq!(report.succeeded(), 1);
    let entry = h.mirror()["main-menu"].clone();
    assert_eq!(entry.declared_key, "main_menu");
    assert_eq!(
        canonical_value_json(&entry.payload.data),
        canonical_tree(&[item(1, "A"), item(2, "B")])
    );

    // Someone else empties the mirror payload.
    let mut edited = entry.clone();
    edited.payload.data = Vec::<Value>::new();
    mirror::put_entry(&h.conn, &edited).unwrap();

    // User adds C: refused as drift, mirror stays empty.
    let report = h.save(id, vec![item(1, "A"), item(2, "B"), item(3, "C")]);
    assert!(matches!(
        report.outcome_for("main-menu"),
        Some(SyncOutcome::Skipped(SkipReason::Refused(Refusal::ExternalDrift)))
    ));
    assert!(h.mirror()["main-menu"].payload.data.is_empty());
    h.with_ctx(|ctx| {
        assert_eq!(
            ctx.signals.get::<ConflictNotice>("main-menu").unwrap(),
            Some(Refusal::ExternalDrift)
        );
        assert_eq!(
            ctx.signals.get::<SyncFailed>("main-menu").unwrap().map(|f| f.kind),
            Some(FailureKind::ExternalDrift)
        );
        let status = endpoints::status(ctx, "main-menu").unwrap();
        assert_eq!(
            status.notice,
            Notice::Conflict {
                refusal: Refusal::ExternalDrift
            }
        );

        let token = nonce::issue(SECRET, &nonce::override_action("main-menu"));
        endpoints::set_override(ctx, "main-menu", true, &token).unwrap();
    });

    // Re-save: override lets the user's current tree through.
    let report = h.save(id, vec![item(1, "A"), item(2, "B"), item(3, "C")]);
    assert!(report.outcome_for("main-menu").unwrap().is_success());
    assert_eq!(
        canonical_value_json(&h.mirror()["main-menu"].payload.data),
        canonical_tree(&[item(1, "A"), item(2, "B"), item(3, "C")])
    );

    h.with_ctx(|ctx| {
        let status = endpoints::status(ctx, "main-menu").unwrap();
        assert_eq!(status.notice, Notice::Idle);
        assert!(!status.override_enabled);

        let token = nonce::issue(SECRET, &nonce::poll_action("main-menu"));
        let mut client = PollingClient::from_config(&h.config.poll);
        client.start(&status);
        let mut source = || endpoints::poll_completion(ctx, "main-menu", &token);
        let state = drive(&mut client, &mut source, || {});
        assert_eq!(state, &PollState::Completed { key_migrated: None });
    });
}

#[test]
fn first_sync_without_snapshot_still_writes() {
    let h = Harness::new();
    let id = entities::create_entity(&h.conn, "footer", "Footer").unwrap();

    // Only item-level events: no snapshot is ever captured.
    let report = h.request(|conn| entities::replace_items(conn, id, &[item(1, "Legal")]).unwrap());
    assert_eq!(report.succeeded(), 1);
    assert_eq!(h.mirror()["footer"].payload.data[0]["label"], "Legal");

    // Same pattern with an existing entry is unverifiable.
    let report = h.request(|conn| entities::replace_items(conn, id, &[item(1, "Privacy")]).unwrap());
    assert!(matches!(
        report.outcome_for("footer"),
        Some(SyncOutcome::Skipped(SkipReason::Refused(Refusal::Unverifiable { .. })))
    ));
    assert_eq!(h.mirror()["footer"].payload.data[0]["label"], "Legal");
}

#[test]
fn clean_edit_sequence_syncs_without_override() {
    let h = Harness::new();
    let id = entities::create_entity(&h.conn, "docs", "Docs").unwrap();
    h.save(id, vec![item(1, "Intro")]);
    let report = h.save(id, vec![item(1, "Intro"), item(2, "Guide")]);
    assert!(report.outcome_for("docs").unwrap().is_success());
    assert_eq!(h.mirror()["docs"].payload.data.len(), 2);
}

#[test]
fn collision_blocks_second_entity() {
    let h = Harness::new();
    let first = entities::create_entity(&h.conn, "main-menu", "Main").unwrap();
    let second = entities::create_entity(&h.conn, "main_menu", "Other").unwrap();
    h.save(first, vec![item(1, "A")]);

    let report = h.save(second, vec![item(1, "Z")]);
    assert!(matches!(
        report.outcome_for("main_menu"),
        Some(SyncOutcome::Skipped(SkipReason::Refused(Refusal::Collision { storage_key })))
            if storage_key == "main-menu"
    ));
    let mirror = h.mirror();
    assert_eq!(mirror.len(), 1);
    assert_eq!(mirror["main-menu"].payload.data[0]["label"], "A");
}

#[test]
fn deleting_entity_removes_its_entry_only() {
    let h = Harness::new();
    let keep = entities::create_entity(&h.conn, "keep", "Keep").unwrap();
    let gone = entities::create_entity(&h.conn, "gone", "Gone").unwrap();
    let never = entities::create_entity(&h.conn, "never", "Never").unwrap();
    h.save(keep, vec![item(1, "K")]);
    h.save(gone, vec![item(1, "G")]);

    let mut outcomes = Vec::new();
    for (id, slug) in [(gone, "gone"), (never, "never")] {
        let tree = SqliteTreeStore::new(&h.conn);
        let mirror = SqliteMirrorStore::new(&h.conn);
        let signals = SqliteSignalBackend::new(&h.conn);
        let ctx = SyncContext::new(&tree, &tree, &mirror, &signals, &h.auth, &h.config);
        let mut session = SyncSession::new(ctx, RequestOrigin::Admin);
        let handled = session
            .handle(TreeEvent::Deleting(
                id,
                EntityMetadata {
                    slug: slug.into(),
                    name: slug.into(),
                },
            ))
            .unwrap();
        entities::delete_entity(&h.conn, id).unwrap();
        outcomes.push(handled);
    }

    assert_eq!(
        outcomes,
        vec![
            Handled::Deleted(DeletionOutcome::Removed {
                storage_key: "gone".into()
            }),
            Handled::Deleted(DeletionOutcome::NotFound),
        ]
    );
    assert_eq!(h.mirror().keys().collect::<Vec<_>>(), vec!["keep"]);
}

#[test]
fn uninitialized_mirror_reports_inactive() {
    let h = Harness::new();
    mirror::deinitialize(&h.conn).unwrap();
    let id = entities::create_entity(&h.conn, "menu", "Menu").unwrap();
    let report = h.save(id, vec![item(1, "A")]);
    assert!(matches!(
        report.outcome_for("menu"),
        Some(SyncOutcome::Skipped(SkipReason::MirrorUnavailable))
    ));
    h.with_ctx(|ctx| {
        let status = endpoints::status(ctx, "menu").unwrap();
        assert_eq!(status.notice, Notice::InactiveMirror);
        assert!(status.poll);
    });
}

#[test]
fn over_deep_tree_fails_alone_and_mirror_stays_readable() {
    let h = Harness::new();
    let deep = entities::create_entity(&h.conn, "deep", "Deep").unwrap();
    let other = entities::create_entity(&h.conn, "other", "Other").unwrap();

    let depth = treemirror_core::constants::MAX_TREE_DEPTH as u64 + 1;
    let chain: Vec<SourceItem> = (1..=depth)
        .map(|id| item(id, "Level").with_parent(id - 1))
        .collect();
    let report = h.request(|conn| {
        let mut events = vec![TreeEvent::Created(deep), TreeEvent::Created(other)];
        events.extend(entities::replace_items(conn, deep, &chain).unwrap());
        events.extend(entities::replace_items(conn, other, &[item(1, "Home")]).unwrap());
        events
    });

    assert!(matches!(
        report.outcome_for("deep"),
        Some(SyncOutcome::Failed(treemirror_core::error::SyncError::TreeTooDeep { .. }))
    ));
    assert!(report.outcome_for("other").is_some_and(SyncOutcome::is_success));

    let entries = h.mirror();
    assert!(!entries.contains_key("deep"));
    assert_eq!(entries["other"].payload.data[0]["label"], "Home");

    // Later saves of the shallow entity keep working.
    let report = h.save(other, vec![item(1, "Home"), item(2, "Blog")]);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(h.mirror()["other"].payload.data.len(), 2);

    h.with_ctx(|ctx| {
        assert_eq!(
            ctx.signals.get::<SyncFailed>("deep").unwrap().map(|f| f.kind),
            Some(FailureKind::WriteFault)
        );
        // No entry was written, so there is nothing to compare against.
        let status = endpoints::status(ctx, "deep").unwrap();
        assert!(status.poll);
    });
}
