use rusqlite::Connection;
use treemirror_core::config::Config;
use treemirror_core::ports::Authorizer;
use treemirror_state::entities::SqliteTreeStore;
use treemirror_state::mirror::SqliteMirrorStore;
use treemirror_state::signals::SqliteSignalBackend;
use treemirror_sync::SyncContext;

/// SQLite-backed collaborators sharing one connection for one request.
pub struct SqliteStores<'c> {
    tree: SqliteTreeStore<'c>,
    mirror: SqliteMirrorStore<'c>,
    signals: SqliteSignalBackend<'c>,
}

impl<'c> SqliteStores<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            tree: SqliteTreeStore::new(conn),
            mirror: SqliteMirrorStore::new(conn),
            signals: SqliteSignalBackend::new(conn),
        }
    }

    pub fn context<'a>(&'a self, authorizer: &'a dyn Authorizer, config: &'a Config) -> SyncContext<'a> {
        SyncContext::new(
            &self.tree,
            &self.tree,
            &self.mirror,
            &self.signals,
            authorizer,
            config,
        )
    }
}
