use rusqlite::Connection;
use tracing::info;
use treemirror_core::constants;
use treemirror_core::error::StateError;

/// Current schema version. Bump this when adding a new migration step.
pub const CURRENT_SCHEMA_VERSION: u32 = constants::SCHEMA_VERSION;

/// Create all required SQLite tables and run any pending migrations.
pub fn create_tables(conn: &Connection) -> Result<(), StateError> {
    conn.execute_batch(SCHEMA_SQL).map_err(StateError::sqlite)?;
    migrate(conn)?;
    info!("SQLite schema created (version {})", CURRENT_SCHEMA_VERSION);
    Ok(())
}

/// Run incremental schema migrations up to `CURRENT_SCHEMA_VERSION`.
///
/// The `schema_migrations` table tracks which version has been applied.
/// New migrations are appended to the `migrations` array below.
pub fn migrate(conn: &Connection) -> Result<(), StateError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(StateError::sqlite)?;

    let current = applied_version(conn)?;

    type MigrationFn = fn(&Connection) -> Result<(), StateError>;

    let migrations: &[MigrationFn] = &[
        // V1: baseline, tables already created by SCHEMA_SQL
        |_conn| Ok(()),
    ];

    for version in (current + 1)..=(CURRENT_SCHEMA_VERSION) {
        let idx = (version - 1) as usize;
        if idx < migrations.len() {
            migrations[idx](conn)?;
        }
        conn.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )
        .map_err(StateError::sqlite)?;
        info!(version, "Applied schema migration");
    }

    Ok(())
}

/// Highest applied migration, 0 on a fresh database.
pub fn applied_version(conn: &Connection) -> Result<u32, StateError> {
    let has_table: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
            [],
            |row| row.get(0),
        )
        .map_err(StateError::sqlite)?;
    if !has_table {
        return Ok(0);
    }
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(StateError::sqlite)
}

/// Fail with `SchemaMigrationRequired` when the database lags the binary.
pub fn ensure_current(conn: &Connection) -> Result<(), StateError> {
    let current = applied_version(conn)?;
    if current < CURRENT_SCHEMA_VERSION {
        return Err(StateError::SchemaMigrationRequired {
            current,
            required: CURRENT_SCHEMA_VERSION,
        });
    }
    Ok(())
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    entity_id INTEGER PRIMARY KEY AUTOINCREMENT,
    slug TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tree_items (
    entity_id INTEGER NOT NULL REFERENCES entities(entity_id) ON DELETE CASCADE,
    item_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    parent_id INTEGER NOT NULL DEFAULT 0,
    label TEXT NOT NULL,
    url TEXT NOT NULL,
    classes_json TEXT NOT NULL DEFAULT '[]',
    target TEXT,
    extra_json TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY(entity_id, item_id)
);

CREATE INDEX IF NOT EXISTS idx_tree_items_position ON tree_items(entity_id, position);

CREATE TABLE IF NOT EXISTS mirror_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    initialized_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mirror_entries (
    storage_key TEXT PRIMARY KEY,
    declared_key TEXT NOT NULL,
    name TEXT NOT NULL,
    is_global INTEGER NOT NULL DEFAULT 1,
    payload_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS signals (
    topic TEXT NOT NULL,
    key TEXT NOT NULL,
    value_json TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL,
    PRIMARY KEY(topic, key)
);

CREATE INDEX IF NOT EXISTS idx_signals_expires ON signals(expires_at_ms);
"#;
