use rusqlite::Connection;
use std::path::Path;
use tracing::debug;
use treemirror_core::config::StorageConfig;
use treemirror_core::error::StateError;

/// Open a SQLite connection with default pragmas.
pub fn open_connection(db_path: &Path) -> Result<Connection, StateError> {
    open_connection_with_config(db_path, 5000, -16000)
}

/// Open a SQLite connection using the `[storage]` section of the config.
pub fn open_with_storage_config(
    db_path: &Path,
    storage: &StorageConfig,
) -> Result<Connection, StateError> {
    open_connection_with_config(db_path, storage.busy_timeout_ms, storage.cache_size)
}

/// Open a SQLite connection with configurable pragmas.
pub fn open_connection_with_config(
    db_path: &Path,
    busy_timeout_ms: u32,
    cache_size: i32,
) -> Result<Connection, StateError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(StateError::Io)?;
    }

    let conn = Connection::open(db_path).map_err(StateError::sqlite)?;

    apply_pragmas(&conn, busy_timeout_ms, cache_size)?;

    debug!(?db_path, "SQLite connection opened");
    Ok(conn)
}

/// WAL lets the write request and concurrent poll requests proceed side by side.
fn apply_pragmas(
    conn: &Connection,
    busy_timeout_ms: u32,
    cache_size: i32,
) -> Result<(), StateError> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = {};
         PRAGMA cache_size = {};",
        busy_timeout_ms, cache_size
    ))
    .map_err(StateError::sqlite)?;
    Ok(())
}

/// Run SQLite quick_check to verify database integrity.
/// Returns Ok(true) if healthy, Ok(false) with error detail otherwise.
pub fn check_sqlite_health(conn: &Connection) -> Result<(bool, Option<String>), StateError> {
    let result: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(StateError::sqlite)?;

    if result == "ok" {
        Ok((true, None))
    } else {
        Ok((false, Some(result)))
    }
}

/// Run `body` inside a named savepoint, rolling back on error.
pub(crate) fn with_savepoint<T>(
    conn: &Connection,
    name: &str,
    body: impl FnOnce() -> Result<T, StateError>,
) -> Result<T, StateError> {
    conn.execute_batch(&format!("SAVEPOINT {name}"))
        .map_err(StateError::sqlite)?;
    match body() {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE SAVEPOINT {name}"))
                .map_err(StateError::sqlite)?;
            Ok(value)
        }
        Err(err) => {
            let _ = conn.execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name};"
            ));
            Err(err)
        }
    }
}
