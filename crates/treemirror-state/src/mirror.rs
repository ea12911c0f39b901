//! Sibling-owned mirror storage.
//!
//! The mirror is uninitialized until [`initialize`] records a `mirror_state`
//! row; before that [`SqliteMirrorStore::read`] yields `None` and sync jobs
//! are skipped.

use crate::db::with_savepoint;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeSet;
use tracing::{debug, warn};
use treemirror_core::error::StateError;
use treemirror_core::ports::MirrorStore;
use treemirror_core::types::{MirrorEntries, MirrorEntry, MirrorPayload};

pub fn initialize(conn: &Connection) -> Result<(), StateError> {
    conn.execute(
        "INSERT OR IGNORE INTO mirror_state (id, initialized_at) VALUES (1, ?1)",
        params![treemirror_core::time::now_iso8601()],
    )
    .map_err(StateError::sqlite)?;
    Ok(())
}

pub fn is_initialized(conn: &Connection) -> Result<bool, StateError> {
    let row: Option<i64> = conn
        .query_row("SELECT id FROM mirror_state WHERE id = 1", [], |row| row.get(0))
        .optional()
        .map_err(StateError::sqlite)?;
    Ok(row.is_some())
}

/// Mark the mirror unavailable and drop its entries.
pub fn deinitialize(conn: &Connection) -> Result<(), StateError> {
    with_savepoint(conn, "mirror_deinit", || {
        conn.execute("DELETE FROM mirror_entries", [])
            .map_err(StateError::sqlite)?;
        conn.execute("DELETE FROM mirror_state", [])
            .map_err(StateError::sqlite)?;
        Ok(())
    })
}

/// Insert or replace one entry, as an out-of-band editor would.
pub fn put_entry(conn: &Connection, entry: &MirrorEntry) -> Result<(), StateError> {
    insert_entry(conn, entry)
}

/// Remove one entry by storage key. Returns whether it existed.
pub fn remove_entry(conn: &Connection, storage_key: &str) -> Result<bool, StateError> {
    let deleted = conn
        .execute(
            "DELETE FROM mirror_entries WHERE storage_key = ?1",
            params![storage_key],
        )
        .map_err(StateError::sqlite)?;
    Ok(deleted == 1)
}

fn insert_entry(conn: &Connection, entry: &MirrorEntry) -> Result<(), StateError> {
    let payload_json = serde_json::to_string(&entry.payload).map_err(StateError::serialization)?;
    conn.execute(
        "INSERT INTO mirror_entries (storage_key, declared_key, name, is_global, payload_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(storage_key) DO UPDATE SET
             declared_key = excluded.declared_key,
             name = excluded.name,
             is_global = excluded.is_global,
             payload_json = excluded.payload_json,
             updated_at = excluded.updated_at",
        params![
            entry.storage_key,
            entry.declared_key,
            entry.name,
            entry.global,
            payload_json,
            treemirror_core::time::now_iso8601(),
        ],
    )
    .map_err(StateError::sqlite)?;
    Ok(())
}

fn load_entries(conn: &Connection) -> Result<MirrorEntries, StateError> {
    let (entries, unreadable) = scan_entries(conn)?;
    if !unreadable.is_empty() {
        warn!(skipped = unreadable.len(), "Mirror read skipped undecodable entries");
    }
    Ok(entries)
}

/// Decode every row. A row whose payload does not decode is left out of the
/// mapping and reported by storage key, so one bad entry cannot hide the rest.
fn scan_entries(conn: &Connection) -> Result<(MirrorEntries, BTreeSet<String>), StateError> {
    let mut stmt = conn
        .prepare(
            "SELECT storage_key, declared_key, name, is_global, payload_json
             FROM mirror_entries ORDER BY storage_key",
        )
        .map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .map_err(StateError::sqlite)?;

    let mut entries = MirrorEntries::new();
    let mut unreadable = BTreeSet::new();
    for row in rows {
        let (storage_key, declared_key, name, global, payload_json) =
            row.map_err(StateError::sqlite)?;
        let payload: MirrorPayload = match serde_json::from_str(&payload_json) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(storage_key = %storage_key, error = %err, "Skipping undecodable mirror entry");
                unreadable.insert(storage_key);
                continue;
            }
        };
        entries.insert(
            storage_key.clone(),
            MirrorEntry {
                storage_key,
                declared_key,
                name,
                global,
                payload,
            },
        );
    }
    Ok((entries, unreadable))
}

pub struct SqliteMirrorStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteMirrorStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl MirrorStore for SqliteMirrorStore<'_> {
    fn read(&self) -> Result<Option<MirrorEntries>, StateError> {
        if !is_initialized(self.conn)? {
            return Ok(None);
        }
        load_entries(self.conn).map(Some)
    }

    fn write(&self, entries: &MirrorEntries) -> Result<(), StateError> {
        // Rows that never decoded were invisible to the caller, so the new
        // mapping says nothing about them. They stay until replaced by key.
        with_savepoint(self.conn, "mirror_write", || {
            let (current, unreadable) = scan_entries(self.conn)?;
            for storage_key in current.keys().filter(|key| !entries.contains_key(*key)) {
                remove_entry(self.conn, storage_key)?;
            }
            for entry in entries.values() {
                insert_entry(self.conn, entry)?;
            }
            if !unreadable.is_empty() {
                debug!(kept = unreadable.len(), "Undecodable mirror entries left in place");
            }
            Ok(())
        })?;
        debug!(entries = entries.len(), "Mirror mapping written");
        Ok(())
    }
}
