//! Host-side source tree storage: entities (menus) and their ordered items.
//!
//! Mutations return the change notifications the host would fire, so callers
//! can feed them straight into a sync session.

use crate::db::with_savepoint;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use treemirror_core::error::StateError;
use treemirror_core::ports::{EntityResolver, TreeStore};
use treemirror_core::types::{EntityId, EntityMetadata, SourceItem, SourceTree, TreeEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_id: EntityId,
    pub slug: String,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}

impl EntityRecord {
    pub fn metadata(&self) -> EntityMetadata {
        EntityMetadata {
            slug: self.slug.clone(),
            name: self.name.clone(),
        }
    }
}

/// Register a new entity. Fails with `EntityAlreadyExists` on a duplicate slug.
pub fn create_entity(conn: &Connection, slug: &str, name: &str) -> Result<EntityId, StateError> {
    let now = treemirror_core::time::now_iso8601();
    match conn.execute(
        "INSERT INTO entities (slug, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
        params![slug, name, now],
    ) {
        Ok(_) => Ok(conn.last_insert_rowid() as EntityId),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == ErrorCode::ConstraintViolation =>
        {
            Err(StateError::EntityAlreadyExists {
                slug: slug.to_string(),
            })
        }
        Err(e) => Err(StateError::sqlite(e)),
    }
}

pub fn get_entity(conn: &Connection, entity_id: EntityId) -> Result<Option<EntityRecord>, StateError> {
    conn.query_row(
        "SELECT entity_id, slug, name, created_at, updated_at FROM entities WHERE entity_id = ?1",
        params![entity_id as i64],
        row_to_entity,
    )
    .optional()
    .map_err(StateError::sqlite)
}

pub fn get_by_slug(conn: &Connection, slug: &str) -> Result<Option<EntityRecord>, StateError> {
    conn.query_row(
        "SELECT entity_id, slug, name, created_at, updated_at FROM entities WHERE slug = ?1",
        params![slug],
        row_to_entity,
    )
    .optional()
    .map_err(StateError::sqlite)
}

pub fn list_entities(conn: &Connection) -> Result<Vec<EntityRecord>, StateError> {
    let mut stmt = conn
        .prepare("SELECT entity_id, slug, name, created_at, updated_at FROM entities ORDER BY slug")
        .map_err(StateError::sqlite)?;
    let rows = stmt.query_map([], row_to_entity).map_err(StateError::sqlite)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(StateError::sqlite)
}

/// Items of an entity in menu order.
pub fn load_items(conn: &Connection, entity_id: EntityId) -> Result<SourceTree, StateError> {
    let mut stmt = conn
        .prepare(
            "SELECT item_id, parent_id, label, url, classes_json, target, extra_json
             FROM tree_items WHERE entity_id = ?1 ORDER BY position ASC, item_id ASC",
        )
        .map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map(params![entity_id as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
            ))
        })
        .map_err(StateError::sqlite)?;

    let mut items = Vec::new();
    for row in rows {
        let (item_id, parent_id, label, url, classes_json, target, extra_json) =
            row.map_err(StateError::sqlite)?;
        items.push(SourceItem {
            id: item_id as u64,
            label,
            url,
            classes: serde_json::from_str(&classes_json).map_err(StateError::serialization)?,
            target,
            parent_id: parent_id as u64,
            extra: serde_json::from_str(&extra_json).map_err(StateError::serialization)?,
        });
    }
    Ok(items)
}

/// Replace an entity's items, returning one `ItemChanged` per inserted or
/// modified item and one `ItemDeleted` per removed item, in that order.
pub fn replace_items(
    conn: &Connection,
    entity_id: EntityId,
    items: &[SourceItem],
) -> Result<Vec<TreeEvent>, StateError> {
    if get_entity(conn, entity_id)?.is_none() {
        return Err(StateError::entity_not_found(entity_id));
    }

    with_savepoint(conn, "tree_replace_items", || {
        let previous: HashMap<u64, (usize, SourceItem)> = load_items(conn, entity_id)?
            .into_iter()
            .enumerate()
            .map(|(pos, item)| (item.id, (pos, item)))
            .collect();

        let mut events = Vec::new();
        let mut kept = HashSet::new();
        for (position, item) in items.iter().enumerate() {
            kept.insert(item.id);
            let unchanged = previous
                .get(&item.id)
                .is_some_and(|(old_pos, old)| *old_pos == position && old == item);
            if unchanged {
                continue;
            }
            conn.execute(
                "INSERT INTO tree_items (entity_id, item_id, position, parent_id, label, url, classes_json, target, extra_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(entity_id, item_id) DO UPDATE SET
                     position = excluded.position,
                     parent_id = excluded.parent_id,
                     label = excluded.label,
                     url = excluded.url,
                     classes_json = excluded.classes_json,
                     target = excluded.target,
                     extra_json = excluded.extra_json",
                params![
                    entity_id as i64,
                    item.id as i64,
                    position as i64,
                    item.parent_id as i64,
                    item.label,
                    item.url,
                    serde_json::to_string(&item.classes).map_err(StateError::serialization)?,
                    item.target,
                    serde_json::to_string(&item.extra).map_err(StateError::serialization)?,
                ],
            )
            .map_err(StateError::sqlite)?;
            events.push(TreeEvent::ItemChanged(entity_id, item.id));
        }

        let mut removed: Vec<u64> = previous
            .keys()
            .filter(|id| !kept.contains(id))
            .copied()
            .collect();
        removed.sort_unstable();
        for item_id in removed {
            conn.execute(
                "DELETE FROM tree_items WHERE entity_id = ?1 AND item_id = ?2",
                params![entity_id as i64, item_id as i64],
            )
            .map_err(StateError::sqlite)?;
            events.push(TreeEvent::ItemDeleted(entity_id, item_id));
        }

        conn.execute(
            "UPDATE entities SET updated_at = ?1 WHERE entity_id = ?2",
            params![treemirror_core::time::now_iso8601(), entity_id as i64],
        )
        .map_err(StateError::sqlite)?;

        Ok(events)
    })
}

/// Remove an entity and its items. Returns whether a row was deleted.
pub fn delete_entity(conn: &Connection, entity_id: EntityId) -> Result<bool, StateError> {
    let deleted = conn
        .execute(
            "DELETE FROM entities WHERE entity_id = ?1",
            params![entity_id as i64],
        )
        .map_err(StateError::sqlite)?;
    Ok(deleted == 1)
}

fn row_to_entity(row: &rusqlite::Row) -> rusqlite::Result<EntityRecord> {
    Ok(EntityRecord {
        entity_id: row.get::<_, i64>(0)? as EntityId,
        slug: row.get(1)?,
        name: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

/// [`TreeStore`] and [`EntityResolver`] over one SQLite connection.
pub struct SqliteTreeStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteTreeStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl TreeStore for SqliteTreeStore<'_> {
    fn read_tree(&self, entity_id: EntityId) -> Result<Option<SourceTree>, StateError> {
        if get_entity(self.conn, entity_id)?.is_none() {
            return Ok(None);
        }
        load_items(self.conn, entity_id).map(Some)
    }
}

impl EntityResolver for SqliteTreeStore<'_> {
    fn slug_of(&self, entity_id: EntityId) -> Result<Option<String>, StateError> {
        Ok(get_entity(self.conn, entity_id)?.map(|e| e.slug))
    }

    fn name_of(&self, entity_id: EntityId) -> Result<Option<String>, StateError> {
        Ok(get_entity(self.conn, entity_id)?.map(|e| e.name))
    }

    fn id_of(&self, slug: &str) -> Result<Option<EntityId>, StateError> {
        Ok(get_by_slug(self.conn, slug)?.map(|e| e.entity_id))
    }
}
