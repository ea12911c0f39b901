//! SQLite signal backend. Rows carry an absolute expiry in unix milliseconds
//! and are filtered on read, so expiry does not depend on pruning.

use rusqlite::{Connection, OptionalExtension, params};
use std::time::Duration;
use tracing::debug;
use treemirror_core::error::StateError;
use treemirror_core::signals::{SignalBackend, SignalTopic};
use treemirror_core::time::now_unix_ms;

pub struct SqliteSignalBackend<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteSignalBackend<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Live signals for `key`, as `(topic, raw value)` pairs.
    pub fn live_for_key(&self, key: &str) -> Result<Vec<(String, String)>, StateError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT topic, value_json FROM signals
                 WHERE key = ?1 AND expires_at_ms > ?2 ORDER BY topic",
            )
            .map_err(StateError::sqlite)?;
        let rows = stmt
            .query_map(params![key, now_unix_ms()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .map_err(StateError::sqlite)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StateError::sqlite)
    }
}

impl SignalBackend for SqliteSignalBackend<'_> {
    fn set_raw(
        &self,
        topic: SignalTopic,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StateError> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at_ms = now_unix_ms().saturating_add(ttl_ms);
        self.conn
            .execute(
                "INSERT INTO signals (topic, key, value_json, expires_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(topic, key) DO UPDATE SET
                     value_json = excluded.value_json,
                     expires_at_ms = excluded.expires_at_ms",
                params![topic.as_str(), key, value, expires_at_ms],
            )
            .map_err(StateError::sqlite)?;
        Ok(())
    }

    fn get_raw(&self, topic: SignalTopic, key: &str) -> Result<Option<String>, StateError> {
        self.conn
            .query_row(
                "SELECT value_json FROM signals
                 WHERE topic = ?1 AND key = ?2 AND expires_at_ms > ?3",
                params![topic.as_str(), key, now_unix_ms()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StateError::sqlite)
    }

    fn delete(&self, topic: SignalTopic, key: &str) -> Result<(), StateError> {
        self.conn
            .execute(
                "DELETE FROM signals WHERE topic = ?1 AND key = ?2",
                params![topic.as_str(), key],
            )
            .map_err(StateError::sqlite)?;
        Ok(())
    }

    fn prune_expired(&self) -> Result<usize, StateError> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM signals WHERE expires_at_ms <= ?1",
                params![now_unix_ms()],
            )
            .map_err(StateError::sqlite)?;
        if removed > 0 {
            debug!(removed, "Pruned expired signals");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, schema};
    use tempfile::{TempDir, tempdir};
    use treemirror_core::config::SignalsConfig;
    use treemirror_core::signals::{
        ConflictNotice, OverrideEnabled, Refusal, SignalStore, SyncEnabled,
    };

    fn setup_test_db() -> (TempDir, Connection) {
        let dir = tempdir().unwrap();
        let conn = db::open_connection(&dir.path().join("signals.db")).unwrap();
        schema::create_tables(&conn).unwrap();
        (dir, conn)
    }

    #[test]
    fn typed_signals_persist_across_connections() {
        let (dir, conn) = setup_test_db();
        let backend = SqliteSignalBackend::new(&conn);
        let signals = SignalStore::new(&backend, SignalsConfig::default());
        signals
            .set::<ConflictNotice>("main-menu", &Refusal::Collision {
                storage_key: "main_menu".into(),
            })
            .unwrap();
        signals.set::<OverrideEnabled>("main-menu", &true).unwrap();

        let other = db::open_connection(&dir.path().join("signals.db")).unwrap();
        let other_backend = SqliteSignalBackend::new(&other);
        let reread = SignalStore::new(&other_backend, SignalsConfig::default());
        assert_eq!(
            reread.get::<ConflictNotice>("main-menu").unwrap(),
            Some(Refusal::Collision {
                storage_key: "main_menu".into()
            })
        );
        assert_eq!(other_backend.live_for_key("main-menu").unwrap().len(), 2);
    }

    #[test]
    fn expired_rows_are_invisible_then_pruned() {
        let (_dir, conn) = setup_test_db();
        let backend = SqliteSignalBackend::new(&conn);
        let signals = SignalStore::new(&backend, SignalsConfig::default());
        signals
            .set_for::<SyncEnabled>("footer", &true, Duration::ZERO)
            .unwrap();
        signals.set::<OverrideEnabled>("footer", &true).unwrap();

        assert_eq!(signals.get::<SyncEnabled>("footer").unwrap(), None);
        assert_eq!(signals.prune_expired().unwrap(), 1);
        assert_eq!(signals.get::<OverrideEnabled>("footer").unwrap(), Some(true));
    }

    #[test]
    fn overwrite_refreshes_value_and_clear_removes() {
        let (_dir, conn) = setup_test_db();
        let backend = SqliteSignalBackend::new(&conn);
        let signals = SignalStore::new(&backend, SignalsConfig::default());
        signals.set::<SyncEnabled>("x", &true).unwrap();
        signals.set::<SyncEnabled>("x", &false).unwrap();
        assert_eq!(signals.get::<SyncEnabled>("x").unwrap(), Some(false));

        signals.clear::<SyncEnabled>("x").unwrap();
        assert!(!signals.is_set::<SyncEnabled>("x").unwrap());
    }
}
