//! Typed, TTL-bounded mailbox shared between the write path and later polls.
//!
//! Every topic is a zero-sized marker implementing [`Signal`], which fixes the
//! value type at compile time. Entries are keyed by `(topic, slug)`, follow
//! last-writer-wins, and expire on their own; no multi-topic update is atomic.

use crate::config::SignalsConfig;
use crate::error::StateError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalTopic {
    SyncEnabled,
    SyncInProgress,
    SyncCompleted,
    SyncFailed,
    OverrideEnabled,
    ConflictNotice,
    KeyMigrationPending,
    KeyMigrated,
    MirrorInactive,
}

impl SignalTopic {
    pub const ALL: [SignalTopic; 9] = [
        Self::SyncEnabled,
        Self::SyncInProgress,
        Self::SyncCompleted,
        Self::SyncFailed,
        Self::OverrideEnabled,
        Self::ConflictNotice,
        Self::KeyMigrationPending,
        Self::KeyMigrated,
        Self::MirrorInactive,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SyncEnabled => "sync_enabled",
            Self::SyncInProgress => "sync_in_progress",
            Self::SyncCompleted => "sync_completed",
            Self::SyncFailed => "sync_failed",
            Self::OverrideEnabled => "override_enabled",
            Self::ConflictNotice => "conflict_notice",
            Self::KeyMigrationPending => "key_migration_pending",
            Self::KeyMigrated => "key_migrated",
            Self::MirrorInactive => "mirror_inactive",
        }
    }

    pub fn ttl(self, config: &SignalsConfig) -> Duration {
        let secs = match self {
            Self::SyncInProgress => config.in_progress_ttl_secs,
            Self::SyncCompleted | Self::SyncFailed | Self::KeyMigrated => config.outcome_ttl_secs,
            Self::SyncEnabled => config.sync_enabled_ttl_secs,
            Self::OverrideEnabled => config.override_ttl_secs,
            Self::ConflictNotice | Self::KeyMigrationPending | Self::MirrorInactive => {
                config.notice_ttl_secs
            }
        };
        Duration::from_secs(secs)
    }
}

impl std::fmt::Display for SignalTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compile-time binding of a topic to its value type.
pub trait Signal {
    const TOPIC: SignalTopic;
    type Value: Serialize + DeserializeOwned;
}

/// Why the executor declined to write the mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Refusal {
    /// Another entity owns the declared key this slug resolves to.
    Collision { storage_key: String },
    /// A mirror entry exists but no pre-edit snapshot can prove it untouched.
    Unverifiable { hint: Option<bool> },
    /// The mirror no longer equals the pre-edit snapshot.
    ExternalDrift,
}

impl Refusal {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Collision { .. } => FailureKind::Collision,
            Self::Unverifiable { .. } => FailureKind::Unverifiable,
            Self::ExternalDrift => FailureKind::ExternalDrift,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMigration {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MirrorUnavailable,
    Collision,
    Unverifiable,
    ExternalDrift,
    WriteFault,
}

impl FailureKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MirrorUnavailable => "mirror_unavailable",
            Self::Collision => "collision",
            Self::Unverifiable => "unverifiable",
            Self::ExternalDrift => "external_drift",
            Self::WriteFault => "write_fault",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub kind: FailureKind,
    #[serde(default)]
    pub message: Option<String>,
}

macro_rules! signal {
    ($(#[$meta:meta])* $name:ident, $topic:ident, $value:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl Signal for $name {
            const TOPIC: SignalTopic = SignalTopic::$topic;
            type Value = $value;
        }
    };
}

signal!(
    /// Cached "mirror currently matches the tree" hint.
    SyncEnabled, SyncEnabled, bool
);
signal!(SyncInProgress, SyncInProgress, bool);
signal!(SyncCompleted, SyncCompleted, bool);
signal!(SyncFailed, SyncFailed, SyncFailure);
signal!(
    /// User-granted bypass of the collision and drift checks.
    OverrideEnabled, OverrideEnabled, bool
);
signal!(ConflictNotice, ConflictNotice, Refusal);
signal!(KeyMigrationPending, KeyMigrationPending, KeyMigration);
signal!(KeyMigrated, KeyMigrated, KeyMigration);
signal!(MirrorInactive, MirrorInactive, bool);

/// Raw storage behind [`SignalStore`]. Expired entries must read as absent.
pub trait SignalBackend {
    fn set_raw(
        &self,
        topic: SignalTopic,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StateError>;
    fn get_raw(&self, topic: SignalTopic, key: &str) -> Result<Option<String>, StateError>;
    fn delete(&self, topic: SignalTopic, key: &str) -> Result<(), StateError>;
    /// Physically remove expired entries. Returns the number removed.
    fn prune_expired(&self) -> Result<usize, StateError>;
}

/// Typed facade over a [`SignalBackend`].
pub struct SignalStore<'a> {
    backend: &'a dyn SignalBackend,
    ttls: SignalsConfig,
}

impl<'a> SignalStore<'a> {
    pub fn new(backend: &'a dyn SignalBackend, ttls: SignalsConfig) -> Self {
        Self { backend, ttls }
    }

    pub fn set<S: Signal>(&self, key: &str, value: &S::Value) -> Result<(), StateError> {
        let encoded = serde_json::to_string(value).map_err(StateError::serialization)?;
        self.backend
            .set_raw(S::TOPIC, key, &encoded, S::TOPIC.ttl(&self.ttls))
    }

    /// Like [`Self::set`] with an explicit lifetime.
    pub fn set_for<S: Signal>(
        &self,
        key: &str,
        value: &S::Value,
        ttl: Duration,
    ) -> Result<(), StateError> {
        let encoded = serde_json::to_string(value).map_err(StateError::serialization)?;
        self.backend.set_raw(S::TOPIC, key, &encoded, ttl)
    }

    pub fn get<S: Signal>(&self, key: &str) -> Result<Option<S::Value>, StateError> {
        let Some(raw) = self.backend.get_raw(S::TOPIC, key)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(topic = %S::TOPIC, key, error = %err, "Discarding undecodable signal");
                Ok(None)
            }
        }
    }

    /// Read and clear in one call. Not atomic against concurrent writers.
    pub fn take<S: Signal>(&self, key: &str) -> Result<Option<S::Value>, StateError> {
        let value = self.get::<S>(key)?;
        if value.is_some() {
            self.clear::<S>(key)?;
        }
        Ok(value)
    }

    pub fn clear<S: Signal>(&self, key: &str) -> Result<(), StateError> {
        self.backend.delete(S::TOPIC, key)
    }

    pub fn is_set<S: Signal>(&self, key: &str) -> Result<bool, StateError> {
        Ok(self.backend.get_raw(S::TOPIC, key)?.is_some())
    }

    /// Drop every topic stored for `key`.
    pub fn clear_all(&self, key: &str) -> Result<(), StateError> {
        for topic in SignalTopic::ALL {
            self.backend.delete(topic, key)?;
        }
        Ok(())
    }

    pub fn prune_expired(&self) -> Result<usize, StateError> {
        self.backend.prune_expired()
    }
}

/// Process-local backend for embedding and tests.
#[derive(Debug, Default)]
pub struct MemorySignalBackend {
    entries: Mutex<HashMap<(SignalTopic, String), (String, Instant)>>,
}

impl MemorySignalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<(SignalTopic, String), (String, Instant)>>, StateError>
    {
        self.entries
            .lock()
            .map_err(|_| StateError::Io(std::io::Error::other("signal map lock poisoned")))
    }
}

impl SignalBackend for MemorySignalBackend {
    fn set_raw(
        &self,
        topic: SignalTopic,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StateError> {
        let expires_at = Instant::now() + ttl;
        self.lock()?
            .insert((topic, key.to_string()), (value.to_string(), expires_at));
        Ok(())
    }

    fn get_raw(&self, topic: SignalTopic, key: &str) -> Result<Option<String>, StateError> {
        let guard = self.lock()?;
        Ok(guard
            .get(&(topic, key.to_string()))
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    fn delete(&self, topic: SignalTopic, key: &str) -> Result<(), StateError> {
        self.lock()?.remove(&(topic, key.to_string()));
        Ok(())
    }

    fn prune_expired(&self) -> Result<usize, StateError> {
        let mut guard = self.lock()?;
        let now = Instant::now();
        let before = guard.len();
        guard.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(before - guard.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(backend: &MemorySignalBackend) -> SignalStore<'_> {
        SignalStore::new(backend, SignalsConfig::default())
    }

    #[test]
    fn typed_round_trip_per_topic() {
        let backend = MemorySignalBackend::new();
        let signals = store(&backend);

        signals.set::<OverrideEnabled>("main-menu", &true).unwrap();
        signals
            .set::<ConflictNotice>("main-menu", &Refusal::ExternalDrift)
            .unwrap();

        assert_eq!(signals.get::<OverrideEnabled>("main-menu").unwrap(), Some(true));
        assert_eq!(
            signals.get::<ConflictNotice>("main-menu").unwrap(),
            Some(Refusal::ExternalDrift)
        );
        // Same key, different topic: independent.
        assert_eq!(signals.get::<SyncEnabled>("main-menu").unwrap(), None);
        // Same topic, different key: independent.
        assert_eq!(signals.get::<OverrideEnabled>("footer").unwrap(), None);
    }

    #[test]
    fn take_consumes_signal() {
        let backend = MemorySignalBackend::new();
        let signals = store(&backend);
        signals.set::<SyncCompleted>("footer", &true).unwrap();

        assert_eq!(signals.take::<SyncCompleted>("footer").unwrap(), Some(true));
        assert_eq!(signals.take::<SyncCompleted>("footer").unwrap(), None);
    }

    #[test]
    fn expired_signal_reads_as_absent_and_prunes() {
        let backend = MemorySignalBackend::new();
        let signals = store(&backend);
        signals
            .set_for::<SyncInProgress>("footer", &true, Duration::ZERO)
            .unwrap();
        signals.set::<SyncEnabled>("footer", &true).unwrap();

        assert!(!signals.is_set::<SyncInProgress>("footer").unwrap());
        assert_eq!(signals.prune_expired().unwrap(), 1);
        assert!(signals.is_set::<SyncEnabled>("footer").unwrap());
    }

    #[test]
    fn last_writer_wins() {
        let backend = MemorySignalBackend::new();
        let signals = store(&backend);
        signals.set::<SyncEnabled>("x", &true).unwrap();
        signals.set::<SyncEnabled>("x", &false).unwrap();
        assert_eq!(signals.get::<SyncEnabled>("x").unwrap(), Some(false));
    }

    #[test]
    fn undecodable_value_is_treated_as_absent() {
        let backend = MemorySignalBackend::new();
        backend
            .set_raw(
                SignalTopic::ConflictNotice,
                "x",
                "\"not a refusal\"",
                Duration::from_secs(60),
            )
            .unwrap();
        let signals = store(&backend);
        assert_eq!(signals.get::<ConflictNotice>("x").unwrap(), None);
    }

    #[test]
    fn clear_all_drops_every_topic() {
        let backend = MemorySignalBackend::new();
        let signals = store(&backend);
        signals.set::<SyncEnabled>("x", &true).unwrap();
        signals.set::<OverrideEnabled>("x", &true).unwrap();
        signals.clear_all("x").unwrap();
        assert!(!signals.is_set::<SyncEnabled>("x").unwrap());
        assert!(!signals.is_set::<OverrideEnabled>("x").unwrap());
    }

    #[test]
    fn ttls_follow_topic_families() {
        let config = SignalsConfig::default();
        assert_eq!(SignalTopic::SyncInProgress.ttl(&config), Duration::from_secs(60));
        assert_eq!(SignalTopic::OverrideEnabled.ttl(&config), Duration::from_secs(300));
        assert_eq!(SignalTopic::SyncEnabled.ttl(&config), Duration::from_secs(3600));
    }
}
