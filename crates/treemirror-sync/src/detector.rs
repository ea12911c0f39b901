//! Optimistic-concurrency check deciding whether a mirror write is safe.
//!
//! Content comparison stands in for locking: the pre-edit snapshot must still
//! equal the mirror payload, otherwise someone else changed the mirror since
//! the edit began. The check-then-write window is not closed.

use crate::keys::ResolvedEntry;
use crate::normalize::{canonical_json, canonical_value_json};
use serde::{Deserialize, Serialize};
use treemirror_core::error::StateError;
use treemirror_core::signals::Refusal;
use treemirror_core::types::NormalizedItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteReason {
    /// User-granted override; collision and drift checks were skipped.
    Override,
    /// No mirror entry yet, nothing to clobber.
    FirstSync,
    /// Pre-edit snapshot equals the current mirror payload.
    SnapshotMatches,
}

impl WriteReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Override => "override",
            Self::FirstSync => "first_sync",
            Self::SnapshotMatches => "snapshot_matches",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Write(WriteReason),
    Refuse(Refusal),
}

impl Verdict {
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DetectInput<'a> {
    pub slug: &'a str,
    pub resolved: Option<ResolvedEntry<'a>>,
    pub before: Option<&'a [NormalizedItem]>,
    pub override_enabled: bool,
    /// Cached `sync_enabled` hint. Diagnostic only; the snapshot decides.
    pub sync_hint: Option<bool>,
}

pub fn detect(input: &DetectInput<'_>) -> Result<Verdict, StateError> {
    if input.override_enabled {
        return Ok(Verdict::Write(WriteReason::Override));
    }

    let Some(resolved) = input.resolved else {
        return Ok(Verdict::Write(WriteReason::FirstSync));
    };

    if resolved.is_collision(input.slug) {
        return Ok(Verdict::Refuse(Refusal::Collision {
            storage_key: resolved.storage_key.to_string(),
        }));
    }

    match input.before {
        Some(before) => {
            let expected = canonical_json(before)?;
            let actual = canonical_value_json(&resolved.entry.payload.data);
            if expected == actual {
                Ok(Verdict::Write(WriteReason::SnapshotMatches))
            } else {
                Ok(Verdict::Refuse(Refusal::ExternalDrift))
            }
        }
        None => Ok(Verdict::Refuse(Refusal::Unverifiable {
            hint: input.sync_hint,
        })),
    }
}
