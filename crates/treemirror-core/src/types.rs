use crate::constants;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Host-assigned identifier of a source entity (e.g. one navigation menu).
pub type EntityId = u64;

/// Host-assigned identifier of a single item inside a source tree.
pub type ItemId = u64;

/// One item of a source tree as the host stores it.
///
/// Parent links define a forest; `parent_id == 0` marks a root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceItem {
    pub id: ItemId,
    pub label: String,
    pub url: String,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub parent_id: ItemId,
    /// Host-specific extension fields carried through normalization.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl SourceItem {
    pub fn new(id: ItemId, label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            url: url.into(),
            classes: Vec::new(),
            target: None,
            parent_id: constants::ROOT_PARENT_ID,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_parent(mut self, parent_id: ItemId) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id == constants::ROOT_PARENT_ID
    }
}

/// Source tree in host menu order.
pub type SourceTree = Vec<SourceItem>;

/// Canonical, comparably-serializable form of one tree item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedItem {
    pub label: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub children: Vec<NormalizedItem>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Snapshot of a whole tree in normalized form.
pub type Snapshot = Vec<NormalizedItem>;

/// Payload block of a mirror entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorPayload {
    #[serde(rename = "type")]
    pub kind: String,
    /// Kept as raw JSON so out-of-band edits of any shape survive a round-trip.
    #[serde(default)]
    pub data: Vec<Value>,
}

impl MirrorPayload {
    pub fn json(data: Vec<Value>) -> Self {
        Self {
            kind: constants::PAYLOAD_TYPE_JSON.to_string(),
            data,
        }
    }
}

/// External representation of one source entity inside the mirror store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorEntry {
    pub storage_key: String,
    pub declared_key: String,
    pub name: String,
    #[serde(default)]
    pub global: bool,
    pub payload: MirrorPayload,
}

/// Whole mirror contents, keyed by storage key.
pub type MirrorEntries = BTreeMap<String, MirrorEntry>;

/// Identifying metadata captured before an entity is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub slug: String,
    pub name: String,
}

/// Where the current request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOrigin {
    Admin,
    Api,
    Public,
}

impl RequestOrigin {
    /// Only administrative and API requests may queue or flush sync work.
    pub fn may_sync(self) -> bool {
        matches!(self, Self::Admin | Self::Api)
    }
}

/// Capabilities checked against the acting user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    ManageMenus,
}

impl Capability {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ManageMenus => "manage_menus",
        }
    }
}

/// Change notifications fired by the host tree store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    Created(EntityId),
    Changed(EntityId),
    ItemChanged(EntityId, ItemId),
    ItemDeleted(EntityId, ItemId),
    Deleting(EntityId, EntityMetadata),
}

impl TreeEvent {
    pub fn entity_id(&self) -> EntityId {
        match self {
            Self::Created(id)
            | Self::Changed(id)
            | Self::ItemChanged(id, _)
            | Self::ItemDeleted(id, _)
            | Self::Deleting(id, _) => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalized_item_omits_empty_optionals() {
        let item = NormalizedItem {
            label: "Home".into(),
            url: "/".into(),
            classes: None,
            target: None,
            children: Vec::new(),
            extra: BTreeMap::new(),
        };
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value, json!({"label": "Home", "url": "/", "children": []}));
    }

    #[test]
    fn source_item_collects_extension_fields() {
        let item: SourceItem = serde_json::from_value(json!({
            "id": 7,
            "label": "Docs",
            "url": "/docs",
            "parent_id": 3,
            "icon": "book"
        }))
        .unwrap();
        assert_eq!(item.parent_id, 3);
        assert!(item.classes.is_empty());
        assert_eq!(item.extra.get("icon"), Some(&json!("book")));
    }

    #[test]
    fn mirror_payload_serializes_type_tag() {
        let payload = MirrorPayload::json(vec![json!({"label": "A"})]);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "json");
        assert_eq!(value["data"][0]["label"], "A");
    }

    #[test]
    fn public_origin_never_syncs() {
        assert!(RequestOrigin::Admin.may_sync());
        assert!(RequestOrigin::Api.may_sync());
        assert!(!RequestOrigin::Public.may_sync());
    }
}
