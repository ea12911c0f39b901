//! Source tree → canonical nested form.
//!
//! Built in two passes over an arena addressed by input position: first index
//! every item by id, then attach each item to its parent's child list. Items
//! whose parent is missing become roots; items caught in a parent cycle that
//! never reaches a root are unreachable and dropped. Trees deeper than
//! [`MAX_TREE_DEPTH`] are refused before anything is built.

use serde_json::Value;
use std::collections::HashMap;
use treemirror_core::canonical::{canonical_value, to_canonical_string};
use treemirror_core::constants::MAX_TREE_DEPTH;
use treemirror_core::error::{StateError, SyncError};
use treemirror_core::types::{NormalizedItem, SourceItem, Snapshot};

/// Keys owned by [`NormalizedItem`] itself; extension fields may not shadow them.
const RESERVED_KEYS: &[&str] = &["label", "url", "classes", "target", "children"];

/// Per-item hook run once during normalization, after children are attached.
pub trait ItemFilter {
    fn apply(&self, item: NormalizedItem, raw: &SourceItem) -> NormalizedItem;
}

impl<F> ItemFilter for F
where
    F: Fn(NormalizedItem, &SourceItem) -> NormalizedItem,
{
    fn apply(&self, item: NormalizedItem, raw: &SourceItem) -> NormalizedItem {
        self(item, raw)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFilter;

impl ItemFilter for NoopFilter {
    fn apply(&self, item: NormalizedItem, _raw: &SourceItem) -> NormalizedItem {
        item
    }
}

/// Runs filters in registration order, each seeing the previous one's output.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn ItemFilter + Send + Sync>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filter: impl ItemFilter + Send + Sync + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl ItemFilter for FilterChain {
    fn apply(&self, item: NormalizedItem, raw: &SourceItem) -> NormalizedItem {
        self.filters
            .iter()
            .fold(item, |item, filter| filter.apply(item, raw))
    }
}

pub fn normalize(items: &[SourceItem], filter: &dyn ItemFilter) -> Result<Snapshot, SyncError> {
    // Pass 1: id → arena slot. Duplicate ids resolve to their first occurrence.
    let mut index: HashMap<u64, usize> = HashMap::with_capacity(items.len());
    for (slot, item) in items.iter().enumerate() {
        index.entry(item.id).or_insert(slot);
    }

    // Pass 2: attach children in input order.
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); items.len()];
    let mut roots = Vec::new();
    for (slot, item) in items.iter().enumerate() {
        if item.is_root() {
            roots.push(slot);
            continue;
        }
        match index.get(&item.parent_id) {
            Some(&parent) if parent != slot => children[parent].push(slot),
            Some(_) => {} // self-parented: unreachable
            None => roots.push(slot),
        }
    }

    if let Some(depth) = depth_beyond(&roots, &children, MAX_TREE_DEPTH) {
        return Err(SyncError::TreeTooDeep {
            depth,
            max: MAX_TREE_DEPTH,
        });
    }

    Ok(roots
        .into_iter()
        .map(|slot| build(slot, items, &children, filter))
        .collect())
}

/// First depth found past `max`, walking with an explicit stack.
fn depth_beyond(roots: &[usize], children: &[Vec<usize>], max: usize) -> Option<usize> {
    let mut stack: Vec<(usize, usize)> = roots.iter().map(|&slot| (slot, 1)).collect();
    while let Some((slot, depth)) = stack.pop() {
        if depth > max {
            return Some(depth);
        }
        stack.extend(children[slot].iter().map(|&child| (child, depth + 1)));
    }
    None
}

fn build(
    slot: usize,
    items: &[SourceItem],
    children: &[Vec<usize>],
    filter: &dyn ItemFilter,
) -> NormalizedItem {
    let raw = &items[slot];
    let classes = raw
        .classes
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let extra = raw
        .extra
        .iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let item = NormalizedItem {
        label: decode_entities(&raw.label),
        url: decode_entities(&raw.url),
        classes: (!classes.is_empty()).then_some(classes),
        target: raw.target.clone().filter(|t| !t.is_empty()),
        children: children[slot]
            .iter()
            .map(|&child| build(child, items, children, filter))
            .collect(),
        extra,
    };
    filter.apply(item, raw)
}

/// Canonical serialization of a normalized snapshot.
pub fn canonical_json(items: &[NormalizedItem]) -> Result<String, StateError> {
    to_canonical_string(items)
}

/// Canonical serialization of a raw mirror payload.
pub fn canonical_value_json(values: &[Value]) -> String {
    canonical_value(&Value::Array(values.to_vec()))
}

/// Undo presentation-layer escaping in one pass, so `&amp;lt;` becomes `&lt;`.
pub fn decode_entities(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        match tail.find(';').filter(|&end| end <= 12) {
            Some(end) => match decode_entity(&tail[1..end]) {
                Some(ch) => {
                    out.push(ch);
                    rest = &tail[end + 1..];
                }
                None => {
                    out.push('&');
                    rest = &tail[1..];
                }
            },
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let digits = name.strip_prefix('#')?;
            let code = match digits.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => digits.parse::<u32>().ok()?,
            };
            char::from_u32(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: u64, label: &str, parent: u64) -> SourceItem {
        SourceItem::new(id, label, format!("/{id}")).with_parent(parent)
    }

    fn labels(items: &[NormalizedItem]) -> Vec<&str> {
        items.iter().map(|i| i.label.as_str()).collect()
    }

    #[test]
    fn nests_children_in_input_order() {
        let tree = vec![
            item(1, "Home", 0),
            item(2, "About", 0),
            item(3, "Team", 2),
            item(4, "History", 2),
            item(5, "Founders", 4),
        ];
        let out = normalize(&tree, &NoopFilter).unwrap();
        assert_eq!(labels(&out), vec!["Home", "About"]);
        assert_eq!(labels(&out[1].children), vec!["Team", "History"]);
        assert_eq!(labels(&out[1].children[1].children), vec!["Founders"]);
    }

    #[test]
    fn child_listed_before_parent_still_attaches() {
        let tree = vec![item(3, "Child", 1), item(1, "Parent", 0)];
        let out = normalize(&tree, &NoopFilter).unwrap();
        assert_eq!(labels(&out), vec!["Parent"]);
        assert_eq!(labels(&out[0].children), vec!["Child"]);
    }

    #[test]
    fn orphans_become_roots_and_cycles_are_dropped() {
        let tree = vec![
            item(1, "Root", 0),
            item(2, "Orphan", 99),
            item(3, "CycleA", 4),
            item(4, "CycleB", 3),
            item(5, "SelfLoop", 5),
        ];
        let out = normalize(&tree, &NoopFilter).unwrap();
        assert_eq!(labels(&out), vec!["Root", "Orphan"]);
    }

    fn chain(depth: u64) -> Vec<SourceItem> {
        (1..=depth).map(|id| item(id, "Level", id - 1)).collect()
    }

    #[test]
    fn depth_limit_is_inclusive() {
        let out = normalize(&chain(MAX_TREE_DEPTH as u64), &NoopFilter).unwrap();
        assert_eq!(out.len(), 1);

        let err = normalize(&chain(MAX_TREE_DEPTH as u64 + 1), &NoopFilter).unwrap_err();
        assert!(matches!(
            err,
            SyncError::TreeTooDeep { depth, max } if depth == MAX_TREE_DEPTH + 1 && max == MAX_TREE_DEPTH
        ));
    }

    #[test]
    fn very_deep_tree_is_refused_without_recursing() {
        let err = normalize(&chain(100_000), &NoopFilter).unwrap_err();
        assert!(matches!(err, SyncError::TreeTooDeep { .. }));
    }

    #[test]
    fn optional_fields_and_entities() {
        let mut raw = item(1, "Tom &amp; Jerry &#8211; &#x41;", 0);
        raw.url = "/search?a=1&amp;b=2".into();
        raw.classes = vec!["".into(), "menu-item".into(), " active ".into()];
        raw.target = Some(String::new());
        raw.extra.insert("icon".into(), json!("star"));
        raw.extra.insert("children".into(), json!("shadowed"));

        let out = normalize(&[raw], &NoopFilter).unwrap();
        assert_eq!(out[0].label, "Tom & Jerry \u{2013} A");
        assert_eq!(out[0].url, "/search?a=1&b=2");
        assert_eq!(out[0].classes.as_deref(), Some("menu-item active"));
        assert_eq!(out[0].target, None);
        assert_eq!(out[0].extra.get("icon"), Some(&json!("star")));
        assert!(!out[0].extra.contains_key("children"));
    }

    #[test]
    fn decoding_is_single_pass() {
        assert_eq!(decode_entities("&amp;lt;b&amp;gt;"), "&lt;b&gt;");
        assert_eq!(decode_entities("AT&T & co"), "AT&T & co");
        assert_eq!(decode_entities("&bogus; &#xZZ;"), "&bogus; &#xZZ;");
    }

    #[test]
    fn escaped_and_plain_trees_compare_equal() {
        let escaped = vec![item(1, "Q&amp;A", 0)];
        let plain = vec![item(1, "Q&A", 0)];
        assert_eq!(
            canonical_json(&normalize(&escaped, &NoopFilter).unwrap()).unwrap(),
            canonical_json(&normalize(&plain, &NoopFilter).unwrap()).unwrap()
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        let mut tree = vec![item(1, "A", 0), item(2, "B", 1)];
        tree[0].extra.insert("z".into(), json!({"b": 1, "a": 2}));
        let first = canonical_json(&normalize(&tree, &NoopFilter).unwrap()).unwrap();
        let second = canonical_json(&normalize(&tree, &NoopFilter).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn snapshot_and_payload_share_canonical_form() {
        let out = normalize(&[item(1, "A", 0)], &NoopFilter).unwrap();
        let payload = vec![json!({"url": "/1", "children": [], "label": "A"})];
        assert_eq!(canonical_json(&out).unwrap(), canonical_value_json(&payload));
    }

    #[test]
    fn filter_chain_runs_in_order() {
        let chain = FilterChain::new()
            .with(|mut item: NormalizedItem, raw: &SourceItem| {
                item.extra.insert("id".into(), json!(raw.id));
                item
            })
            .with(|mut item: NormalizedItem, _raw: &SourceItem| {
                let seen = item.extra.contains_key("id");
                item.extra.insert("saw_id".into(), json!(seen));
                item
            });
        assert_eq!(chain.len(), 2);

        let out = normalize(&[item(7, "A", 0)], &chain).unwrap();
        assert_eq!(out[0].extra.get("id"), Some(&json!(7)));
        assert_eq!(out[0].extra.get("saw_id"), Some(&json!(true)));
    }
}
