use treemirror_core::constants::{ILLEGAL_KEY_CHAR, KEY_CHAR_SUBSTITUTE};
use treemirror_core::types::{MirrorEntries, MirrorEntry};

/// Map a slug to a declared key legal in the mirror's dot-path addressing.
pub fn sanitize_key(slug: &str) -> String {
    slug.chars()
        .map(|c| if c == ILLEGAL_KEY_CHAR { KEY_CHAR_SUBSTITUTE } else { c })
        .collect()
}

/// A declared key written before sanitization existed.
pub fn needs_migration(declared_key: &str) -> bool {
    declared_key.contains(ILLEGAL_KEY_CHAR)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedEntry<'a> {
    pub storage_key: &'a str,
    pub entry: &'a MirrorEntry,
}

impl ResolvedEntry<'_> {
    /// The entry lives under another entity's storage key.
    pub fn is_collision(&self, slug: &str) -> bool {
        self.storage_key != slug
    }
}

/// Find the mirror entry belonging to `slug`.
///
/// An exact storage-key match always wins. Otherwise the first entry, in
/// storage-key order, whose declared key equals `slug` is returned.
pub fn resolve_key<'a>(entries: &'a MirrorEntries, slug: &str) -> Option<ResolvedEntry<'a>> {
    if let Some((storage_key, entry)) = entries.get_key_value(slug) {
        return Some(ResolvedEntry {
            storage_key: storage_key.as_str(),
            entry,
        });
    }
    entries
        .iter()
        .find(|(_, entry)| entry.declared_key == slug)
        .map(|(storage_key, entry)| ResolvedEntry {
            storage_key: storage_key.as_str(),
            entry,
        })
}
