/// Marker for a root item in a source tree (`parent_id == ROOT_PARENT_ID`).
pub const ROOT_PARENT_ID: u64 = 0;

/// Character the mirror's addressing syntax rejects inside declared keys.
pub const ILLEGAL_KEY_CHAR: char = '-';

/// Replacement written in place of [`ILLEGAL_KEY_CHAR`].
pub const KEY_CHAR_SUBSTITUTE: char = '_';

/// Payload type tag written into every mirror entry.
pub const PAYLOAD_TYPE_JSON: &str = "json";

/// Current schema version for SQLite tables.
pub const SCHEMA_VERSION: u32 = 1;

/// Default data directory name under home.
pub const DEFAULT_DATA_DIR: &str = ".treemirror";

/// Project config file name.
pub const PROJECT_CONFIG_FILE: &str = ".treemirror/config.toml";

/// SQLite database file name.
pub const STATE_DB_FILE: &str = "state.db";

/// Key-derivation context for action nonces.
pub const NONCE_CONTEXT: &str = "treemirror 2026 action nonce v1";

/// Default number of unsuccessful completion polls before the client gives up.
pub const DEFAULT_MAX_POLLS: u32 = 15;

/// Default delay between completion polls.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Deepest source tree accepted for sync, counting a root item as depth 1.
/// Keeps stored payloads well inside serde_json's nesting limit.
pub const MAX_TREE_DEPTH: usize = 32;
