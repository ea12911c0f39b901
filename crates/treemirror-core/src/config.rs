use crate::constants;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub signals: SignalsConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u32,
    #[serde(default = "default_cache_size")]
    pub cache_size: i32,
}

/// Per-topic signal lifetimes, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalsConfig {
    #[serde(default = "default_in_progress_ttl")]
    pub in_progress_ttl_secs: u64,
    #[serde(default = "default_outcome_ttl")]
    pub outcome_ttl_secs: u64,
    #[serde(default = "default_sync_enabled_ttl")]
    pub sync_enabled_ttl_secs: u64,
    #[serde(default = "default_override_ttl")]
    pub override_ttl_secs: u64,
    #[serde(default = "default_notice_ttl")]
    pub notice_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// `global` flag for mirror entries created from scratch.
    #[serde(default = "default_global_entries")]
    pub global_entries: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token that grants the admin capability. Unset means every
    /// request is trusted, so keep the bind on loopback.
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_nonce_secret")]
    pub nonce_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_data_dir() -> String {
    "~/.treemirror".into()
}
fn default_busy_timeout() -> u32 {
    5000
}
fn default_cache_size() -> i32 {
    -16000
}
fn default_in_progress_ttl() -> u64 {
    60
}
fn default_outcome_ttl() -> u64 {
    300
}
fn default_sync_enabled_ttl() -> u64 {
    3600
}
fn default_override_ttl() -> u64 {
    300
}
fn default_notice_ttl() -> u64 {
    3600
}
fn default_global_entries() -> bool {
    true
}
fn default_poll_interval() -> u64 {
    constants::DEFAULT_POLL_INTERVAL_MS
}
fn default_max_polls() -> u32 {
    constants::DEFAULT_MAX_POLLS
}
fn default_bind() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    9300
}
fn default_nonce_secret() -> String {
    "change-me".into()
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            busy_timeout_ms: default_busy_timeout(),
            cache_size: default_cache_size(),
        }
    }
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            in_progress_ttl_secs: default_in_progress_ttl(),
            outcome_ttl_secs: default_outcome_ttl(),
            sync_enabled_ttl_secs: default_sync_enabled_ttl(),
            override_ttl_secs: default_override_ttl(),
            notice_ttl_secs: default_notice_ttl(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            global_entries: default_global_entries(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            max_polls: default_max_polls(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            api_token: None,
            nonce_secret: default_nonce_secret(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl ServerConfig {
    /// Nonces minted with the shipped secret are forgeable by anyone.
    pub fn uses_default_nonce_secret(&self) -> bool {
        self.nonce_secret == default_nonce_secret()
    }
}

impl Config {
    /// Load configuration with layered precedence:
    /// 1. Environment variables `TREEMIRROR_<SECTION>_<KEY>` (highest priority)
    /// 2. Explicit config file (from `--config`)
    /// 3. Project config: `<root>/.treemirror/config.toml`
    /// 4. Global config: `~/.treemirror/config.toml`
    /// 5. Built-in defaults (lowest priority)
    ///
    /// Only fields explicitly set in a higher-priority file override lower layers.
    pub fn load(root: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_file(root, None)
    }

    /// Load configuration with an explicit config file path.
    pub fn load_with_file(
        root: Option<&Path>,
        config_file: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let mut merged = toml::Value::Table(toml::map::Map::new());

        if let Some(home) = dirs::home_dir() {
            let global_path = home.join(constants::DEFAULT_DATA_DIR).join("config.toml");
            if global_path.exists() {
                let raw = load_toml_value(&global_path)?;
                merge_toml_values(&mut merged, &raw);
            }
        }

        if let Some(root) = root {
            let project_path = root.join(constants::PROJECT_CONFIG_FILE);
            if project_path.exists() {
                let raw = load_toml_value(&project_path)?;
                merge_toml_values(&mut merged, &raw);
            }
        }

        if let Some(cf) = config_file {
            if !cf.exists() {
                return Err(ConfigError::NotFound {
                    path: cf.display().to_string(),
                });
            }
            let raw = load_toml_value(cf)?;
            merge_toml_values(&mut merged, &raw);
        }

        let config_str =
            toml::to_string(&merged).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let mut config: Config =
            toml::from_str(&config_str).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        apply_env_overrides(&mut config);
        config.normalize();
        config.storage.data_dir = expand_tilde(&config.storage.data_dir);

        Ok(config)
    }

    /// Clamp values that would break the sync protocol back to their defaults.
    fn normalize(&mut self) {
        self.signals.in_progress_ttl_secs = clamp_min_u64_with_warning(
            self.signals.in_progress_ttl_secs,
            1,
            default_in_progress_ttl(),
            "signals.in_progress_ttl_secs",
        );
        self.signals.outcome_ttl_secs = clamp_min_u64_with_warning(
            self.signals.outcome_ttl_secs,
            1,
            default_outcome_ttl(),
            "signals.outcome_ttl_secs",
        );
        self.signals.sync_enabled_ttl_secs = clamp_min_u64_with_warning(
            self.signals.sync_enabled_ttl_secs,
            1,
            default_sync_enabled_ttl(),
            "signals.sync_enabled_ttl_secs",
        );
        self.signals.override_ttl_secs = clamp_min_u64_with_warning(
            self.signals.override_ttl_secs,
            1,
            default_override_ttl(),
            "signals.override_ttl_secs",
        );
        self.signals.notice_ttl_secs = clamp_min_u64_with_warning(
            self.signals.notice_ttl_secs,
            1,
            default_notice_ttl(),
            "signals.notice_ttl_secs",
        );
        self.poll.interval_ms = clamp_min_u64_with_warning(
            self.poll.interval_ms,
            50,
            default_poll_interval(),
            "poll.interval_ms",
        );
        if self.poll.max_polls == 0 {
            warn!(
                field = "poll.max_polls",
                "max_polls must be at least 1; using default"
            );
            self.poll.max_polls = default_max_polls();
        }
        self.server.api_token = self
            .server
            .api_token
            .as_ref()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        if self.server.nonce_secret.trim().is_empty() {
            self.server.nonce_secret = default_nonce_secret();
        }
        self.logging.level = self.logging.level.trim().to_ascii_lowercase();
    }

    /// Path of the SQLite database holding tree, mirror and signal tables.
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir).join(constants::STATE_DB_FILE)
    }
}

/// Load a TOML file as a raw `toml::Value` (preserving only explicitly-set fields).
fn load_toml_value(path: &Path) -> Result<toml::Value, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    content
        .parse::<toml::Value>()
        .map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Deep-merge `overlay` into `base`. Only keys present in `overlay` are written.
fn merge_toml_values(base: &mut toml::Value, overlay: &toml::Value) {
    if let (toml::Value::Table(base_map), toml::Value::Table(overlay_map)) = (base, overlay) {
        for (key, overlay_val) in overlay_map {
            if let Some(base_val) = base_map.get_mut(key) {
                if base_val.is_table() && overlay_val.is_table() {
                    merge_toml_values(base_val, overlay_val);
                } else {
                    *base_val = overlay_val.clone();
                }
            } else {
                base_map.insert(key.clone(), overlay_val.clone());
            }
        }
    }
}

/// Apply environment variable overrides to config fields.
/// Convention: `TREEMIRROR_<SECTION>_<KEY>` in UPPER_SNAKE_CASE.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(v) = std::env::var("TREEMIRROR_STORAGE_DATA_DIR") {
        config.storage.data_dir = v;
    }
    if let Ok(v) = std::env::var("TREEMIRROR_STORAGE_BUSY_TIMEOUT_MS")
        && let Ok(n) = v.parse()
    {
        config.storage.busy_timeout_ms = n;
    }
    if let Ok(v) = std::env::var("TREEMIRROR_SIGNALS_OVERRIDE_TTL_SECS")
        && let Ok(n) = v.parse()
    {
        config.signals.override_ttl_secs = n;
    }
    if let Ok(v) = std::env::var("TREEMIRROR_SIGNALS_OUTCOME_TTL_SECS")
        && let Ok(n) = v.parse()
    {
        config.signals.outcome_ttl_secs = n;
    }
    if let Ok(v) = std::env::var("TREEMIRROR_SYNC_GLOBAL_ENTRIES")
        && let Some(flag) = parse_bool(&v)
    {
        config.sync.global_entries = flag;
    }
    if let Ok(v) = std::env::var("TREEMIRROR_POLL_INTERVAL_MS")
        && let Ok(n) = v.parse()
    {
        config.poll.interval_ms = n;
    }
    if let Ok(v) = std::env::var("TREEMIRROR_POLL_MAX_POLLS")
        && let Ok(n) = v.parse()
    {
        config.poll.max_polls = n;
    }
    if let Ok(v) = std::env::var("TREEMIRROR_SERVER_BIND") {
        config.server.bind = v;
    }
    if let Ok(v) = std::env::var("TREEMIRROR_SERVER_PORT")
        && let Ok(n) = v.parse()
    {
        config.server.port = n;
    }
    if let Ok(v) = std::env::var("TREEMIRROR_SERVER_API_TOKEN") {
        config.server.api_token = Some(v);
    }
    if let Ok(v) = std::env::var("TREEMIRROR_SERVER_NONCE_SECRET") {
        config.server.nonce_secret = v;
    }
    if let Ok(v) = std::env::var("TREEMIRROR_LOGGING_LEVEL") {
        config.logging.level = v;
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn clamp_min_u64_with_warning(value: u64, min: u64, fallback: u64, field: &str) -> u64 {
    if value < min {
        warn!(field, value, min, fallback, "config value below minimum; using default");
        fallback
    } else {
        value
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest).to_string_lossy().to_string();
    }
    if path == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home.to_string_lossy().to_string();
    }
    path.to_string()
}
