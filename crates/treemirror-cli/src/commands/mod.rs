pub mod doctor;
pub mod entity;
pub mod init;
pub mod mirror;
pub mod poll;
pub mod serve;
pub mod signals;
pub mod status;

use anyhow::{Context, Result, bail};
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use std::io::Read;
use std::path::Path;
use treemirror_core::config::Config;
use treemirror_server::actor::RequestActor;
use treemirror_server::stores::SqliteStores;
use treemirror_state::{db, schema};
use treemirror_sync::SyncContext;

/// Open the state database, refusing to create one implicitly.
pub(crate) fn open_db(config: &Config) -> Result<Connection> {
    let db_path = config.db_path();
    if !db_path.exists() {
        bail!(
            "No state database at {}. Run `treemirror init` first.",
            db_path.display()
        );
    }
    let conn = db::open_with_storage_config(&db_path, &config.storage)?;
    schema::ensure_current(&conn)?;
    Ok(conn)
}

/// Run `body` with a sync context acting as the local operator.
pub(crate) fn with_admin_context<T>(
    config: &Config,
    conn: &Connection,
    body: impl FnOnce(&RequestActor, SyncContext<'_>) -> Result<T>,
) -> Result<T> {
    let actor = RequestActor::admin(config.server.nonce_secret.clone());
    let stores = SqliteStores::new(conn);
    body(&actor, stores.context(&actor, config))
}

/// Read a JSON document from a file, or stdin for `-`.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?
    };
    serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {}", path.display()))
}

pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
