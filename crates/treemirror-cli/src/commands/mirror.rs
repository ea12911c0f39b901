use super::{open_db, print_json, read_json};
use anyhow::Result;
use serde_json::Value;
use std::path::PathBuf;
use tracing::info;
use treemirror_core::config::Config;
use treemirror_core::ports::MirrorStore;
use treemirror_core::types::{MirrorEntry, MirrorPayload};
use treemirror_state::mirror::{self, SqliteMirrorStore};

pub struct EntryArgs {
    pub storage_key: String,
    pub declared_key: String,
    pub name: String,
    pub payload: PathBuf,
    pub global: bool,
}

pub fn show(config: &Config) -> Result<()> {
    let conn = open_db(config)?;
    match SqliteMirrorStore::new(&conn).read()? {
        Some(entries) => print_json(&entries),
        None => {
            println!("Mirror store is not initialized.");
            Ok(())
        }
    }
}

pub fn set_initialized(config: &Config, initialized: bool) -> Result<()> {
    let conn = open_db(config)?;
    if initialized {
        mirror::initialize(&conn)?;
        println!("Mirror store initialized.");
    } else {
        mirror::deinitialize(&conn)?;
        println!("Mirror store cleared and marked uninitialized.");
    }
    info!(initialized, "Mirror store state changed");
    Ok(())
}

pub fn set(config: &Config, args: EntryArgs) -> Result<()> {
    let data: Vec<Value> = read_json(&args.payload)?;
    let conn = open_db(config)?;
    let entry = MirrorEntry {
        storage_key: args.storage_key,
        declared_key: args.declared_key,
        name: args.name,
        global: args.global,
        payload: MirrorPayload::json(data),
    };
    mirror::put_entry(&conn, &entry)?;
    println!(
        "Wrote mirror entry `{}` ({} items)",
        entry.storage_key,
        entry.payload.data.len()
    );
    Ok(())
}

pub fn remove(config: &Config, storage_key: &str) -> Result<()> {
    let conn = open_db(config)?;
    if mirror::remove_entry(&conn, storage_key)? {
        println!("Removed mirror entry `{}`", storage_key);
    } else {
        println!("No mirror entry `{}`", storage_key);
    }
    Ok(())
}
