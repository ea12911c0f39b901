use anyhow::{Context, Result};
use treemirror_core::config::Config;
use treemirror_state::{db, mirror, schema};
use tracing::info;

pub fn run(config: &Config, init_mirror: bool) -> Result<()> {
    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create data directory")?;
    }

    let conn = db::open_with_storage_config(&db_path, &config.storage)?;
    schema::create_tables(&conn)?;
    if init_mirror {
        mirror::initialize(&conn)?;
    }
    let mirror_ready = mirror::is_initialized(&conn)?;

    println!("treemirror initialized");
    println!("  Database: {}", db_path.display());
    println!("  Schema:   v{}", schema::applied_version(&conn)?);
    println!(
        "  Mirror:   {}",
        if mirror_ready { "initialized" } else { "not initialized" }
    );
    if !mirror_ready {
        println!();
        println!("Syncs are skipped until `treemirror mirror init` runs.");
    }

    info!(db_path = %db_path.display(), mirror_ready, "State database initialized");
    Ok(())
}
