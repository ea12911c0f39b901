use super::open_db;
use anyhow::Result;
use treemirror_core::config::Config;
use treemirror_core::signals::SignalStore;
use treemirror_state::signals::SqliteSignalBackend;

pub fn show(config: &Config, slug: &str) -> Result<()> {
    let conn = open_db(config)?;
    let live = SqliteSignalBackend::new(&conn).live_for_key(slug)?;
    if live.is_empty() {
        println!("No live signals for {}.", slug);
        return Ok(());
    }
    for (topic, value) in live {
        println!("{:<24} {}", topic, value);
    }
    Ok(())
}

pub fn prune(config: &Config) -> Result<()> {
    let conn = open_db(config)?;
    let backend = SqliteSignalBackend::new(&conn);
    let removed = SignalStore::new(&backend, config.signals.clone()).prune_expired()?;
    println!("Pruned {} expired signals", removed);
    Ok(())
}
