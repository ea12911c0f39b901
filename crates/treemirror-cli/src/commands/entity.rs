use super::{open_db, print_json, read_json, with_admin_context};
use anyhow::{Context, Result, bail};
use rusqlite::Connection;
use std::path::Path;
use tracing::info;
use treemirror_core::config::Config;
use treemirror_core::types::{SourceItem, TreeEvent};
use treemirror_state::entities;
use treemirror_sync::SyncSession;
use treemirror_sync::deletion::DeletionOutcome;
use treemirror_sync::queue::DrainReport;
use treemirror_sync::session::Handled;

pub fn list(config: &Config) -> Result<()> {
    let conn = open_db(config)?;
    let list = entities::list_entities(&conn)?;
    if list.is_empty() {
        println!("No entities.");
        return Ok(());
    }
    for entity in list {
        println!("{:<24} {}", entity.slug, entity.name);
    }
    Ok(())
}

pub fn create(config: &Config, slug: &str, name: &str, items: Option<&Path>) -> Result<()> {
    if slug.trim().is_empty() {
        bail!("slug must not be empty");
    }
    let items: Vec<SourceItem> = match items {
        Some(path) => read_json(path)?,
        None => Vec::new(),
    };
    let conn = open_db(config)?;
    let report = create_entity(config, &conn, slug, name, &items)?;
    println!("Created {}", slug);
    print_report(&report);
    Ok(())
}

pub fn show(config: &Config, slug: &str) -> Result<()> {
    let conn = open_db(config)?;
    let entity = entities::get_by_slug(&conn, slug)?
        .with_context(|| format!("No entity with slug `{}`", slug))?;
    let items = entities::load_items(&conn, entity.entity_id)?;
    print_json(&serde_json::json!({ "entity": entity, "items": items }))
}

pub fn set_tree(config: &Config, slug: &str, items: &Path) -> Result<()> {
    let items: Vec<SourceItem> = read_json(items)?;
    let conn = open_db(config)?;
    let report = save_tree(config, &conn, slug, &items)?;
    print_report(&report);
    Ok(())
}

pub fn delete(config: &Config, slug: &str) -> Result<()> {
    let conn = open_db(config)?;
    match delete_entity(config, &conn, slug)? {
        DeletionOutcome::Removed { storage_key } => {
            println!("Deleted {} and mirror entry `{}`", slug, storage_key)
        }
        DeletionOutcome::NotFound => println!("Deleted {} (no mirror entry)", slug),
        DeletionOutcome::MirrorUnavailable => {
            println!("Deleted {} (mirror store not initialized)", slug)
        }
        DeletionOutcome::Unauthorized => println!("Deleted {} (mirror left untouched)", slug),
    }
    Ok(())
}

fn create_entity(
    config: &Config,
    conn: &Connection,
    slug: &str,
    name: &str,
    items: &[SourceItem],
) -> Result<DrainReport> {
    let entity_id = entities::create_entity(conn, slug, name)?;
    info!(slug, entity_id, "Entity created");
    with_admin_context(config, conn, |actor, ctx| {
        let mut session = SyncSession::new(ctx, actor.origin);
        session.handle(TreeEvent::Created(entity_id))?;
        for event in entities::replace_items(conn, entity_id, items)? {
            session.handle(event)?;
        }
        Ok(session.finish())
    })
}

pub(crate) fn save_tree(
    config: &Config,
    conn: &Connection,
    slug: &str,
    items: &[SourceItem],
) -> Result<DrainReport> {
    let entity = entities::get_by_slug(conn, slug)?
        .with_context(|| format!("No entity with slug `{}`", slug))?;
    with_admin_context(config, conn, |actor, ctx| {
        let mut session = SyncSession::new(ctx, actor.origin);
        session.handle(TreeEvent::Changed(entity.entity_id))?;
        for event in entities::replace_items(conn, entity.entity_id, items)? {
            session.handle(event)?;
        }
        Ok(session.finish())
    })
}

fn delete_entity(config: &Config, conn: &Connection, slug: &str) -> Result<DeletionOutcome> {
    let entity = entities::get_by_slug(conn, slug)?
        .with_context(|| format!("No entity with slug `{}`", slug))?;
    let handled = with_admin_context(config, conn, |actor, ctx| {
        let mut session = SyncSession::new(ctx, actor.origin);
        Ok(session.handle(TreeEvent::Deleting(entity.entity_id, entity.metadata()))?)
    })?;
    entities::delete_entity(conn, entity.entity_id)?;
    Ok(match handled {
        Handled::Deleted(outcome) => outcome,
        _ => DeletionOutcome::Unauthorized,
    })
}

fn print_report(report: &DrainReport) {
    for summary in report.summaries() {
        println!(
            "  sync {}: {} ({})",
            summary.slug, summary.outcome, summary.reason
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::init;
    use crate::commands::test_support::config_in;
    use treemirror_core::ports::MirrorStore;
    use treemirror_state::mirror::SqliteMirrorStore;

    fn items(labels: &[&str]) -> Vec<SourceItem> {
        labels
            .iter()
            .enumerate()
            .map(|(i, label)| SourceItem::new(i as u64 + 1, *label, format!("/{label}")))
            .collect()
    }

    #[test]
    fn create_edit_delete_round_trip_through_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        init::run(&config, true).unwrap();
        let conn = open_db(&config).unwrap();

        let report = create_entity(&config, &conn, "main-menu", "Main", &items(&["A"])).unwrap();
        assert_eq!(report.succeeded(), 1);

        let report = save_tree(&config, &conn, "main-menu", &items(&["A", "B"])).unwrap();
        assert_eq!(report.succeeded(), 1);
        let entries = SqliteMirrorStore::new(&conn).read().unwrap().unwrap();
        assert_eq!(entries["main-menu"].payload.data.len(), 2);
        assert_eq!(entries["main-menu"].declared_key, "main_menu");

        assert_eq!(
            delete_entity(&config, &conn, "main-menu").unwrap(),
            DeletionOutcome::Removed {
                storage_key: "main-menu".into()
            }
        );
        assert!(SqliteMirrorStore::new(&conn).read().unwrap().unwrap().is_empty());
        assert!(entities::get_by_slug(&conn, "main-menu").unwrap().is_none());
    }

    #[test]
    fn missing_entity_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        init::run(&config, true).unwrap();
        let conn = open_db(&config).unwrap();
        assert!(save_tree(&config, &conn, "nope", &[]).is_err());
        assert!(delete_entity(&config, &conn, "nope").is_err());
    }
}
