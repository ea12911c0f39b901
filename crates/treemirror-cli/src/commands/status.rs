use super::{open_db, with_admin_context};
use anyhow::{Context, Result};
use treemirror_core::config::Config;
use treemirror_core::nonce;
use treemirror_sync::endpoints::{self, OverrideReport, StatusReport};

pub fn show(config: &Config, slug: &str) -> Result<()> {
    let conn = open_db(config)?;
    let report = with_admin_context(config, &conn, |_, ctx| Ok(endpoints::status(&ctx, slug)?))?;
    print_status(&report);
    Ok(())
}

pub fn set_override(config: &Config, slug: &str, enabled: bool) -> Result<()> {
    let conn = open_db(config)?;
    let report = apply_override(config, &conn, slug, enabled)?;
    if report.override_enabled {
        println!("Override enabled for {}. The next save writes unconditionally.", slug);
    } else {
        println!("Override cleared for {}.", slug);
    }
    Ok(())
}

pub(crate) fn apply_override(
    config: &Config,
    conn: &rusqlite::Connection,
    slug: &str,
    enabled: bool,
) -> Result<OverrideReport> {
    with_admin_context(config, conn, |actor, ctx| {
        let token = actor
            .nonce_for(&nonce::override_action(slug))
            .context("Local operator cannot mint nonces")?;
        Ok(endpoints::set_override(&ctx, slug, enabled, &token)?)
    })
}

fn print_status(report: &StatusReport) {
    println!("{}: {}", report.slug, report.notice.message());
    if report.notice.offers_override() {
        println!("  Run `treemirror override {}` and save again to force the write.", report.slug);
    }
    println!(
        "  Override: {}",
        if report.override_enabled { "on" } else { "off" }
    );
    match report.sync_enabled {
        Some(true) => println!("  In sync: yes"),
        Some(false) => println!("  In sync: no"),
        None => println!("  In sync: unknown"),
    }
    if report.poll {
        println!("  A sync result is waiting. Run `treemirror poll {}`.", report.slug);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::entity::save_tree;
    use crate::commands::init;
    use crate::commands::test_support::config_in;
    use treemirror_core::signals::OverrideEnabled;
    use treemirror_core::types::SourceItem;
    use treemirror_state::entities;

    #[test]
    fn override_round_trip_sets_and_clears_signal() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        init::run(&config, true).unwrap();
        let conn = open_db(&config).unwrap();
        entities::create_entity(&conn, "docs", "Docs").unwrap();

        assert!(apply_override(&config, &conn, "docs", true).unwrap().override_enabled);
        let enabled = with_admin_context(&config, &conn, |_, ctx| {
            Ok(ctx.signals.get::<OverrideEnabled>("docs")?)
        })
        .unwrap();
        assert_eq!(enabled, Some(true));

        // A successful save consumes the override.
        save_tree(&config, &conn, "docs", &[SourceItem::new(1, "Intro", "/intro")]).unwrap();
        let status = with_admin_context(&config, &conn, |_, ctx| Ok(endpoints::status(&ctx, "docs")?)).unwrap();
        assert!(!status.override_enabled);

        assert!(!apply_override(&config, &conn, "docs", false).unwrap().override_enabled);
    }

    #[test]
    fn override_for_unknown_entity_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        init::run(&config, true).unwrap();
        let conn = open_db(&config).unwrap();
        assert!(apply_override(&config, &conn, "ghost", true).is_err());
    }
}
