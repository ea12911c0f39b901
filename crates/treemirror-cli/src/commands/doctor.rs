use anyhow::Result;
use treemirror_core::config::Config;
use treemirror_state::{db, entities, mirror, schema};

/// Print a health report. Returns whether every check passed.
pub fn run(config: &Config) -> Result<bool> {
    println!("treemirror doctor");
    println!("=================");
    println!();

    let mut all_ok = true;

    let db_path = config.db_path();
    print!("SQLite database ... ");
    if db_path.exists() {
        match db::open_with_storage_config(&db_path, &config.storage) {
            Ok(conn) => {
                match db::check_sqlite_health(&conn) {
                    Ok((true, _)) => println!("OK"),
                    Ok((false, detail)) => {
                        println!("WARN: {}", detail.unwrap_or_default());
                        all_ok = false;
                    }
                    Err(e) => {
                        println!("FAIL: {}", e);
                        all_ok = false;
                    }
                }

                print!("Schema version ... ");
                match schema::ensure_current(&conn) {
                    Ok(()) => println!("OK (v{})", schema::CURRENT_SCHEMA_VERSION),
                    Err(e) => {
                        println!("FAIL: {} - run `treemirror init`", e);
                        all_ok = false;
                    }
                }

                print!("Mirror store ... ");
                match mirror::is_initialized(&conn) {
                    Ok(true) => println!("OK"),
                    Ok(false) => {
                        println!("NOT INITIALIZED - syncs will be skipped");
                        all_ok = false;
                    }
                    Err(e) => {
                        println!("FAIL: {}", e);
                        all_ok = false;
                    }
                }

                print!("Entities ... ");
                match entities::list_entities(&conn) {
                    Ok(list) => println!("{}", list.len()),
                    Err(e) => {
                        println!("FAIL: {}", e);
                        all_ok = false;
                    }
                }
            }
            Err(e) => {
                println!("FAIL: {}", e);
                all_ok = false;
            }
        }
    } else {
        println!("MISSING - run `treemirror init`");
        all_ok = false;
    }

    println!();
    println!("Server:");
    println!("  Listen: {}:{}", config.server.bind, config.server.port);
    print!("  API token ... ");
    if config.server.api_token.is_some() {
        println!("set");
    } else {
        println!("not set (every request is trusted)");
    }
    print!("  Nonce secret ... ");
    if config.server.uses_default_nonce_secret() {
        println!("WARN: still the default, set server.nonce_secret");
        all_ok = false;
    } else {
        println!("OK");
    }

    println!();
    if all_ok {
        println!("All checks passed!");
    } else {
        println!("Some checks failed. See above for details.");
    }

    Ok(all_ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::init;
    use crate::commands::test_support::config_in;

    #[test]
    fn doctor_flags_missing_database_then_passes_after_init() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        assert!(!run(&config).unwrap());

        init::run(&config, true).unwrap();
        assert!(run(&config).unwrap());
    }

    #[test]
    fn doctor_flags_default_nonce_secret() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        config.server.nonce_secret = Config::default().server.nonce_secret;
        init::run(&config, true).unwrap();
        assert!(!run(&config).unwrap());
    }
}
