mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use treemirror_core::config::Config;

#[derive(Parser)]
#[command(
    name = "treemirror",
    version,
    about = "Keep a mirror store in step with hierarchical source trees",
    long_about = "treemirror normalizes source trees and writes them into a keyed mirror store,\n\
        refusing writes that would clobber edits made to the mirror by someone else.\n\n\
        Quick start:\n  \
        treemirror init\n  \
        treemirror entity create main-menu \"Main Menu\" --items menu.json\n  \
        treemirror status main-menu\n  \
        treemirror serve"
)]
struct Cli {
    /// Enable verbose logging (set log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to config file (default: .treemirror/config.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the state database and initialize the mirror store
    ///
    /// Example: treemirror init
    Init {
        /// Create tables but leave the mirror store uninitialized
        #[arg(long)]
        no_mirror: bool,
    },
    /// Check database health and configuration
    Doctor,
    /// Start the HTTP server
    ///
    /// Examples:
    ///   treemirror serve
    ///   treemirror serve --bind 0.0.0.0 --port 9400
    Serve {
        /// Bind address (default: server.bind from config)
        #[arg(long)]
        bind: Option<String>,

        /// Port (default: server.port from config)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Manage source entities and their trees
    Entity {
        #[command(subcommand)]
        command: EntityCommand,
    },
    /// Inspect or edit the mirror store directly
    ///
    /// Edits made here bypass conflict detection, the same way an out-of-band
    /// edit by the mirror's owner would.
    Mirror {
        #[command(subcommand)]
        command: MirrorCommand,
    },
    /// Show the sync status notice for an entity
    Status {
        slug: String,
    },
    /// Enable or disable the one-shot override for an entity
    ///
    /// Examples:
    ///   treemirror override main-menu
    ///   treemirror override main-menu --disable
    Override {
        slug: String,

        /// Clear the override instead of setting it
        #[arg(long)]
        disable: bool,
    },
    /// Wait for the pending sync of an entity to finish
    ///
    /// Examples:
    ///   treemirror poll main-menu
    ///   treemirror poll main-menu --server http://127.0.0.1:9300 --token s3cret
    Poll {
        slug: String,

        /// Poll a running server instead of the local database
        #[arg(long)]
        server: Option<String>,

        /// Bearer token for --server (default: server.api_token from config)
        #[arg(long)]
        token: Option<String>,
    },
    /// Inspect or prune sync signals
    Signals {
        #[command(subcommand)]
        command: SignalsCommand,
    },
}

#[derive(Subcommand)]
enum EntityCommand {
    /// List all entities
    List,
    /// Create an entity, optionally with an initial tree
    Create {
        slug: String,
        name: String,

        /// JSON file with an array of items ("-" for stdin)
        #[arg(long)]
        items: Option<PathBuf>,
    },
    /// Show an entity and its items
    Show { slug: String },
    /// Replace the tree of an entity and sync it
    SetTree {
        slug: String,

        /// JSON file with an array of items ("-" for stdin)
        items: PathBuf,
    },
    /// Delete an entity and its mirror entry
    Delete { slug: String },
}

#[derive(Subcommand)]
enum MirrorCommand {
    /// Print every mirror entry
    Show,
    /// Mark the mirror store as initialized
    Init,
    /// Drop every entry and mark the mirror store uninitialized
    Deinit,
    /// Write one entry verbatim
    Set {
        storage_key: String,

        /// JSON file with the payload array ("-" for stdin)
        payload: PathBuf,

        /// Declared key (default: the storage key)
        #[arg(long)]
        declared_key: Option<String>,

        /// Display name (default: the storage key)
        #[arg(long)]
        name: Option<String>,

        /// Make the entry visible everywhere
        #[arg(long)]
        global: bool,
    },
    /// Remove one entry
    Remove { storage_key: String },
}

#[derive(Subcommand)]
enum SignalsCommand {
    /// List live signals for an entity
    Show { slug: String },
    /// Delete expired signals
    Prune,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config_file = cli.config.as_deref().map(std::path::Path::new);
    let root = std::env::current_dir()?;
    let config = Config::load_with_file(Some(&root), config_file)?;

    match cli.command {
        Commands::Init { no_mirror } => commands::init::run(&config, !no_mirror)?,
        Commands::Doctor => {
            commands::doctor::run(&config)?;
        }
        Commands::Serve { bind, port } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            let port = port.unwrap_or(config.server.port);
            commands::serve::run(config, &bind, port)?;
        }
        Commands::Entity { command } => match command {
            EntityCommand::List => commands::entity::list(&config)?,
            EntityCommand::Create { slug, name, items } => {
                commands::entity::create(&config, &slug, &name, items.as_deref())?
            }
            EntityCommand::Show { slug } => commands::entity::show(&config, &slug)?,
            EntityCommand::SetTree { slug, items } => {
                commands::entity::set_tree(&config, &slug, &items)?
            }
            EntityCommand::Delete { slug } => commands::entity::delete(&config, &slug)?,
        },
        Commands::Mirror { command } => match command {
            MirrorCommand::Show => commands::mirror::show(&config)?,
            MirrorCommand::Init => commands::mirror::set_initialized(&config, true)?,
            MirrorCommand::Deinit => commands::mirror::set_initialized(&config, false)?,
            MirrorCommand::Set {
                storage_key,
                payload,
                declared_key,
                name,
                global,
            } => commands::mirror::set(
                &config,
                commands::mirror::EntryArgs {
                    declared_key: declared_key.unwrap_or_else(|| storage_key.clone()),
                    name: name.unwrap_or_else(|| storage_key.clone()),
                    storage_key,
                    payload,
                    global,
                },
            )?,
            MirrorCommand::Remove { storage_key } => {
                commands::mirror::remove(&config, &storage_key)?
            }
        },
        Commands::Status { slug } => commands::status::show(&config, &slug)?,
        Commands::Override { slug, disable } => {
            commands::status::set_override(&config, &slug, !disable)?
        }
        Commands::Poll {
            slug,
            server,
            token,
        } => match server {
            Some(server) => {
                let token = token.or_else(|| config.server.api_token.clone());
                commands::poll::run_remote(&config, &server, token.as_deref(), &slug)?
            }
            None => commands::poll::run_local(&config, &slug)?,
        },
        Commands::Signals { command } => match command {
            SignalsCommand::Show { slug } => commands::signals::show(&config, &slug)?,
            SignalsCommand::Prune => commands::signals::prune(&config)?,
        },
    }

    Ok(())
}
