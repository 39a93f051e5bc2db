//! # Memory Agent CLI (`mem`)
//!
//! ## Usage
//!
//! ```bash
//! mem --config ./config/mem.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mem init` | Create the SQLite database and run schema migrations |
//! | `mem store <file>` | Store a document (new, or an update with `--base-version`) |
//! | `mem get <id>` | Print the latest live revision of a document |
//! | `mem search "<query>"` | Run a retrieve workflow |
//! | `mem delete <id> --version N` | Soft-delete a document |
//! | `mem purge <id>` | Physically remove every revision |
//! | `mem reconcile` | Repair the index from the object store |
//! | `mem resume` | Finish workflows interrupted by a restart |
//! | `mem health` | Report store reachability and configured engines |
//! | `mem serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! mem init
//! mem store runbooks/deploy.md --id deploy --meta team=infra --meta tags='["ops"]'
//! mem store runbooks/deploy.md --id deploy --base-version 1
//! mem search "how do I roll back a deploy" --strategy hybrid --filter team=infra
//! mem delete deploy --version 2
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use memory_agent::commands::{self, SearchArgs, StoreArgs};
use memory_agent::config::{self, DEFAULT_CONFIG_PATH};
use memory_agent::{logging, migrate, server};
use memory_agent_core::filter::parse_assignment;
use memory_agent_core::models::MetadataValue;

/// Memory Agent: fault-tolerant multi-strategy document memory for agents.
#[derive(Parser)]
#[command(
    name = "mem",
    about = "Memory Agent: durable document storage and multi-strategy retrieval for autonomous agents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Store a document from a file.
    Store {
        /// File holding the document content (UTF-8).
        file: PathBuf,

        /// `markdown` or `json`. Inferred from the extension when omitted.
        #[arg(long)]
        format: Option<String>,

        /// Metadata as `key=value`; values parse as JSON when they can.
        #[arg(long = "meta", value_parser = parse_metadata)]
        meta: Vec<(String, MetadataValue)>,

        /// Document id. A UUID is generated when omitted.
        #[arg(long)]
        id: Option<String>,

        /// The version this update is based on (0 for a new document).
        #[arg(long, default_value_t = 0)]
        base_version: u64,
    },

    /// Print a document.
    Get {
        id: String,
    },

    /// Search stored documents.
    Search {
        query: String,

        /// `auto`, `vector`, `reasoning`, `hybrid`, or `graph_rag`.
        #[arg(long)]
        strategy: Option<String>,

        /// Metadata equality filter as `key=value`; repeat to AND clauses.
        #[arg(long = "filter", value_parser = parse_metadata)]
        filters: Vec<(String, MetadataValue)>,

        #[arg(long)]
        limit: Option<usize>,

        /// Minimum cosine similarity for vector-bearing strategies.
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Soft-delete a document.
    Delete {
        id: String,

        /// The current version of the document.
        #[arg(long)]
        version: u64,
    },

    /// Physically remove every revision of a document.
    Purge {
        id: String,
    },

    /// Repair index entries from the object store.
    Reconcile,

    /// Resume workflows left unfinished by a previous process.
    Resume,

    /// Check store reachability and configured engines.
    Health,

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

fn parse_metadata(raw: &str) -> Result<(String, MetadataValue), String> {
    parse_assignment(raw)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Store {
            file,
            format,
            meta,
            id,
            base_version,
        } => {
            commands::run_store(
                &cfg,
                StoreArgs {
                    file: &file,
                    format: format.as_deref(),
                    metadata: meta,
                    id,
                    base_version,
                },
            )
            .await?;
        }
        Commands::Get { id } => {
            commands::run_get(&cfg, &id).await?;
        }
        Commands::Search {
            query,
            strategy,
            filters,
            limit,
            threshold,
        } => {
            commands::run_search(
                &cfg,
                SearchArgs {
                    query,
                    strategy,
                    filters,
                    limit,
                    threshold,
                },
            )
            .await?;
        }
        Commands::Delete { id, version } => {
            commands::run_delete(&cfg, &id, version).await?;
        }
        Commands::Purge { id } => {
            commands::run_purge(&cfg, &id).await?;
        }
        Commands::Reconcile => {
            commands::run_reconcile(&cfg).await?;
        }
        Commands::Resume => {
            commands::run_resume(&cfg).await?;
        }
        Commands::Health => {
            commands::run_health(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
