//! # Search Harness CLI (`sidx`)
//!
//! The `sidx` binary manages search indexes defined in a TOML configuration
//! file: it applies index definitions, tracks and indexes datasource items,
//! runs queries, and sweeps the per-server task queue.
//!
//! ## Usage
//!
//! ```bash
//! sidx --config ./config/sidx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sidx init` | Create the SQLite database and metadata tables |
//! | `sidx status` | Show per-index item counts and pending tasks |
//! | `sidx sync [index]` | Apply definitions, track datasources, index pending items |
//! | `sidx index <index>` | Index pending items only |
//! | `sidx reindex <index>` | Mark all items for reindexing |
//! | `sidx clear <index>` | Delete stored items and mark all for reindexing |
//! | `sidx search <index> [keys]` | Run a query |
//! | `sidx tasks` | List (or delete) pending tasks |
//! | `sidx cron` | Execute pending tasks, then index one batch per index |
//! | `sidx schema <index>` | Print the storage layout of an index |
//! | `sidx uninstall` | Drop all search tables |
//!
//! ## Examples
//!
//! ```bash
//! sidx init
//! sidx sync
//! sidx search content "solar panels" --filter "category = article" --facet category
//! sidx search content --sort price:desc --limit 5 --json
//! sidx cron
//! ```

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use search_harness::commands::{self, SearchOptions};
use search_harness::config;
use search_harness::indexing::Engine;
use search_harness::migrate;
use search_harness::progress::ProgressMode;
use search_harness::status;

/// Search Harness CLI: pluggable search indexing and querying on SQLite.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/sidx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "sidx",
    about = "Search Harness: pluggable search indexing and querying on SQLite",
    version,
    long_about = "Search Harness indexes JSON documents from configured datasources into \
    search servers (SQLite tables or in-memory storage) and answers fulltext, filtered, \
    sorted and faceted queries. Backend mutations that cannot run are recorded in a durable \
    task queue and replayed in order by `sidx cron`."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sidx.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to human when stderr is a terminal.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database.
    ///
    /// Creates the SQLite database file and the metadata tables. Safe to
    /// run repeatedly.
    Init,

    /// Show per-index item counts and pending tasks per server.
    Status,

    /// Apply index definitions, track datasource changes, and index pending items.
    ///
    /// Without an index, also removes indexes no longer in the configuration.
    Sync {
        /// Only sync this index.
        index: Option<String>,

        /// Maximum number of items to index per index.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Index pending items of one index.
    Index {
        index: String,

        /// Maximum number of items to index.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Mark every item of an index for reindexing. Stored data stays searchable.
    Reindex { index: String },

    /// Delete every stored item of an index and mark all items for reindexing.
    Clear { index: String },

    /// Search an index.
    Search {
        index: String,

        /// Fulltext keys. Quote phrases, prefix `-` to negate, `OR` for alternatives.
        keys: Option<String>,

        /// Restrict fulltext matching to these fields.
        #[arg(long = "field")]
        fields: Vec<String>,

        /// Filter as `field OP value` (`=`, `<>`, `<`, `<=`, `>`, `>=`, `IN a,b`, `BETWEEN a,b`).
        #[arg(long = "filter")]
        filters: Vec<String>,

        /// Facet as `field[:or][:missing]`.
        #[arg(long = "facet")]
        facets: Vec<String>,

        /// Sort as `field[:asc|:desc]`. Repeat for tiebreakers.
        #[arg(long = "sort")]
        sorts: Vec<String>,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long)]
        limit: Option<usize>,

        /// Match keywords as substrings, overriding the server setting.
        #[arg(long)]
        partial: bool,

        /// Print the result set as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List pending tasks.
    Tasks {
        /// Only this server.
        #[arg(long)]
        server: Option<String>,

        /// Delete the pending tasks instead of listing them.
        #[arg(long)]
        clear: bool,
    },

    /// Execute pending tasks, then index one batch per index.
    Cron,

    /// Print the storage layout of an index as JSON.
    Schema { index: String },

    /// Drop every search table, including queued tasks and tracking data.
    Uninstall,

    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "sidx", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let engine = Engine::from_config(&cfg).await?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();

    match cli.command {
        Commands::Status => status::run_status(&engine, &cfg.db.path).await?,
        Commands::Sync { index, limit } => {
            commands::run_sync(&engine, index.as_deref(), limit, progress.as_ref()).await?
        }
        Commands::Index { index, limit } => {
            commands::run_index(&engine, &index, limit, progress.as_ref()).await?
        }
        Commands::Reindex { index } => commands::run_reindex(&engine, &index).await?,
        Commands::Clear { index } => commands::run_clear(&engine, &index).await?,
        Commands::Search {
            index,
            keys,
            fields,
            filters,
            facets,
            sorts,
            offset,
            limit,
            partial,
            json,
        } => {
            let options = SearchOptions {
                keys,
                fields,
                filters,
                facets,
                sorts,
                offset,
                limit,
                partial: partial.then_some(true),
                json,
            };
            commands::run_search(&engine, &index, &options).await?
        }
        Commands::Tasks { server, clear } => {
            commands::run_tasks(&engine, server.as_deref(), clear).await?
        }
        Commands::Cron => commands::run_cron(&engine, progress.as_ref()).await?,
        Commands::Schema { index } => commands::run_schema(&engine, &index).await?,
        Commands::Uninstall => commands::run_uninstall(&engine).await?,
        Commands::Init | Commands::Completions { .. } => {}
    }

    engine.pool().close().await;
    Ok(())
}
