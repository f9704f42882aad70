//! # Record Cache CLI (`rcache`)
//!
//! The `rcache` binary harvests a repository into the cache and answers
//! protocol requests from it.
//!
//! ## Usage
//!
//! ```bash
//! rcache --config ./config/rcache.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rcache init` | Create the SQLite database and run schema migrations |
//! | `rcache update` | Run one harvesting cycle now |
//! | `rcache run` | Harvest on a schedule until Ctrl-C |
//! | `rcache polling <on\|off>` | Enable or disable remote polling |
//! | `rcache prune` | Delete superseded content files |
//! | `rcache stats` | Show cache statistics |
//! | `rcache get-record <id> <prefix>` | Print one cached record |
//! | `rcache identify` | Print the cached identify descriptor |
//! | `rcache formats` | List metadata formats |
//! | `rcache list-records --prefix <p>` | List records (or identifiers) |
//! | `rcache list-sets` | List sets |
//! | `rcache queue` | Dump the pending work queue |
//! | `rcache failures` | Show records that failed to harvest |

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use record_cache::responder::ListArgs;
use record_cache::{commands, config, migrate, stats};

/// Record Cache CLI: harvest a metadata repository into a local cache and
/// serve it back in resumable parts.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rcache.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "rcache",
    about = "Record Cache: a harvesting cache for metadata repositories",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/rcache.toml`.
    #[arg(long, global = true, default_value = "./config/rcache.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Run one harvesting cycle: drain the queue, poll the source, drain
    /// again and prune.
    Update,

    /// Harvest on a schedule until interrupted.
    ///
    /// Ctrl-C stops immediately; an open transaction is rolled back.
    Run,

    /// Enable or disable polling of the remote repository.
    ///
    /// With polling off, cycles still retry failed records.
    Polling {
        #[arg(value_enum)]
        state: Switch,
    },

    /// Delete content files superseded by newer harvests.
    Prune,

    /// Show cache statistics.
    Stats {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print one cached record with its commit datestamp.
    GetRecord {
        identifier: String,
        prefix: String,
    },

    /// Print the cached identify descriptor.
    Identify,

    /// List metadata formats, optionally only those of one item.
    Formats {
        #[arg(long)]
        identifier: Option<String>,
    },

    /// List records, following resumption tokens to the end.
    ListRecords {
        /// Metadata prefix (e.g. `oai_dc`).
        #[arg(long)]
        prefix: String,

        /// Only records in this set (or its subsets).
        #[arg(long)]
        set: Option<String>,

        /// Lower datestamp bound (YYYY-MM-DD or YYYY-MM-DDThh:mm:ssZ).
        #[arg(long)]
        from: Option<String>,

        /// Upper datestamp bound.
        #[arg(long)]
        until: Option<String>,

        /// Print headers only, like ListIdentifiers.
        #[arg(long)]
        identifiers: bool,
    },

    /// List all sets.
    ListSets,

    /// Dump the pending work queue.
    Queue,

    /// Show records that failed to harvest.
    Failures,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Update => {
            commands::run_update(&cfg).await?;
        }
        Commands::Run => {
            commands::run_daemon(&cfg).await?;
        }
        Commands::Polling { state } => {
            commands::run_polling(&cfg, matches!(state, Switch::On)).await?;
        }
        Commands::Prune => {
            commands::run_prune(&cfg).await?;
        }
        Commands::Stats { json } => {
            stats::run_stats(&cfg, json).await?;
        }
        Commands::GetRecord { identifier, prefix } => {
            commands::run_get_record(&cfg, &identifier, &prefix).await?;
        }
        Commands::Identify => {
            commands::run_identify(&cfg).await?;
        }
        Commands::Formats { identifier } => {
            commands::run_formats(&cfg, identifier.as_deref()).await?;
        }
        Commands::ListRecords {
            prefix,
            set,
            from,
            until,
            identifiers,
        } => {
            let args = ListArgs {
                metadata_prefix: Some(prefix),
                set,
                from,
                until,
                resumption_token: None,
            };
            commands::run_list_records(&cfg, args, identifiers).await?;
        }
        Commands::ListSets => {
            commands::run_list_sets(&cfg).await?;
        }
        Commands::Queue => {
            commands::run_queue(&cfg).await?;
        }
        Commands::Failures => {
            commands::run_failures(&cfg).await?;
        }
    }

    Ok(())
}
