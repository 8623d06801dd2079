//! # wp-relocate CLI (`wprl`)
//!
//! The `wprl` binary drives the relocation stages one at a time or all
//! together.
//!
//! ## Usage
//!
//! ```bash
//! wprl --config ./config/wprl.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `wprl init` | Create the SQLite redirect table |
//! | `wprl analyze` | Extract and classify image references from published content |
//! | `wprl fetch` | Download referenced assets into the local tree |
//! | `wprl redirects` | Persist redirect rules and render nginx/apache configs |
//! | `wprl render` | Re-render proxy configs from stored rules |
//! | `wprl rewrite` | Rewrite content to the relocated URLs |
//! | `wprl lookup <path>` | Show the redirect stored for a legacy path |
//! | `wprl stats` | Redirect and asset tree summary |
//! | `wprl run` | All stages in order |
//!
//! Logs go to stderr and are controlled with `RUST_LOG`
//! (e.g. `RUST_LOG=wp_relocate=debug`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use wp_relocate::progress::ProgressMode;
use wp_relocate::{config, migrate, pipeline, stats};

/// wp-relocate: move WordPress media onto a local asset tree, rewrite content
/// to point at it, and generate redirects for the old URLs.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/wprl.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "wprl",
    about = "wp-relocate: relocate WordPress media and generate redirects",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/wprl.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a TTY, `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the redirect table. Safe to run repeatedly.
    Init,

    /// Extract and classify image references from published content.
    ///
    /// Writes `references.json` to the artifacts directory.
    Analyze,

    /// Download referenced assets into the local asset tree.
    ///
    /// Reads `references.json`, writes `fetch_results.json`. Assets already
    /// on disk are not downloaded again.
    Fetch {
        /// Only fetch the first N references.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Persist redirect rules and render proxy configs.
    ///
    /// Reads `fetch_results.json`. Rules whose legacy path is already stored
    /// are skipped, never overwritten.
    Redirects,

    /// Re-render nginx and apache configs from the stored rules.
    Render,

    /// Rewrite content to the relocated URLs.
    Rewrite {
        /// Report what would change without writing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the redirect stored for a legacy path.
    Lookup {
        /// Legacy path, e.g. `/wp-content/uploads/2023/09/photo.png`.
        path: String,
    },

    /// Redirect and asset tree summary.
    Stats,

    /// Run analyze, fetch, redirects, and rewrite in order.
    Run {
        /// Only fetch the first N references.
        #[arg(long)]
        limit: Option<usize>,

        /// Report rewrite changes without writing.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let progress = cli
        .progress
        .unwrap_or_else(ProgressMode::default_for_tty)
        .reporter();

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Analyze => {
            pipeline::run_analyze(&cfg, progress.as_ref()).await?;
        }
        Commands::Fetch { limit } => {
            pipeline::run_fetch(&cfg, limit, progress.as_ref()).await?;
        }
        Commands::Redirects => {
            pipeline::run_redirects(&cfg).await?;
        }
        Commands::Render => {
            pipeline::run_render(&cfg).await?;
        }
        Commands::Rewrite { dry_run } => {
            pipeline::run_rewrite(&cfg, dry_run).await?;
        }
        Commands::Lookup { path } => {
            pipeline::run_lookup(&cfg, &path).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Run { limit, dry_run } => {
            pipeline::run_all(&cfg, limit, dry_run, progress.as_ref()).await?;
        }
    }

    Ok(())
}
