//! rowsync CLI
//!
//! Command-line tools for inspecting and repairing a rowsync local store.
//!
//! # Commands
//!
//! - `status` - Pending row counts and checkpoints per table
//! - `checkpoints` - List every pull checkpoint
//! - `reset` - Rewind a checkpoint so the next pull starts over
//! - `clear` - Delete checkpoints

mod commands;

use clap::{Parser, Subcommand};
use rowsync_protocol::ResetScope;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// rowsync local store tools.
#[derive(Parser)]
#[command(name = "rowsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the SQLite database file
    #[arg(global = true, short, long)]
    db: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show pending row counts and checkpoints per table
    Status {
        /// Tables to report, comma separated (default: every synced table)
        #[arg(short, long, value_delimiter = ',')]
        tables: Vec<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List every pull checkpoint
    Checkpoints {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Rewind a checkpoint so the next pull starts over
    Reset {
        /// Table whose checkpoint is reset
        #[arg(short, long)]
        table: String,

        /// Filter set as JSON (default: no filters)
        #[arg(short, long)]
        filters: Option<String>,

        /// Cursor to rewind (all, synced, deleted)
        #[arg(short, long, default_value = "all")]
        scope: ResetScope,
    },

    /// Delete checkpoints of a table
    Clear {
        /// Table whose checkpoints are deleted
        #[arg(short, long)]
        table: String,

        /// Only the checkpoint of this filter set, as JSON
        #[arg(short, long)]
        filters: Option<String>,
    },

    /// Show version information
    Version,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Status { tables, format } => {
            let path = cli.db.ok_or("Database path required for status")?;
            commands::status::run(&path, &tables, &format).await?;
        }
        Commands::Checkpoints { format } => {
            let path = cli.db.ok_or("Database path required for checkpoints")?;
            commands::checkpoints::run(&path, &format).await?;
        }
        Commands::Reset {
            table,
            filters,
            scope,
        } => {
            let path = cli.db.ok_or("Database path required for reset")?;
            commands::reset::run(&path, &table, filters.as_deref(), scope).await?;
        }
        Commands::Clear { table, filters } => {
            let path = cli.db.ok_or("Database path required for clear")?;
            commands::clear::run(&path, &table, filters.as_deref()).await?;
        }
        Commands::Version => {
            println!("rowsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
