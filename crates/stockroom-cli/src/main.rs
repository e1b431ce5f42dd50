//! Stockroom CLI - inspect and drive the offline sync engine from a terminal
//!
//! Local edits are cached and queued; `stockroom sync` pushes them to the
//! remote store and `stockroom resolve` settles any conflicts it reports.

mod cli;
mod commands;
mod error;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, ConflictCommands, QueueCommands};
use crate::commands::common::resolve_db_path;
use crate::commands::completions::run_completions;
use crate::commands::conflicts::{run_conflicts_list, run_conflicts_show, run_resolve};
use crate::commands::entities::{run_delete, run_list, run_patch, run_put};
use crate::commands::queue::{run_queue_discard, run_queue_list};
use crate::commands::status::run_status;
use crate::commands::sync::{run_check, run_sync};
use crate::commands::wipe::run_wipe;
use crate::error::CliError;

const DEFAULT_LOG_FILTER: &str = "stockroom=info,stockroom_core=info";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Status { json } => run_status(json, &db_path).await?,
        Commands::Check => run_check(&db_path).await?,
        Commands::Sync { json } => run_sync(json, &db_path).await?,
        Commands::List { kind, json } => run_list(kind.into(), json, &db_path).await?,
        Commands::Put { kind, data } => run_put(kind.into(), data.as_deref(), &db_path).await?,
        Commands::Patch { kind, id, data } => {
            run_patch(kind.into(), &id, data.as_deref(), &db_path).await?;
        }
        Commands::Delete { kind, id } => run_delete(kind.into(), &id, &db_path).await?,
        Commands::Queue { command, json } => match command {
            Some(QueueCommands::Discard { id }) => run_queue_discard(&id, &db_path).await?,
            None => run_queue_list(json, &db_path).await?,
        },
        Commands::Conflicts { command, all, json } => match command {
            Some(ConflictCommands::Show { id, json }) => {
                run_conflicts_show(&id, json, &db_path).await?;
            }
            None => run_conflicts_list(all, json, &db_path).await?,
        },
        Commands::Resolve { id, strategy, data } => {
            run_resolve(&id, strategy.into(), data.as_deref(), &db_path).await?;
        }
        Commands::Wipe { yes } => run_wipe(yes, &db_path).await?,
        Commands::Completions { shell, output } => run_completions(shell, output.as_deref())?,
    }

    Ok(())
}
