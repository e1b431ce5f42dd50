use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use stockroom_core::{EntityKind, ResolutionStrategy};

#[derive(Parser)]
#[command(name = "stockroom")]
#[command(about = "Offline-first inventory cache with sync and conflict resolution")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show connection, queue and conflict status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Probe the remote store
    Check,
    /// Push queued changes and refresh the local cache
    Sync {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List cached records of one kind
    List {
        #[arg(value_enum)]
        kind: KindArg,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create a record from a JSON object (stdin when omitted)
    #[command(alias = "add")]
    Put {
        #[arg(value_enum)]
        kind: KindArg,
        data: Option<String>,
    },
    /// Update fields of a cached record from a JSON object (stdin when omitted)
    #[command(alias = "edit")]
    Patch {
        #[arg(value_enum)]
        kind: KindArg,
        id: String,
        data: Option<String>,
    },
    /// Delete a cached record
    Delete {
        #[arg(value_enum)]
        kind: KindArg,
        id: String,
    },
    /// Inspect the pending operation queue
    Queue {
        #[command(subcommand)]
        command: Option<QueueCommands>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List detected conflicts
    Conflicts {
        #[command(subcommand)]
        command: Option<ConflictCommands>,
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a conflict
    Resolve {
        /// Conflict ID or unique ID prefix
        id: String,
        #[arg(long, value_enum)]
        strategy: StrategyArg,
        /// Resolved record as JSON; manual resolution opens $EDITOR when omitted
        #[arg(long, value_name = "JSON")]
        data: Option<String>,
    },
    /// Remove every locally stored record, queued change and conflict
    Wipe {
        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Abandon a queued operation
    Discard {
        /// Operation ID or unique ID prefix
        id: String,
    },
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// Show both sides of a conflict and the merge candidate
    Show {
        /// Conflict ID or unique ID prefix
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KindArg {
    #[value(alias = "products")]
    Product,
    #[value(alias = "meters")]
    Meter,
    #[value(alias = "customers")]
    Customer,
    #[value(alias = "sales")]
    Sale,
}

impl From<KindArg> for EntityKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Product => Self::Product,
            KindArg::Meter => Self::Meter,
            KindArg::Customer => Self::Customer,
            KindArg::Sale => Self::Sale,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum StrategyArg {
    Server,
    Client,
    Merge,
    Manual,
}

impl From<StrategyArg> for ResolutionStrategy {
    fn from(strategy: StrategyArg) -> Self {
        match strategy {
            StrategyArg::Server => Self::Server,
            StrategyArg::Client => Self::Client,
            StrategyArg::Merge => Self::Merge,
            StrategyArg::Manual => Self::Manual,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
