//! CoreWF CLI - Inspect a file-backed instance store
//!
//! Provides subcommands for initializing a store root and listing or
//! decoding the workflows persisted in it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use corewf::runtime::instance_map::decode_snapshot;
use corewf::runtime::{
    EngineConfig, FileInstanceStore, PersistableIdleAction, WorkflowInstanceId,
};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "corewf")]
#[command(about = "Activity-based workflow engine store inspector", long_about = None)]
struct Cli {
    /// Root directory of the instance store
    #[arg(short, long, default_value = ".corewf")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a store root and write its configuration
    Init {
        /// Store command timeout in milliseconds
        #[arg(long, default_value = "5000")]
        store_timeout_ms: u64,

        /// Action on persistable idle: none, persist or unload
        #[arg(long, default_value = "none")]
        persistable_idle: String,

        /// Disable tracking records
        #[arg(long)]
        no_tracking: bool,
    },

    /// List stored workflow instances
    Instances,

    /// List registered owners
    Owners,

    /// Decode a stored snapshot and print it as JSON
    Show {
        /// Workflow instance id (UUID)
        id: String,
    },
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            store_timeout_ms,
            persistable_idle,
            no_tracking,
        } => {
            let config = EngineConfig {
                root: cli.root.clone(),
                store_timeout_ms,
                persistable_idle: parse_idle_action(&persistable_idle)?,
                tracking: !no_tracking,
            };
            config.init()?;
            println!("Initialized CoreWF store at {:?}", cli.root);
        }

        Commands::Instances => {
            let store = FileInstanceStore::open(cli.root)?;
            let instances = store.list_instances()?;
            if instances.is_empty() {
                println!("No stored instances");
            }
            for (id, entry) in instances {
                let lock = entry
                    .locked_by
                    .map(|owner| format!("locked by {}", owner))
                    .unwrap_or_else(|| "unlocked".to_string());
                println!(
                    "{}  {:?}  {}{}  saved {}",
                    id,
                    entry.metadata.state,
                    lock,
                    if entry.complete { "  complete" } else { "" },
                    entry.metadata.saved_at.to_rfc3339(),
                );
                for bookmark in &entry.metadata.bookmarks {
                    println!("    bookmark {}", bookmark);
                }
            }
        }

        Commands::Owners => {
            let store = FileInstanceStore::open(cli.root)?;
            for (owner, record) in store.list_owners()? {
                println!("{}  {}  {}", owner, record.name, record.created_at.to_rfc3339());
            }
        }

        Commands::Show { id } => {
            let uuid = Uuid::parse_str(&id)
                .with_context(|| format!("Invalid instance id: {}", id))?;
            let store = FileInstanceStore::open(cli.root)?;
            let bytes = store.read_snapshot_bytes(WorkflowInstanceId::from_uuid(uuid))?;
            let snapshot = decode_snapshot(&bytes)?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }

    Ok(())
}

fn parse_idle_action(value: &str) -> Result<PersistableIdleAction> {
    match value {
        "none" => Ok(PersistableIdleAction::None),
        "persist" => Ok(PersistableIdleAction::Persist),
        "unload" => Ok(PersistableIdleAction::Unload),
        other => anyhow::bail!("Unknown persistable idle action: {}", other),
    }
}
