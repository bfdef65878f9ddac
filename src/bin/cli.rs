use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use shardxa::backend::{BackendsFile, BACKEND_CONFIG_FILE};
use shardxa::config::BackendRole;
use shardxa::transaction::recovery::{RecoveryLogStore, ResolveState};

#[derive(Parser)]
#[command(author, version, about = "shardxa admin - inspect XA recovery state and backend topology")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the XA recovery log
    Xa {
        /// Directory holding the recovery log
        #[arg(short, long, default_value = "data", global = true)]
        log_dir: PathBuf,

        #[command(subcommand)]
        action: XaAction,
    },

    /// List the persisted backends
    Backends {
        /// Directory holding backend.json
        #[arg(short, long, default_value = "data")]
        meta_dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum XaAction {
    /// Print every pending entry
    List {
        /// Print the raw JSON entries
        #[arg(long)]
        json: bool,
    },

    /// Drop one entry without resolving it
    Remove {
        /// Transaction id of the entry
        xaid: String,
    },

    /// Drop every entry
    Clear,

    /// Print the location of the recovery log file
    Path,
}

fn open_store(log_dir: &Path) -> Result<RecoveryLogStore> {
    RecoveryLogStore::open(log_dir)
        .with_context(|| format!("cannot open recovery log in {}", log_dir.display()))
}

fn run_xa(log_dir: &Path, action: XaAction) -> Result<()> {
    let store = open_store(log_dir)?;
    match action {
        XaAction::List { json } => {
            let entries = store.list();
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }
            println!("{:<16} {:<40} {:<8}", "time", "xaid", "state");
            for entry in &entries {
                let state = match entry.state {
                    ResolveState::Commit => "commit",
                    ResolveState::Rollback => "rollback",
                };
                println!("{:<16} {:<40} {:<8}", entry.time, entry.xaid, state);
            }
            println!("({} entries)", entries.len());
        }
        XaAction::Remove { xaid } => {
            let entry = store
                .remove(&xaid)
                .with_context(|| format!("cannot remove {}", xaid))?;
            println!("Removed {} ({:?})", entry.xaid, entry.state);
        }
        XaAction::Clear => {
            let removed = store.remove_all().context("cannot clear recovery log")?;
            println!("Removed {} entries", removed);
        }
        XaAction::Path => {
            println!("{}", store.path().display());
        }
    }
    Ok(())
}

fn run_backends(meta_dir: &Path) -> Result<()> {
    let path = meta_dir.join(BACKEND_CONFIG_FILE);
    let file = BackendsFile::load(&path)?;

    println!("{:<16} {:<24} {:<10} {:<8}", "name", "address", "role", "max");
    for backend in &file.backends {
        let role = match backend.role {
            BackendRole::Normal => "normal",
            BackendRole::Attached => "attached",
        };
        println!(
            "{:<16} {:<24} {:<10} {:<8}",
            backend.name, backend.address, role, backend.max_connections
        );
    }
    println!("({} backends)", file.backends.len());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Xa { log_dir, action } => run_xa(&log_dir, action),
        Commands::Backends { meta_dir } => run_backends(&meta_dir),
    }
}
