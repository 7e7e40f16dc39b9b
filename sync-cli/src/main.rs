//! # foldsync
//!
//! Command line front end for the foldsync engine.
//!
//! ## Commands
//!
//! - `init`: Create the device identity
//! - `add-folder`: Share a local directory under a folder key
//! - `folders`: List shared folders
//! - `scan`: Index local changes
//! - `index`: Print the local index of a folder
//! - `transfers`: Show persisted and active transfers
//! - `status`: Show device, folder and transfer status
//!
//! ## Example
//!
//! ```bash
//! foldsync init --name "Laptop"
//! foldsync add-folder photos ~/Pictures --key "family photos"
//! foldsync scan
//! foldsync index photos
//! ```
//!
//! Logging goes to stderr and honors `RUST_LOG` (default `info`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use sync_core::SyncProfile;

mod commands;
mod config;
mod session;

use commands::{folders, index, init, scan, status};

/// Command line front end for the foldsync engine.
#[derive(Parser, Debug)]
#[command(name = "foldsync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory for device identity, folder list and transfer state
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Engine configuration file (TOML)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize device identity
    Init {
        /// Device nickname
        #[arg(long, short)]
        name: String,
    },

    /// Share a local directory
    AddFolder {
        /// Folder name
        name: String,

        /// Local base directory (created if missing)
        path: PathBuf,

        /// Shared key; replicas with the same key sync together (default: the name)
        #[arg(long, short)]
        key: Option<String>,

        /// Sync profile
        #[arg(long, short, default_value = "automatic", value_parser = config::parse_profile)]
        profile: SyncProfile,
    },

    /// List shared folders
    Folders,

    /// Scan folders for local changes
    Scan {
        /// Only scan this folder
        folder: Option<String>,

        /// Commit even if the scan looks like a mass deletion
        #[arg(long)]
        force: bool,
    },

    /// Print the local index of a folder
    Index {
        /// Folder name
        folder: String,

        /// Include deleted records
        #[arg(long)]
        deleted: bool,
    },

    /// Show transfers
    Transfers,

    /// Show sync status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };

    tokio::fs::create_dir_all(&data_dir)
        .await
        .context("Failed to create data directory")?;
    config::set_dir_permissions_0700(&data_dir).await?;

    let engine_config = cli.config.as_deref();
    match cli.command {
        Commands::Init { name } => {
            init::run(&data_dir, &name).await?;
        }
        Commands::AddFolder {
            name,
            path,
            key,
            profile,
        } => {
            folders::add(&data_dir, &name, &path, key.as_deref(), profile).await?;
        }
        Commands::Folders => {
            folders::list(&data_dir).await?;
        }
        Commands::Scan { folder, force } => {
            scan::run(&data_dir, engine_config, folder.as_deref(), force).await?;
        }
        Commands::Index { folder, deleted } => {
            index::run(&data_dir, engine_config, &folder, deleted).await?;
        }
        Commands::Transfers => {
            status::run_transfers(&data_dir, engine_config).await?;
        }
        Commands::Status => {
            status::run(&data_dir, engine_config).await?;
        }
    }

    Ok(())
}

/// Get the default data directory for foldsync.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "foldsync", "foldsync")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}
