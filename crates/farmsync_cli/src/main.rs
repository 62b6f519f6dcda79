//! FarmSync CLI
//!
//! Runs a node and inspects its journal.
//!
//! # Commands
//!
//! - `serve` - Run a node from its TOML file
//! - `inspect` - Show queued and held entries per target
//! - `verify` - Check journal integrity
//! - `dump-journal` - Dump journal records for debugging
//! - `purge` - Abandon every entry of one target

mod commands;
mod node;

use clap::{Parser, Subcommand};
use node::NodeConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// FarmSync node runner and journal tools.
#[derive(Parser)]
#[command(name = "farmsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the node file
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Path to the node data directory (overrides the node file)
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until Ctrl-C
    Serve,

    /// Show queued and held entries per target
    Inspect {
        /// List every live entry
        #[arg(short, long)]
        entries: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify journal integrity
    Verify,

    /// Dump journal records for debugging
    DumpJournal {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Start from this offset
        #[arg(short, long, default_value = "0")]
        offset: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Abandon every queued and held entry of a target
    Purge {
        /// Target server id
        #[arg(short, long)]
        target: String,

        /// Actually purge instead of showing what would be abandoned
        #[arg(short, long)]
        yes: bool,
    },

    /// Show version information
    Version,
}

impl Cli {
    fn node(&self, command: &str) -> Result<NodeConfig, Box<dyn std::error::Error>> {
        let path = self
            .config
            .as_ref()
            .ok_or_else(|| format!("Node file (--config) required for {command}"))?;
        let mut node = NodeConfig::load(path)?;
        if let Some(data_dir) = &self.path {
            node.data_dir = data_dir.clone();
        }
        Ok(node)
    }

    fn data_dir(&self, command: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None if self.config.is_some() => Ok(self.node(command)?.data_dir),
            None => Err(format!("Data directory (--path or --config) required for {command}").into()),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &cli.command {
        Commands::Serve => {
            commands::serve::run(cli.node("serve")?)?;
        }
        Commands::Inspect { entries, format } => {
            let path = cli.data_dir("inspect")?;
            commands::inspect::run(&path, *entries, format)?;
        }
        Commands::Verify => {
            let path = cli.data_dir("verify")?;
            commands::verify::run(&path)?;
        }
        Commands::DumpJournal {
            limit,
            offset,
            format,
        } => {
            let path = cli.data_dir("dump-journal")?;
            commands::dump_journal::run(&path, *limit, *offset, format)?;
        }
        Commands::Purge { target, yes } => {
            commands::purge::run(&cli.node("purge")?, target, *yes)?;
        }
        Commands::Version => {
            println!("FarmSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Wire protocol v{}", farmsync_protocol::PROTOCOL_VERSION);
        }
    }

    Ok(())
}
