//! Command-line interface definitions and parsing.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about = "Parley chat relay daemon", long_about = None)]
pub struct Args {
    /// Without a subcommand the daemon runs the relay.
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Address to listen on
    #[arg(short, long)]
    pub address: Option<IpAddr>,

    /// Port to listen on (1024-65535)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory for the relay database
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,

    /// Configuration file path (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// One-shot queries against the relay database.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// List every user the relay has seen, with their last login and logout
    Users,
    /// Show the login history
    History {
        /// Only show logins for this user
        name: Option<String>,
    },
    /// Show per-user message counters
    Stats,
}
