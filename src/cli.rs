//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Dashboard portal - signed-in analytics pages over blob storage
#[derive(Parser, Debug)]
#[command(name = "dash-portal")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "DASH_PORTAL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "DASH_PORTAL_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "DASH_PORTAL_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "DASH_PORTAL_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "DASH_PORTAL_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the portal server (default)
    Serve,

    /// Fetch one configured data file through the blob cache
    Fetch {
        /// Data file name from the `data.files` configuration section
        #[arg(required = true)]
        name: String,

        /// Bypass the local cache (no read, no write)
        #[arg(long)]
        no_cache: bool,

        /// Write the content to this file instead of reporting its size
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}
