//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Verify bearer tokens and perform On-Behalf-Of exchanges against the
/// configured identity authority
#[derive(Parser, Debug)]
#[command(name = "mcp-delegated-auth")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MCP_AUTH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "MCP_AUTH_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log format (text, json); overrides the config file
    #[arg(long, env = "MCP_AUTH_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Verify a bearer token and print the identity as JSON
    Verify {
        /// Token, with or without the `Bearer ` prefix
        #[arg(short, long, env = "MCP_AUTH_TOKEN")]
        token: String,
    },

    /// Verify a token, then exchange it On-Behalf-Of the user
    Exchange {
        /// Token, with or without the `Bearer ` prefix
        #[arg(short, long, env = "MCP_AUTH_TOKEN")]
        token: String,

        /// Downstream scope (defaults to the configured scope)
        #[arg(short, long)]
        scope: Option<String>,

        /// Skip local verification and send the assertion as-is
        #[arg(long)]
        raw: bool,

        /// Print the downstream access token instead of redacting it
        #[arg(long)]
        show_token: bool,
    },

    /// Validate configuration and print the selected credential strategy
    CheckConfig,
}

/// Strip an optional `Bearer ` prefix from a token argument.
#[must_use]
pub fn token_argument(value: &str) -> &str {
    crate::auth::bearer_from_header(value).unwrap_or_else(|| value.trim())
}
