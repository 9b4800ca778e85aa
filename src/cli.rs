/// CLI argument parsing and command handling

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

// Build timestamp injected at compile time
pub const BUILD_TIMESTAMP: &str = env!("BUILD_TIMESTAMP");
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

// Get version with timestamp
pub fn get_version() -> &'static str {
    VERSION_WITH_BUILD
}

#[derive(Parser)]
#[command(name = "gitlab-manager")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    /// Environment file with container names, paths and URLs
    #[arg(long, global = true, default_value = ".env")]
    pub env_file: PathBuf,

    /// Log level (overrides GITLAB_MANAGER_LOG)
    #[arg(long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Start GitLab and wait until it answers
    Start,

    /// Stop GitLab
    Stop,

    /// Stop then start GitLab
    Restart,

    /// Show whether GitLab is reachable
    Status,

    /// Create a GitLab backup and mirror data, configs and secrets
    Backup,

    /// Restore GitLab from the backup location
    Restore,

    /// Register the CI runner with GitLab
    #[command(name = "register_runner")]
    RegisterRunner {
        /// Remove existing registrations and register again
        #[arg(long)]
        force: bool,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}
