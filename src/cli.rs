//! Command-line interface for Skiff
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Path, PathBuf};

/// Default console home, holding the certificate, key and config file
pub const DEFAULT_HOME: &str = "~/.config/skiff/";

/// Skiff - run commands in throwaway FreeBSD jails
#[derive(Parser)]
#[command(name = "skiff")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path (defaults to <home>/skiff.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for the certificate, key and configuration
    #[arg(long, global = true, default_value = DEFAULT_HOME)]
    pub home: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the web console
    Run {
        /// Address to bind
        #[arg(long)]
        bind: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Serve plain HTTP instead of HTTPS
        #[arg(long)]
        insecure: bool,
    },

    /// Run one command in a one-shot jail and print the outcome
    Exec {
        /// Command to execute (use -- to separate from options)
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,

        /// Seconds before the command is killed (0 disables the limit)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Output the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Bootstrap a FreeBSD release for jail creation
    Fetch {
        /// Release to fetch (e.g., 14.2-RELEASE)
        release: String,

        /// Re-download even if the release exists
        #[arg(short, long)]
        force: bool,
    },

    /// List bootstrapped releases
    Releases {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Home directory with a leading `~` expanded
    pub fn home_dir(&self) -> PathBuf {
        expand_home(&self.home, std::env::var_os("HOME").map(PathBuf::from).as_deref())
    }

    /// The config file to read
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| self.home_dir().join("skiff.toml"))
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "skiff", &mut std::io::stdout());
    }
}

fn expand_home(path: &str, user_home: Option<&Path>) -> PathBuf {
    match (path.strip_prefix('~'), user_home) {
        (Some(""), Some(home)) => home.to_path_buf(),
        (Some(rest), Some(home)) if rest.starts_with('/') => home.join(&rest[1..]),
        _ => PathBuf::from(path),
    }
}
