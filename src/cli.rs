//! Command-line interface

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::DependencyKind;

/// depguard - dependency-resilience layer
#[derive(Parser, Debug)]
#[command(name = "depguard")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "DEPGUARD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "DEPGUARD_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "DEPGUARD_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DEPGUARD_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "DEPGUARD_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the server (default)
    Serve,

    /// Load and validate the configuration, then print redacted targets
    CheckConfig,

    /// Resolve one logical name through the configured resolver
    Resolve {
        /// Host name to resolve
        name: String,
    },

    /// Build a connection string from discrete fields
    BuildUrl(BuildUrlArgs),
}

/// Inputs for `build-url`
#[derive(Args, Debug)]
pub struct BuildUrlArgs {
    /// Dependency kind
    #[arg(long, value_enum, default_value = "redis")]
    pub kind: KindArg,

    /// Full connection string (returned unchanged when it carries a scheme)
    #[arg(long, conflicts_with = "host")]
    pub connection_string: Option<String>,

    /// Host or bare `host:port`
    #[arg(long)]
    pub host: Option<String>,

    /// Port
    #[arg(long)]
    pub port: Option<u16>,

    /// Username
    #[arg(long)]
    pub username: Option<String>,

    /// Credential (supports `env:VAR_NAME`)
    #[arg(long)]
    pub credential: Option<String>,

    /// Path suffix
    #[arg(long)]
    pub path: Option<String>,

    /// Use the encrypted scheme
    #[arg(long)]
    pub tls: bool,

    /// Print the credential instead of masking it
    #[arg(long)]
    pub show_secret: bool,
}

/// Dependency kind on the command line
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum KindArg {
    /// `redis://` / `rediss://`
    Redis,
    /// `http://` / `https://`
    Http,
    /// `amqp://` / `amqps://`
    Amqp,
}

impl From<KindArg> for DependencyKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Redis => Self::Redis,
            KindArg::Http => Self::Http,
            KindArg::Amqp => Self::Amqp,
        }
    }
}
