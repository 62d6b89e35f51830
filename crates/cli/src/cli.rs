//! Argument parsing, error types and configuration layering for the CLI

use assetcache::{CacheConfig, GzipMode};
use clap::{ArgAction, Parser, Subcommand};
use miette::{Diagnostic, Report};
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Successful exit code
pub const EXIT_OK: i32 = 0;
/// Operation failed at runtime (cache unavailable, I/O error)
pub const EXIT_FAILURE: i32 = 1;
/// CLI or configuration error exit code
pub const EXIT_CLI: i32 = 2;

/// CLI-specific error types with exit code mapping
#[derive(Error, Debug, Clone, Diagnostic)]
pub enum CliError {
    /// CLI or configuration error (exit code 2)
    #[error("CLI/configuration error: {message}")]
    #[diagnostic(code(assetcache::cli::config))]
    Config {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },

    /// The operation itself failed (exit code 1)
    #[error("{message}")]
    #[diagnostic(code(assetcache::cli::operation))]
    Operation {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
}

impl CliError {
    /// Create a configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }

    /// Create a configuration error with help text
    #[must_use]
    pub fn config_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// Create an operation error
    #[must_use]
    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation {
            message: message.into(),
            help: None,
        }
    }

    /// Create an operation error with help text
    #[must_use]
    pub fn operation_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Operation {
            message: message.into(),
            help: Some(help.into()),
        }
    }
}

impl From<assetcache::Error> for CliError {
    fn from(err: assetcache::Error) -> Self {
        match err {
            assetcache::Error::Configuration { message } => Self::config(message),
            assetcache::Error::Unavailable => Self::operation_with_help(
                "cache directory is unavailable",
                "check that --root is set and the directory is writable",
            ),
            other => Self::operation(other.to_string()),
        }
    }
}

/// Map a [`CliError`] to its process exit code
#[must_use]
pub const fn exit_code_for(err: &CliError) -> i32 {
    match err {
        CliError::Config { .. } => EXIT_CLI,
        CliError::Operation { .. } => EXIT_FAILURE,
    }
}

/// Render an error to stderr with miette's report handler
pub fn render_error(err: &CliError) {
    let report = Report::new(err.clone());
    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "{report:?}");
    let _ = stderr.flush();
}

#[derive(Parser, Debug)]
#[command(name = "assetcache")]
#[command(about = "Inspect and maintain a disk-backed asset cache")]
#[command(long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(
        long,
        global = true,
        env = "ASSETCACHE_CONFIG",
        help = "Path to a TOML configuration file"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "ASSETCACHE_ROOT",
        help = "Cache root directory (overrides the config file)"
    )]
    pub root: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "ASSETCACHE_PREFIX",
        help = "Filename prefix of cache entries"
    )]
    pub prefix: Option<String>,

    #[arg(
        long,
        global = true,
        env = "ASSETCACHE_GZIP_MODE",
        value_parser = parse_gzip_mode,
        help = "Gzip mode: server-delegated or self-managed"
    )]
    pub gzip_mode: Option<GzipMode>,

    #[arg(
        long,
        global = true,
        env = "ASSETCACHE_SITE_URL",
        help = "Site URL used for cache warming after a purge"
    )]
    pub site_url: Option<String>,

    #[arg(
        short,
        long,
        global = true,
        action = ArgAction::Count,
        help = "Increase log verbosity (-v debug, -vv trace)"
    )]
    pub verbose: u8,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    #[command(about = "Create the cache directories and protection files")]
    Init,

    #[command(about = "Write an entry from a file or stdin")]
    Put {
        #[arg(help = "Content hash of the asset")]
        hash: String,
        #[arg(help = "Asset extension (js, css, txt, ...)")]
        extension: String,
        #[arg(long, help = "MIME type served for the entry (guessed from the extension)")]
        mime: Option<String>,
        #[arg(long, help = "Read the payload from this file instead of stdin")]
        file: Option<PathBuf>,
    },

    #[command(about = "Print an entry's payload to stdout")]
    Get {
        #[arg(help = "Content hash of the asset")]
        hash: String,
        #[arg(help = "Asset extension (js, css, txt, ...)")]
        extension: String,
    },

    #[command(about = "Print the resolved filename and URL of an entry")]
    Path {
        #[arg(help = "Content hash of the asset")]
        hash: String,
        #[arg(help = "Asset extension (js, css, txt, ...)")]
        extension: String,
    },

    #[command(about = "Show the entry count and total size")]
    Stats {
        #[arg(long, help = "Emit the snapshot as JSON")]
        json: bool,
    },

    #[command(about = "Delete every entry and flush configured page caches")]
    Clear,
}

fn parse_gzip_mode(value: &str) -> Result<GzipMode, String> {
    value.parse().map_err(|e: assetcache::Error| e.to_string())
}

/// Parse process arguments
#[must_use]
pub fn parse() -> Cli {
    Cli::parse()
}

impl Cli {
    /// Tracing filter directive for the requested verbosity
    #[must_use]
    pub const fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    }

    /// Layer the config file, then flags and environment, over defaults.
    pub fn build_config(&self) -> Result<CacheConfig, CliError> {
        let mut config = match &self.config {
            Some(path) => CacheConfig::load(path)?,
            None => CacheConfig::default(),
        };
        if let Some(root) = &self.root {
            config.root = Some(root.clone());
        }
        if let Some(prefix) = &self.prefix {
            config.prefix.clone_from(prefix);
        }
        if let Some(mode) = self.gzip_mode {
            config.gzip_mode = mode;
        }
        if let Some(site_url) = &self.site_url {
            config.purge.site_url = Some(site_url.clone());
        }
        if config.root.is_none() {
            return Err(CliError::config_with_help(
                "no cache root configured",
                "pass --root, set ASSETCACHE_ROOT, or set `root` in the config file",
            ));
        }
        config.validate()?;
        Ok(config)
    }
}

/// MIME type served for an extension when none is given
#[must_use]
pub fn guess_mime(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "js" => "application/javascript",
        "css" => "text/css",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}
