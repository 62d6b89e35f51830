//! assetcache CLI
//!
//! Operator tooling over a disk-backed asset cache: bootstrap the directory
//! layout, write and read entries, print statistics and purge.

mod cli;
mod commands;

use cli::{EXIT_OK, exit_code_for, render_error};
use std::io;
use tracing_subscriber::EnvFilter;

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() {
    let cli = cli::parse();
    init_tracing(cli.log_level());

    let result = match cli.build_config() {
        Ok(config) => commands::execute(&cli.command, config, &mut io::stdout().lock()).await,
        Err(e) => Err(e),
    };

    let code = match result {
        Ok(()) => EXIT_OK,
        Err(err) => {
            render_error(&err);
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}
