//! scum - Secret Credentials Utility/Manager
//!
//! Commands:
//! - init: Generate the key pair and create the bag
//! - types: List the supported profile types
//! - config: Print the effective configuration
//! - add -t <type>: Prompt for a new profile and store it
//! - list [patterns]: List stored profiles
//! - show <patterns>: Decrypt and print profiles
//! - mount <patterns>: Expose profiles as files for a limited time
//! - verify <patterns>: Check profiles with their issuing service
//! - rotate <patterns>: Reissue and store new credentials
//! - rm <name>: Delete a profile

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use scum::Config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    // RUST_LOG wins over the debug switch
    let level = if cli.debug || config.debug {
        "scum=debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    if !cli::run(cli, config)? {
        std::process::exit(1);
    }
    Ok(())
}
