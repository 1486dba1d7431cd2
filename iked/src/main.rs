//! # iked
//!
//! An IKEv2 daemon with privilege separated certificate handling

#![warn(missing_docs, clippy::unwrap_used, clippy::expect_used)]

use clap::Parser;
use tracing::error;

use iked::config::Config;
use iked::proc::{run_child, run_parent, ProcRole};

use crate::cli::Cli;

mod cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let result = match cli.proc.as_deref().and_then(ProcRole::parse) {
        Some(role) => run_child(role).await,
        None => match load_config(&cli.config) {
            Ok(config) => run_parent(config, cli.control, cli.key).await,
            Err(e) => {
                error!("{e}");
                std::process::exit(1);
            }
        },
    };
    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

fn load_config(path: &std::path::Path) -> Result<Config, iked::Error> {
    let raw = std::fs::read(path)
        .map_err(|e| iked::Error::Config(format!("{}: {e}", path.display())))?;
    serde_json::from_slice(&raw).map_err(|e| iked::Error::Config(format!("{}: {e}", path.display())))
}
