//! qback CLI - chunked, hash-verified file transfer
//!
//! One binary runs both halves of a transfer: a storage server that keeps
//! objects under `<dir>/<tag>/<name>`, and a client that uploads, downloads
//! and lists them.
//!
//! ## Quick Start
//!
//! ```bash
//! # Start a server
//! qback server --dir ./storage
//!
//! # Upload a file (on another machine)
//! qback client --address 10.0.0.5:50051 transfer --tag backups --file ./db.dump
//!
//! # Get it back
//! qback client --address 10.0.0.5:50051 transfer --tag backups --reverse --name db.dump --dir ./restore
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_precision_loss)]

use anyhow::Result;
use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Server(args) => {
            let config = commands::load_config(cli.config.as_deref())?;
            commands::server::run(args, config).await
        }
        Command::Client(args) => {
            let config = commands::load_config(cli.config.as_deref())?;
            commands::client::run(args, config).await
        }
        Command::Certs(args) => commands::certs::run(&args),
        Command::Completions(args) => {
            commands::completions::run(args.shell);
            Ok(())
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,qback=info,qback_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
