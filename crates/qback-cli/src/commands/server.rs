//! Server command implementation.

use anyhow::{bail, Context, Result};
use qback_core::config::Config;
use qback_core::server::{Server, ServerContext};
use qback_core::storage::{Backend, DirectoryStore, MemoryStore};

use super::ServerArgs;

/// Run the server command until Ctrl-C.
pub async fn run(args: ServerArgs, mut config: Config) -> Result<()> {
    if let Some(address) = args.address {
        config.server.address = address;
    }
    if args.dir.is_some() {
        config.server.storage_dir = args.dir;
        config.server.memory = false;
    }
    config.server.memory |= args.memory;
    config.server.tls |= args.tls;
    config.validate().context("Invalid configuration")?;

    let backend = if config.server.memory {
        Backend::Memory(MemoryStore::new())
    } else {
        let Some(dir) = config.server.storage_dir.clone() else {
            bail!("--dir is required unless --memory is set");
        };
        let store = DirectoryStore::open(&dir)
            .await
            .with_context(|| format!("Failed to open storage directory {}", dir.display()))?;
        Backend::Directory(store)
    };

    let tls = super::server_tls(config.server.tls, args.certs, &config)?;
    let context = ServerContext::new(backend, tls, config.transport.clone());

    let server = Server::bind(&config.server.address, context)
        .await
        .with_context(|| format!("Failed to listen on {}", config.server.address))?;

    println!();
    println!("qback v{}", qback_core::VERSION);
    println!("{}", "-".repeat(37));
    println!("  Listening on {}", server.local_addr()?);
    match &config.server.storage_dir {
        Some(dir) if !config.server.memory => println!("  Storage:      {}", dir.display()),
        _ => println!("  Storage:      memory (uploads are discarded)"),
    }
    println!(
        "  TLS:          {}",
        if config.server.tls { "mutual" } else { "off" }
    );
    println!();
    println!("  Press Ctrl+C to stop");
    println!();

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    server.run().await?;
    println!("  Server stopped.");
    Ok(())
}
