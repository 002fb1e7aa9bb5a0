//! Client command implementation.

use std::time::Duration;

use anyhow::{Context, Result};
use qback_core::client::Client;
use qback_core::config::Config;
use qback_core::protocol::StoredItem;
use qback_core::transfer::{
    format_size, format_speed, throughput, DownloadSession, UploadOutcome, UploadSession,
    UploadSource,
};

use super::{ClientAction, ClientArgs, ListArgs, TransferArgs};
use crate::ui;

/// Run the client command.
pub async fn run(args: ClientArgs, mut config: Config) -> Result<()> {
    if let Some(address) = args.address {
        config.client.address = address;
    }
    if let Some(chunk_size) = args.chunksize {
        config.client.chunk_size = chunk_size;
    }
    if let Some(secs) = args.chunk_timeout {
        config.client.chunk_timeout = Duration::from_secs(secs);
    }
    config.client.tls |= args.tls;

    let tls = super::client_tls(config.client.tls, args.certs, &config)?;
    let client = Client::new(&config, tls).context("Invalid client configuration")?;

    match args.action {
        ClientAction::Transfer(transfer) if transfer.reverse => download(&client, transfer).await,
        ClientAction::Transfer(transfer) => upload(&client, transfer).await,
        ClientAction::Ping => ping(&client, &config.client.address).await,
        ClientAction::List(list_args) => list(&client, &list_args).await,
    }
}

async fn upload(client: &Client, args: TransferArgs) -> Result<()> {
    let file = args.file.context("--file is required for an upload")?;

    let source = UploadSource::resolve(&file)
        .await
        .with_context(|| format!("Cannot upload '{file}'"))?;
    if !args.quiet {
        println!(
            "  Hashing {} ({})...",
            source.name(),
            format_size(source.size())
        );
    }

    let session = UploadSession::prepare(&args.tag, source, client.transfer_config().clone())
        .await
        .context("Failed to prepare upload")?;

    let progress = (!args.quiet).then(|| tokio::spawn(ui::display_progress(session.progress())));
    let result = client.run_upload(&session).await;
    drop(session);
    if let Some(handle) = progress {
        let _ = handle.await;
    }

    let outcome = result.context("Upload failed")?;
    match &outcome {
        UploadOutcome::Rejected { message } => {
            println!("  Upload rejected: {message}");
        }
        UploadOutcome::Completed {
            name,
            bytes,
            elapsed,
            ..
        } => {
            println!(
                "  Uploaded {}/{} ({}) in {:.2}s, {}",
                args.tag,
                name,
                format_size(*bytes),
                elapsed.as_secs_f64(),
                format_speed(outcome.throughput().unwrap_or_default())
            );
        }
    }
    Ok(())
}

async fn download(client: &Client, args: TransferArgs) -> Result<()> {
    let name = args.name.context("--name is required with --reverse")?;
    let dir = args.dir.context("--dir is required with --reverse")?;

    let session = DownloadSession::new(
        &args.tag,
        &name,
        &dir,
        client.transfer_config().clone(),
    )
    .context("Invalid download request")?;

    let progress = (!args.quiet).then(|| tokio::spawn(ui::display_progress(session.progress())));
    let result = client.run_download(&session).await;
    drop(session);
    if let Some(handle) = progress {
        let _ = handle.await;
    }

    let outcome = result.with_context(|| format!("Download of {}/{} failed", args.tag, name))?;
    println!(
        "  Downloaded {} ({}) in {:.2}s, {}",
        outcome.path.display(),
        format_size(outcome.bytes),
        outcome.elapsed.as_secs_f64(),
        format_speed(throughput(outcome.bytes, outcome.elapsed))
    );
    Ok(())
}

async fn ping(client: &Client, address: &str) -> Result<()> {
    let rtt = client
        .ping()
        .await
        .with_context(|| format!("Server at {address} is not reachable"))?;
    println!("Server is up [{} ms]", rtt.as_millis());
    Ok(())
}

async fn list(client: &Client, args: &ListArgs) -> Result<()> {
    let items = client
        .list(&args.tag)
        .await
        .with_context(|| format!("Failed to list '{}'", args.tag))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        print_listing(&args.tag, &items);
    }
    Ok(())
}

fn print_listing(tag: &str, items: &[StoredItem]) {
    if items.is_empty() {
        println!("  No objects under '{tag}'.");
        return;
    }

    let width = items
        .iter()
        .map(|item| item.name.chars().count())
        .max()
        .unwrap_or(0)
        .max(4);

    println!(
        "  {:<width$}  {:>10}  {:<19}  HASH",
        "NAME", "SIZE", "MODIFIED"
    );
    for item in items {
        println!(
            "  {:<width$}  {:>10}  {:<19}  {}",
            item.name,
            format_size(item.size),
            ui::format_timestamp(item.modified_time),
            ui::short_hash(&item.hash)
        );
    }
    println!();
    let total: u64 = items.iter().map(|item| item.size).sum();
    println!("  {} objects, {}", items.len(), format_size(total));
}
