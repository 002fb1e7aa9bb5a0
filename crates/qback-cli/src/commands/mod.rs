//! CLI command definitions and handlers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use qback_core::config::Config;
use qback_core::crypto::TlsConfig;

pub mod certs;
pub mod client;
pub mod completions;
pub mod server;

/// Load configuration.
///
/// An explicit `--config` file must exist and parse. Without one, the file in
/// the platform config directory is used if present, falling back to
/// defaults when it cannot be read.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    if let Some(path) = path {
        return Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()));
    }

    Ok(Config::load().unwrap_or_else(|e| {
        tracing::warn!("Ignoring unreadable config file: {}", e);
        Config::default()
    }))
}

/// Resolve the certificate directory from a flag or the config file.
fn cert_dir(flag: Option<PathBuf>, config: &Config) -> Result<PathBuf> {
    flag.or_else(|| config.tls.cert_dir.clone())
        .context("--tls requires a certificate directory (--certs or tls.cert_dir)")
}

/// Load server-role TLS material when TLS is enabled.
fn server_tls(enabled: bool, certs: Option<PathBuf>, config: &Config) -> Result<Option<TlsConfig>> {
    if !enabled {
        return Ok(None);
    }
    let dir = cert_dir(certs, config)?;
    let tls = TlsConfig::server_from_dir(&dir)
        .with_context(|| format!("Failed to load server certificates from {}", dir.display()))?;
    Ok(Some(tls))
}

/// Load client-role TLS material when TLS is enabled.
fn client_tls(enabled: bool, certs: Option<PathBuf>, config: &Config) -> Result<Option<TlsConfig>> {
    if !enabled {
        return Ok(None);
    }
    let dir = cert_dir(certs, config)?;
    let tls = TlsConfig::client_from_dir(&dir, &config.tls.server_name)
        .with_context(|| format!("Failed to load client certificates from {}", dir.display()))?;
    Ok(Some(tls))
}

/// qback - chunked, hash-verified file transfer
#[derive(Parser)]
#[command(name = "qback")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "QBACK_CONFIG")]
    pub config: Option<PathBuf>,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Run the storage server
    Server(ServerArgs),

    /// Talk to a storage server
    Client(ClientArgs),

    /// Generate development TLS certificates
    Certs(CertsArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

/// Arguments for the server command
#[derive(Parser)]
pub struct ServerArgs {
    /// Storage directory
    #[arg(long, conflicts_with = "memory")]
    pub dir: Option<PathBuf>,

    /// Hold uploads in memory and discard them (benchmarking)
    #[arg(long)]
    pub memory: bool,

    /// Listen address
    #[arg(long)]
    pub address: Option<String>,

    /// Require mutual TLS
    #[arg(long)]
    pub tls: bool,

    /// Directory holding ca.pem, server.pem and server.key
    #[arg(long)]
    pub certs: Option<PathBuf>,
}

/// Arguments for the client command
#[derive(Parser)]
pub struct ClientArgs {
    /// Server address
    #[arg(long)]
    pub address: Option<String>,

    /// Connect with mutual TLS
    #[arg(long)]
    pub tls: bool,

    /// Directory holding ca.pem, client.pem and client.key
    #[arg(long)]
    pub certs: Option<PathBuf>,

    /// Chunk size in bytes
    #[arg(long)]
    pub chunksize: Option<usize>,

    /// Per-chunk timeout in seconds
    #[arg(long = "ct")]
    pub chunk_timeout: Option<u64>,

    /// Client operation
    #[command(subcommand)]
    pub action: ClientAction,
}

/// Client operations
#[derive(Subcommand)]
pub enum ClientAction {
    /// Upload a file, or download one with --reverse
    Transfer(TransferArgs),

    /// Check that the server is up
    Ping,

    /// List the objects stored under a tag
    List(ListArgs),
}

/// Arguments for the transfer subcommand
#[derive(Parser)]
pub struct TransferArgs {
    /// Tag the object is stored under
    #[arg(long)]
    pub tag: String,

    /// File to upload, or benchmark://<name>/<size> for synthetic content
    #[arg(long, required_unless_present = "reverse", conflicts_with = "reverse")]
    pub file: Option<String>,

    /// Download instead of upload
    #[arg(long, requires_all = ["name", "dir"])]
    pub reverse: bool,

    /// Object to download
    #[arg(long)]
    pub name: Option<String>,

    /// Destination root; the object lands in <dir>/<tag>/<name>
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// No progress output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the list subcommand
#[derive(Parser)]
pub struct ListArgs {
    /// Tag to list
    #[arg(long)]
    pub tag: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the certs command
#[derive(Parser)]
pub struct CertsArgs {
    /// Output directory
    pub dir: PathBuf,

    /// Server certificate names (DNS names or IP addresses)
    #[arg(long = "name", default_values_t = [String::from("localhost"), String::from("127.0.0.1")])]
    pub names: Vec<String>,

    /// Overwrite existing certificates
    #[arg(long)]
    pub force: bool,
}

/// Arguments for the completions command
#[derive(Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: ShellType,
}

/// Supported shell types for completions
#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum ShellType {
    /// Bash shell
    Bash,
    /// Zsh shell
    Zsh,
    /// Fish shell
    Fish,
    /// PowerShell
    #[value(name = "powershell")]
    PowerShell,
    /// Elvish shell
    Elvish,
}
