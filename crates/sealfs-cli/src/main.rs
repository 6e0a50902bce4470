//! sealfs: encrypted object storage CLI
//!
//! Commands:
//!   keygen <path>               - write a fresh base64-encoded 256-bit key
//!   encrypt <local> <remote>    - stream a local file into the encrypted store
//!   decrypt <remote> <local>    - stream an object's plaintext back to disk
//!   inspect <remote>            - show the container framing (no key needed)
//!   config show                 - display current configuration

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use sealfs_core::config::expand_home;
use sealfs_core::SealfsConfig;
use sealfs_crypto::{inspect, ContainerSummary, CryptoError, EncryptedStorage, EncryptionKey};
use sealfs_storage::{ObjectRead, OpendalStorage, Storage, WriteOptions};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "sealfs",
    version,
    about = "Encrypted object storage client",
    long_about = "sealfs: stream files through AES-256-GCM into memory, filesystem, or S3 storage"
)]
struct Cli {
    /// Path to sealfs.toml configuration file
    #[arg(long, short = 'c', env = "SEALFS_CONFIG", default_value = "sealfs.toml")]
    config: PathBuf,

    /// Key file (overrides encryption.key_file in config)
    #[arg(long, short = 'k', env = "SEALFS_KEY_FILE")]
    key_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(long, env = "SEALFS_LOG")]
    log: Option<String>,

    /// Log format; overrides config
    #[arg(long, env = "SEALFS_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a new encryption key
    Keygen {
        /// Where to write the key (base64, owner-only permissions)
        path: PathBuf,
        /// Replace an existing key file
        #[arg(long)]
        force: bool,
    },

    /// Encrypt a local file into the configured store
    Encrypt {
        /// Local plaintext file
        local: PathBuf,
        /// Object path in the store
        remote: String,
    },

    /// Decrypt an object from the configured store to a local file
    ///
    /// The output is written beside the destination and renamed into place
    /// only after the whole object has been authenticated.
    Decrypt {
        /// Object path in the store
        remote: String,
        /// Local destination
        local: PathBuf,
    },

    /// Summarize a stored container without decrypting it
    Inspect {
        /// Object path in the store
        remote: String,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum LogFormat {
    Json,
    Text,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SealfsConfig::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;

    let level = cli.log.as_deref().unwrap_or(&config.logging.level);
    let format = match cli.log_format {
        Some(format) => format,
        None => LogFormat::from_str(&config.logging.format, true)
            .map_err(|e| anyhow::anyhow!("logging.format: {e}"))?,
    };
    init_logging(level, format);
    debug!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        backend = ?config.storage.backend,
        "sealfs starting"
    );

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    match cli.command {
        Commands::Keygen { path, force } => cmd_keygen(&path, force),
        Commands::Encrypt { local, remote } => {
            let store = open_store(&config, cli.key_file.as_deref())?;
            cmd_encrypt(&store, &local, &remote, &cancel).await
        }
        Commands::Decrypt { remote, local } => {
            let store = open_store(&config, cli.key_file.as_deref())?;
            cmd_decrypt(&store, &remote, &local, &cancel).await
        }
        Commands::Inspect { remote, json } => {
            let store = OpendalStorage::from_config(&config.storage)?;
            let summary = cmd_inspect(&store, &remote, &cancel).await?;
            print_summary(&remote, &summary, json)
        }
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Ctrl-C cancels whatever operation is running; the command then fails with
/// an aborted error instead of leaving a partial object behind.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            cancel.cancel();
        }
    });
}

// ── Keys and stores ───────────────────────────────────────────────────────────

/// Key file precedence: `--key-file` > `encryption.key_file`.
fn resolve_key_file(config: &SealfsConfig, flag: Option<&Path>) -> Result<PathBuf> {
    flag.map(Path::to_path_buf)
        .or_else(|| config.encryption.key_file.clone())
        .map(|p| expand_home(&p))
        .context("no key file; use --key-file or set encryption.key_file in config")
}

fn load_key(path: &Path) -> Result<EncryptionKey> {
    let encoded = Zeroizing::new(
        std::fs::read_to_string(path)
            .with_context(|| format!("reading key file: {}", path.display()))?,
    );
    let raw = Zeroizing::new(
        BASE64
            .decode(encoded.trim())
            .with_context(|| format!("key file is not valid base64: {}", path.display()))?,
    );
    EncryptionKey::from_slice(&raw).with_context(|| format!("loading key: {}", path.display()))
}

fn open_store(
    config: &SealfsConfig,
    key_flag: Option<&Path>,
) -> Result<EncryptedStorage<OpendalStorage>> {
    let key = load_key(&resolve_key_file(config, key_flag)?)?;
    let inner = OpendalStorage::from_config(&config.storage)?;
    EncryptedStorage::with_key(inner, key, Some(config.encryption.chunk_size))
        .context("invalid encryption.chunk_size")
}

// ── `sealfs keygen` ───────────────────────────────────────────────────────────

fn cmd_keygen(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "key file already exists: {} (use --force to replace it)",
            path.display()
        );
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory: {}", parent.display()))?;
    }

    let key = EncryptionKey::generate();
    let encoded = Zeroizing::new(BASE64.encode(key.as_bytes()));
    write_private(path, format!("{}\n", encoded.as_str()).as_bytes())
        .with_context(|| format!("writing key file: {}", path.display()))?;

    info!(path = %path.display(), "key generated");
    println!("wrote new key to {}", path.display());
    Ok(())
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies on creation
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

// ── `sealfs encrypt` ──────────────────────────────────────────────────────────

async fn cmd_encrypt<S: Storage>(
    store: &EncryptedStorage<S>,
    local: &Path,
    remote: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let file = tokio::fs::File::open(local)
        .await
        .with_context(|| format!("opening {}", local.display()))?;
    let size = file.metadata().await.map(|m| m.len()).unwrap_or(0);

    let started = Instant::now();
    let outcome = store
        .write(remote, Box::new(file), &WriteOptions::default(), cancel)
        .await
        .with_context(|| format!("encrypting {} -> {remote}", local.display()))?;

    info!(
        local = %local.display(),
        remote,
        plaintext = size,
        stored = outcome.bytes_written,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "encrypt complete"
    );
    println!(
        "encrypted {} -> {remote} ({size} bytes, {} stored)",
        local.display(),
        outcome.bytes_written
    );
    Ok(())
}

// ── `sealfs decrypt` ──────────────────────────────────────────────────────────

/// Sibling path the plaintext is staged at until the object is fully read.
fn partial_path(local: &Path) -> PathBuf {
    let name = local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".into());
    local.with_file_name(format!(".{name}.sealfs-partial"))
}

async fn cmd_decrypt<S: Storage>(
    store: &EncryptedStorage<S>,
    remote: &str,
    local: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory: {}", parent.display()))?;
    }
    let staging = partial_path(local);

    let started = Instant::now();
    let copied = match copy_plaintext(store, remote, &staging, cancel).await {
        Ok(n) => n,
        Err(e) => {
            if let Err(rm) = tokio::fs::remove_file(&staging).await {
                debug!(path = %staging.display(), error = %rm, "no partial output to remove");
            }
            return Err(e.context(format!("decrypting {remote} -> {}", local.display())));
        }
    };
    tokio::fs::rename(&staging, local)
        .await
        .with_context(|| format!("moving output into place: {}", local.display()))?;

    info!(
        remote,
        local = %local.display(),
        plaintext = copied,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "decrypt complete"
    );
    println!("decrypted {remote} -> {} ({copied} bytes)", local.display());
    Ok(())
}

async fn copy_plaintext<S: Storage>(
    store: &EncryptedStorage<S>,
    remote: &str,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut reader = store.open(remote, cancel).await?;
    let mut out = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("creating {}", dest.display()))?;

    let mut buf = vec![0u8; store.chunk_size() as usize];
    let mut copied = 0u64;
    let result: Result<()> = async {
        loop {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CryptoError::Aborted.into()),
                r = reader.read(&mut buf) => r?,
            };
            if n == 0 {
                return Ok(());
            }
            out.write_all(&buf[..n]).await?;
            copied += n as u64;
        }
    }
    .await;

    let closed = reader.close().await;
    result?;
    closed?;
    out.flush().await?;
    out.sync_all().await?;
    Ok(copied)
}

// ── `sealfs inspect` ──────────────────────────────────────────────────────────

async fn cmd_inspect<S: Storage>(
    store: &S,
    remote: &str,
    cancel: &CancellationToken,
) -> Result<ContainerSummary> {
    let mut reader = store
        .read(remote, cancel)
        .await
        .with_context(|| format!("opening {remote}"))?;
    let summary = inspect(&mut reader).await;
    if let Err(e) = reader.close().await {
        debug!(remote, error = %e, "close after inspect failed");
    }
    summary.with_context(|| format!("{remote} is not a valid container"))
}

fn print_summary(remote: &str, summary: &ContainerSummary, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(summary).context("serializing summary")?
        );
        return Ok(());
    }
    println!("object:      {remote}");
    println!("version:     {}", summary.version);
    println!("chunk size:  {}", summary.chunk_size);
    println!("chunks:      {}", summary.chunks);
    println!("stored:      {} bytes", summary.stored_bytes);
    println!("plaintext:   {} bytes", summary.plaintext_bytes);
    println!("largest:     {} bytes", summary.largest_chunk);
    Ok(())
}

// ── `sealfs config show` ──────────────────────────────────────────────────────

fn cmd_config_show(config: &SealfsConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}
