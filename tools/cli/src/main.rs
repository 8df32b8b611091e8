//! vaultferry CLI - move files between storage backends, optionally
//! encrypting or decrypting them on the way.
//!
//! Backends and their roles come from a JSON configuration file; see
//! `vaultferry_storage::config` for the format.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vaultferry_common::{Error, IoDirection, StorageLocation};
use vaultferry_crypto::{DataKey, KdfParams, KeyFile, DEFAULT_CHUNK_SIZE};
use vaultferry_storage::{create_default_registry, FerryConfig, Wiring};
use vaultferry_transfer::{
    load_key, DecryptTransform, EncryptTransform, TransferPipeline, DEFAULT_KEY_PATH, ENCRYPTED_SUFFIX,
};

#[derive(Parser)]
#[command(name = "vaultferry")]
#[command(about = "vaultferry - Encrypted file transfer between storage backends")]
#[command(version)]
struct Cli {
    /// Backend configuration file.
    #[arg(short, long, global = true, default_value = "vaultferry.json")]
    config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where the key file lives and how to unlock it.
#[derive(clap::Args)]
struct KeyArgs {
    /// Key file path on the source backend.
    #[arg(short, long, default_value = DEFAULT_KEY_PATH)]
    key: String,

    /// Container holding the key file (default: the source container).
    #[arg(long)]
    key_container: Option<String>,

    /// Read the key file passphrase from this environment variable
    /// instead of prompting.
    #[arg(long)]
    passphrase_env: Option<String>,
}

/// Which objects a batch command works on.
#[derive(clap::Args)]
struct Selection {
    /// Source container (bucket, blob container or directory).
    #[arg(short = 'C', long)]
    container: String,

    /// Destination container (default: the source container).
    #[arg(short = 'T', long)]
    target_container: Option<String>,

    /// Select every object matching this prefix (wildcards `*` and `?`).
    #[arg(short, long, conflicts_with = "paths")]
    prefix: Option<String>,

    /// Object paths relative to the container.
    paths: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt objects from the source onto the destination.
    Encrypt {
        #[command(flatten)]
        selection: Selection,

        #[command(flatten)]
        key: KeyArgs,

        /// Suffix appended to encrypted object names.
        #[arg(short, long, default_value = ENCRYPTED_SUFFIX)]
        suffix: String,

        /// Encryption chunk size in bytes.
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// Encrypt these local files straight onto the destination.
        #[arg(short, long, num_args = 1..)]
        upload: Vec<PathBuf>,
    },

    /// Decrypt one object from the source to a file or stdout.
    Decrypt {
        /// Source container.
        #[arg(short = 'C', long)]
        container: String,

        /// Encrypted object path.
        path: String,

        #[command(flatten)]
        key: KeyArgs,

        /// Output file (default: stdout).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Copy objects from the source to the destination unchanged.
    Copy {
        #[command(flatten)]
        selection: Selection,
    },

    /// List objects on the source.
    List {
        /// Source container.
        #[arg(short = 'C', long)]
        container: String,

        /// Only list paths matching this prefix.
        #[arg(short, long)]
        prefix: Option<String>,
    },

    /// Generate a new key file on the local disk.
    Keygen {
        /// Where to write the key file.
        #[arg(short, long)]
        out: PathBuf,

        /// Seal the key with a passphrase.
        #[arg(long)]
        seal: bool,

        /// KDF strength for sealed keys: "interactive", "moderate", or "sensitive".
        #[arg(long, default_value = "moderate")]
        kdf: String,

        /// Read the passphrase from this environment variable instead of
        /// prompting.
        #[arg(long)]
        passphrase_env: Option<String>,

        /// Replace an existing key file.
        #[arg(long)]
        force: bool,
    },

    /// Delete objects on the destination.
    Rm {
        /// Destination container.
        #[arg(short = 'C', long)]
        container: String,

        /// Object paths to delete.
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Encrypt {
            selection,
            key,
            suffix,
            chunk_size,
            upload,
        } => cmd_encrypt(&cli.config, &selection, &key, &suffix, chunk_size, &upload).await,

        Commands::Decrypt {
            container,
            path,
            key,
            out,
        } => cmd_decrypt(&cli.config, &container, &path, &key, out.as_deref()).await,

        Commands::Copy { selection } => cmd_copy(&cli.config, &selection).await,

        Commands::List { container, prefix } => cmd_list(&cli.config, &container, prefix.as_deref()).await,

        Commands::Keygen {
            out,
            seal,
            kdf,
            passphrase_env,
            force,
        } => cmd_keygen(&out, seal, &kdf, passphrase_env.as_deref(), force).await,

        Commands::Rm { container, paths } => cmd_rm(&cli.config, &container, &paths).await,
    }
}

/// Build the pipeline described by the configuration file.
fn open_pipeline(config_path: &Path) -> Result<TransferPipeline> {
    let config = FerryConfig::load(config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    let registry = create_default_registry();
    let wiring = Wiring::from_config(&registry, &config).context("Failed to wire backends")?;
    Ok(TransferPipeline::from_wiring(wiring))
}

/// Prompt for password securely.
fn prompt_password(prompt: &str) -> Result<Vec<u8>> {
    let password = rpassword::prompt_password(prompt).context("Failed to read passphrase")?;
    Ok(password.into_bytes())
}

fn passphrase_from_env(var: &str) -> Result<Vec<u8>> {
    let value = std::env::var(var).with_context(|| format!("Environment variable {} is not set", var))?;
    Ok(value.into_bytes())
}

/// Load the data key from the source, asking for a passphrase only when
/// the key file is sealed.
async fn unlock_key(pipeline: &TransferPipeline, args: &KeyArgs, container: &str) -> Result<DataKey> {
    let location = StorageLocation::new(args.key_container.as_deref().unwrap_or(container), args.key.as_str())
        .context("Invalid key location")?;
    let source = pipeline.source().as_ref();

    if let Some(var) = &args.passphrase_env {
        let passphrase = passphrase_from_env(var)?;
        return load_key(source, &location, Some(&passphrase))
            .await
            .with_context(|| format!("Failed to load key {}", location));
    }

    match load_key(source, &location, None).await {
        Err(Error::InvalidArgument(_)) => {
            let passphrase = prompt_password(&format!("Passphrase for {}: ", location))?;
            load_key(source, &location, Some(&passphrase))
                .await
                .with_context(|| format!("Failed to load key {}", location))
        }
        other => other.with_context(|| format!("Failed to load key {}", location)),
    }
}

/// Resolve a selection into (from, to) pairs.
///
/// `skip` is left out of prefix listings, e.g. the key file itself.
async fn select(
    pipeline: &TransferPipeline,
    selection: &Selection,
    suffix: &str,
    skip: Option<&StorageLocation>,
) -> Result<Vec<(StorageLocation, StorageLocation)>> {
    let target = selection.target_container.as_deref().unwrap_or(&selection.container);

    if !selection.paths.is_empty() {
        return selection
            .paths
            .iter()
            .map(|path| {
                let from = StorageLocation::new(selection.container.as_str(), path.as_str())?;
                let to = StorageLocation::new(target, format!("{}{}", path, suffix))?;
                Ok((from, to))
            })
            .collect::<vaultferry_common::Result<Vec<_>>>()
            .context("Invalid object path");
    }

    let mut pairs = pipeline
        .plan(&selection.container, selection.prefix.as_deref(), target, suffix)
        .await
        .with_context(|| format!("Failed to list {}", selection.container))?;

    // Outputs land next to their inputs only when one backend serves both roles.
    let in_place = pipeline.shares_backend() && target == selection.container && !suffix.is_empty();
    pairs.retain(|(from, _)| {
        let keep = Some(from) != skip && !(in_place && from.path().ends_with(suffix));
        if !keep {
            debug!(path = %from, "Skipping");
        }
        keep
    });
    Ok(pairs)
}

async fn run_batch(pipeline: &TransferPipeline, pairs: &[(StorageLocation, StorageLocation)]) -> Result<()> {
    if pairs.is_empty() {
        println!("Nothing to transfer.");
        return Ok(());
    }

    match pipeline.transfer_all(pairs).await {
        Ok(reports) => {
            for report in &reports {
                println!("{}", report);
            }
            Ok(())
        }
        Err(failure) => {
            for report in &failure.completed {
                println!("{}", report);
            }
            Err(failure.into())
        }
    }
}

/// Encrypt selected objects and/or local uploads.
async fn cmd_encrypt(
    config: &Path,
    selection: &Selection,
    key_args: &KeyArgs,
    suffix: &str,
    chunk_size: usize,
    upload: &[PathBuf],
) -> Result<()> {
    let pipeline = open_pipeline(config)?;
    let key = unlock_key(&pipeline, key_args, &selection.container).await?;
    let pipeline = pipeline.with_transform(Arc::new(EncryptTransform::new(key).with_chunk_size(chunk_size)));

    let target = selection.target_container.as_deref().unwrap_or(&selection.container);
    for file in upload {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("{} has no usable file name", file.display()))?;
        let to = StorageLocation::new(target, format!("{}{}", name, suffix)).context("Invalid upload name")?;

        let input = tokio::fs::File::open(file)
            .await
            .with_context(|| format!("Failed to open {}", file.display()))?;
        let report = pipeline
            .deliver(Box::pin(input), &to)
            .await
            .with_context(|| format!("Failed to upload {}", file.display()))?;
        println!("{} -> {}", file.display(), report);
    }

    if upload.is_empty() || !selection.paths.is_empty() || selection.prefix.is_some() {
        let key_location = StorageLocation::new(
            key_args.key_container.as_deref().unwrap_or(&selection.container),
            key_args.key.as_str(),
        )?;
        let pairs = select(&pipeline, selection, suffix, Some(&key_location)).await?;
        info!(count = pairs.len(), "Encrypting");
        run_batch(&pipeline, &pairs).await?;
    }
    Ok(())
}

/// Decrypt one object and stream the plaintext out.
async fn cmd_decrypt(config: &Path, container: &str, path: &str, key_args: &KeyArgs, out: Option<&Path>) -> Result<()> {
    let pipeline = open_pipeline(config)?;
    let key = unlock_key(&pipeline, key_args, container).await?;
    let pipeline = pipeline.with_transform(Arc::new(DecryptTransform::new(key)));

    let from = StorageLocation::new(container, path).context("Invalid object path")?;
    let mut plaintext = pipeline
        .open_transformed(&from)
        .await
        .with_context(|| format!("Failed to open {}", from))?;

    let written = match out {
        Some(out) => {
            let mut file = tokio::fs::File::create(out)
                .await
                .with_context(|| format!("Failed to create {}", out.display()))?;
            let written = tokio::io::copy(&mut plaintext, &mut file).await;
            let written = written.map_err(|e| Error::from_io(e, format!("decrypt {}", from), IoDirection::Read));
            if written.is_err() {
                drop(file);
                let _ = tokio::fs::remove_file(out).await;
            } else {
                file.sync_all().await?;
            }
            written?
        }
        None => {
            let mut stdout = tokio::io::stdout();
            let written = tokio::io::copy(&mut plaintext, &mut stdout)
                .await
                .map_err(|e| Error::from_io(e, format!("decrypt {}", from), IoDirection::Read))?;
            stdout.flush().await?;
            written
        }
    };

    info!(from = %from, bytes = written, "Decrypted");
    Ok(())
}

/// Copy selected objects unchanged.
async fn cmd_copy(config: &Path, selection: &Selection) -> Result<()> {
    let pipeline = open_pipeline(config)?;
    let pairs = select(&pipeline, selection, "", None).await?;

    let onto_itself = pairs.iter().find(|(from, to)| from == to).filter(|_| pipeline.shares_backend());
    if let Some((from, _)) = onto_itself {
        bail!("Copying {} onto itself; pick a different --target-container", from);
    }
    run_batch(&pipeline, &pairs).await
}

/// List source objects.
async fn cmd_list(config: &Path, container: &str, prefix: Option<&str>) -> Result<()> {
    let pipeline = open_pipeline(config)?;
    let mut paths = pipeline.source().list(container, prefix);

    let mut count = 0usize;
    while let Some(path) = paths
        .try_next()
        .await
        .with_context(|| format!("Failed to list {}", container))?
    {
        println!("{}", path);
        count += 1;
    }
    debug!(container, count, "Listed");
    Ok(())
}

/// Generate a key file.
async fn cmd_keygen(out: &Path, seal: bool, kdf: &str, passphrase_env: Option<&str>, force: bool) -> Result<()> {
    if out.exists() && !force {
        bail!("{} already exists; pass --force to replace it", out.display());
    }

    let key = DataKey::generate();
    let key_file = if seal {
        let params = KdfParams::from_name(kdf)?;
        let passphrase = match passphrase_env {
            Some(var) => passphrase_from_env(var)?,
            None => {
                let passphrase = prompt_password("Enter passphrase: ")?;
                let confirm = prompt_password("Confirm passphrase: ")?;
                if passphrase != confirm {
                    bail!("Passphrases do not match");
                }
                passphrase
            }
        };
        if passphrase.is_empty() {
            bail!("Passphrase cannot be empty");
        }
        KeyFile::sealed(&key, &passphrase, params).context("Failed to seal key")?
    } else {
        KeyFile::plain(&key)
    };

    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(out, key_file.to_json()?)
        .await
        .with_context(|| format!("Failed to write {}", out.display()))?;

    println!("Key written to {}", out.display());
    println!("  Fingerprint: {}", key.fingerprint());
    println!("  Sealed: {}", if seal { "yes" } else { "no" });
    Ok(())
}

/// Delete destination objects.
async fn cmd_rm(config: &Path, container: &str, paths: &[String]) -> Result<()> {
    let pipeline = open_pipeline(config)?;

    for path in paths {
        let location = StorageLocation::new(container, path.as_str()).context("Invalid object path")?;
        pipeline
            .destination()
            .delete(&location)
            .await
            .with_context(|| format!("Failed to delete {}", location))?;
        println!("Removed {}", location);
    }
    Ok(())
}
