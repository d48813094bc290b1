//! sealdrop: authenticated file containers and resumable chunked uploads
//!
//! Container commands:
//!   encrypt <in> <out>         - seal a file into a container
//!   decrypt <in> <out>         - open a container (nothing written on failure)
//!   verify <in>                - authenticate every frame, discard plaintext
//!   identify <path>...         - report container format
//!   upgrade <in> [<out>]       - re-encrypt a legacy container
//!   upgrade-dir <dir>          - upgrade every legacy container in a directory
//!   self-test                  - round-trip a sample through the codec
//!
//! Upload commands:
//!   upload <file>              - split, submit, finalize (resumes a session)
//!   status <session>           - staged chunk indices and session state
//!   sweep                      - reclaim idle staging
//!
//! The container secret is read from SEALDROP_SECRET or prompted for.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use sealdrop_core::SealdropConfig;
use sealdrop_crypto::{CryptoError, DerivedKey, KdfParams};
use sealdrop_upload::{sha256_hex, SubmitOutcome, UploadPipeline};

const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "sealdrop",
    version,
    about = "Authenticated file containers and resumable chunked uploads"
)]
struct Cli {
    /// Path to sealdrop.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "SEALDROP_CONFIG",
        default_value = "~/.config/sealdrop/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "SEALDROP_LOG")]
    log: Option<String>,

    /// Log format; overrides the config file
    #[arg(long, env = "SEALDROP_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt a file into a container
    Encrypt { input: PathBuf, output: PathBuf },

    /// Decrypt a container; the output is only created if every frame authenticates
    Decrypt { input: PathBuf, output: PathBuf },

    /// Authenticate a container without writing plaintext
    Verify { input: PathBuf },

    /// Report the container format of one or more files
    Identify {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Re-encrypt a legacy container in the current format
    ///
    /// Without an output path the file is replaced in place, only after the
    /// new container has been written and checked.
    Upgrade {
        input: PathBuf,
        output: Option<PathBuf>,
    },

    /// Upgrade every legacy container directly inside a directory
    #[command(name = "upgrade-dir")]
    UpgradeDir { dir: PathBuf },

    /// Round-trip a sample through the container codec with the configured key
    #[command(name = "self-test")]
    SelfTest,

    // ── Chunked uploads ──────────────────────────────────────────────────────

    /// Upload a file in verified chunks, then merge it
    ///
    /// Re-running with the same --session skips chunks already staged.
    Upload {
        file: PathBuf,
        /// Session id (default: random)
        #[arg(long, short = 's')]
        session: Option<String>,
        /// Chunk size in bytes
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        /// Container output path (default: <file>.sdp)
        #[arg(long, short = 'o', conflicts_with = "plain")]
        output: Option<PathBuf>,
        /// Merge into a plaintext file under storage_dir instead of sealing
        #[arg(long)]
        plain: bool,
    },

    /// Show staged chunks and state of an upload session
    Status { session: String },

    /// Reclaim staging of sessions idle longer than the TTL
    Sweep {
        /// Idle TTL in seconds (default: upload.session_ttl_secs)
        #[arg(long)]
        ttl_secs: Option<u64>,
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

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = load_config(&config_path)?;

    init_logging(
        cli.log.as_deref().unwrap_or(&config.logging.level),
        cli.log_format.as_ref(),
        &config.logging.format,
    );
    debug!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "sealdrop starting"
    );

    match cli.command {
        Commands::Encrypt { input, output } => cmd_encrypt(&config, &input, &output),
        Commands::Decrypt { input, output } => cmd_decrypt(&config, &input, &output),
        Commands::Verify { input } => cmd_verify(&config, &input),
        Commands::Identify { paths } => cmd_identify(&paths),
        Commands::Upgrade { input, output } => cmd_upgrade(&config, &input, output.as_deref()),
        Commands::UpgradeDir { dir } => cmd_upgrade_dir(&config, &dir),
        Commands::SelfTest => cmd_self_test(&config),
        Commands::Upload {
            file,
            session,
            chunk_size,
            output,
            plain,
        } => cmd_upload(&config, &file, session, chunk_size, output, plain).await,
        Commands::Status { session } => cmd_status(&config, &session).await,
        Commands::Sweep { ttl_secs } => cmd_sweep(&config, ttl_secs).await,
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

fn load_config(path: &Path) -> Result<SealdropConfig> {
    let mut config = if path.exists() {
        SealdropConfig::load(path).with_context(|| format!("loading config: {}", path.display()))?
    } else {
        SealdropConfig::default()
    };

    if let Ok(salt) = std::env::var("SEALDROP_SALT") {
        config.crypto.salt = salt;
    }
    config.storage.staging_dir = expand_tilde(&config.storage.staging_dir);
    config.storage.storage_dir = expand_tilde(&config.storage.storage_dir);
    Ok(config)
}

fn init_logging(level: &str, format_override: Option<&LogFormat>, config_format: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let json = match format_override {
        Some(LogFormat::Json) => true,
        Some(LogFormat::Text) => false,
        None => config_format == "json",
    };

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

// ── Key derivation ────────────────────────────────────────────────────────────

/// Derive the container key: SEALDROP_SECRET or an interactive prompt,
/// salted with crypto.salt.
fn load_key(config: &SealdropConfig) -> Result<DerivedKey> {
    config.validate().context("invalid configuration")?;

    let secret = match std::env::var("SEALDROP_SECRET") {
        Ok(s) => SecretString::from(s),
        Err(_) => SecretString::from(
            rpassword::prompt_password("Secret: ").context("reading secret from terminal")?,
        ),
    };
    let params = KdfParams {
        iterations: config.crypto.kdf_iterations,
    };
    sealdrop_crypto::derive_key(&secret, config.crypto.salt.as_bytes(), &params)
        .context("deriving container key")
}

/// Attach a readable hint to integrity failures.
fn explain(e: CryptoError, what: &Path) -> anyhow::Error {
    if e.is_integrity() {
        anyhow::Error::new(e).context(format!(
            "{} failed integrity checks (wrong secret, or the file was modified)",
            what.display()
        ))
    } else {
        anyhow::Error::new(e).context(format!("processing {}", what.display()))
    }
}

// ── Container commands ────────────────────────────────────────────────────────

fn cmd_encrypt(config: &SealdropConfig, input: &Path, output: &Path) -> Result<()> {
    let key = load_key(config)?;
    let n = sealdrop_crypto::encrypt_file(input, output, &key).map_err(|e| explain(e, input))?;
    println!("encrypted {} ({}) → {}", input.display(), fmt_bytes(n), output.display());
    Ok(())
}

fn cmd_decrypt(config: &SealdropConfig, input: &Path, output: &Path) -> Result<()> {
    let key = load_key(config)?;
    let n = sealdrop_crypto::decrypt_file(input, output, &key).map_err(|e| explain(e, input))?;
    println!("decrypted {} ({}) → {}", input.display(), fmt_bytes(n), output.display());
    Ok(())
}

fn cmd_verify(config: &SealdropConfig, input: &Path) -> Result<()> {
    let key = load_key(config)?;
    let n = sealdrop_crypto::verify_file(input, &key).map_err(|e| explain(e, input))?;
    println!("{}: ok ({})", input.display(), fmt_bytes(n));
    Ok(())
}

fn cmd_identify(paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        match sealdrop_crypto::identify_file(path) {
            Ok(kind) => println!("{}: {kind}", path.display()),
            Err(e) => println!("{}: error: {e}", path.display()),
        }
    }
    Ok(())
}

fn cmd_upgrade(config: &SealdropConfig, input: &Path, output: Option<&Path>) -> Result<()> {
    let key = load_key(config)?;
    let n = match output {
        Some(out) => sealdrop_crypto::upgrade_file(input, out, &key),
        None => sealdrop_crypto::upgrade_in_place(input, &key),
    }
    .map_err(|e| explain(e, input))?;

    let dest = output.unwrap_or(input);
    println!("upgraded {} ({}) → {}", input.display(), fmt_bytes(n), dest.display());
    Ok(())
}

fn cmd_upgrade_dir(config: &SealdropConfig, dir: &Path) -> Result<()> {
    let key = load_key(config)?;
    let stats = sealdrop_crypto::batch_upgrade_dir(dir, &key);
    println!("{}", serde_json::to_string_pretty(&stats)?);
    if stats.failed > 0 {
        anyhow::bail!("{} of {} files failed to upgrade", stats.failed, stats.total);
    }
    Ok(())
}

fn cmd_self_test(config: &SealdropConfig) -> Result<()> {
    let key = load_key(config)?;
    sealdrop_crypto::self_test(&key).context("container self-test failed")?;
    println!("self-test passed");
    Ok(())
}

// ── `sealdrop upload` ─────────────────────────────────────────────────────────

async fn cmd_upload(
    config: &SealdropConfig,
    file: &Path,
    session: Option<String>,
    chunk_size: usize,
    output: Option<PathBuf>,
    plain: bool,
) -> Result<()> {
    if chunk_size == 0 {
        anyhow::bail!("--chunk-size must be at least 1");
    }
    // Sealed uploads need the key before any chunk moves.
    let key = if plain { None } else { Some(load_key(config)?) };

    let pipeline = UploadPipeline::from_config(config).context("starting upload pipeline")?;
    let session = session.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

    let len = std::fs::metadata(file)
        .with_context(|| format!("reading {}", file.display()))?
        .len();
    let total = chunk_count(len, chunk_size)?;

    let staged = pipeline.receiver().status(&session).await?;
    if !staged.is_empty() {
        info!(session = %session, staged = staged.len(), total, "resuming upload");
    }

    let mut src = std::fs::File::open(file).with_context(|| format!("opening {}", file.display()))?;
    let mut whole = Sha256::new();
    let mut buf = vec![0u8; chunk_size];

    for index in 0..total {
        let n = read_chunk(&mut src, &mut buf)?;
        whole.update(&buf[..n]);
        if staged.binary_search(&index).is_ok() {
            continue;
        }

        let chunk = buf[..n].to_vec();
        let digest = sha256_hex(&chunk);
        match pipeline
            .receiver()
            .submit_chunk(&session, index, total, chunk, &digest)
            .await?
        {
            SubmitOutcome::Accepted { .. } => debug!(session = %session, index, "chunk sent"),
            SubmitOutcome::Rejected(reason) => {
                anyhow::bail!("chunk {index} of session {session} rejected: {reason}")
            }
        }
    }
    let expected = hex::encode(whole.finalize());

    let merged = match key {
        None => {
            pipeline
                .assembler()
                .finalize_verified(&session, total, &expected)
                .await?
        }
        Some(key) => {
            let dest = output.unwrap_or_else(|| default_container_path(file));
            pipeline
                .assembler()
                .finalize_encrypted(&session, total, &dest, &key, Some(&expected))
                .await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&merged)?);
    Ok(())
}

/// Number of chunks for `len` bytes; an empty file is one empty chunk.
fn chunk_count(len: u64, chunk_size: usize) -> Result<u32> {
    let n = len.div_ceil(chunk_size as u64).max(1);
    u32::try_from(n).with_context(|| format!("{n} chunks exceeds the per-session limit"))
}

/// Fill `buf` from `src`; short only at end of file.
fn read_chunk(src: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("reading upload source"),
        }
    }
    Ok(filled)
}

fn default_container_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(".sdp");
    PathBuf::from(name)
}

// ── `sealdrop status` / `sealdrop sweep` ──────────────────────────────────────

async fn cmd_status(config: &SealdropConfig, session: &str) -> Result<()> {
    let pipeline = UploadPipeline::from_config(config)?;
    let staged = pipeline.receiver().status(session).await?;
    let state = pipeline.receiver().session_state(session).await?;

    let report = serde_json::json!({
        "session": session,
        "state": state,
        "staged": staged,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_sweep(config: &SealdropConfig, ttl_secs: Option<u64>) -> Result<()> {
    let ttl = Duration::from_secs(ttl_secs.unwrap_or(config.upload.session_ttl_secs));
    let pipeline = UploadPipeline::from_config(config)?;
    let reclaimed = pipeline.receiver().sweep_expired(ttl).await?;

    if reclaimed.is_empty() {
        println!("no idle sessions");
    } else {
        for id in &reclaimed {
            println!("reclaimed {id}");
        }
    }
    Ok(())
}

// ── `sealdrop config show` ────────────────────────────────────────────────────

fn cmd_config_show(config: &SealdropConfig, config_path: &Path) -> Result<()> {
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

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
