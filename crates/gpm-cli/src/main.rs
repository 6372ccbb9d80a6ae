//! gpm: mirror a directory into an encrypted, opaquely named blob store
//!
//! Commands:
//!   encrypt        - encrypt new and changed files, drop deleted ones
//!   decrypt        - restore the working directory from the blob store
//!   status         - compare the working directory with the encrypted metadata
//!   keygen         - print a fresh random key for --key / GPM_KEY
//!   config show    - display the active configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gpm_core::config::GpmConfig;
use gpm_crypto::{derive_metadata_key, generate_key, Backend, KdfParams, MasterKey};
use gpm_sync::{Engine, EngineOptions, Layout, ProgressFn};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "gpm",
    version,
    about = "Encrypted mirror of a directory for untrusted storage",
    long_about = "gpm: keep an encrypted, file-for-file mirror of a working directory \
                  that can be committed to a public repository and restored with a passphrase"
)]
struct Cli {
    /// Working directory to encrypt from / decrypt into
    #[arg(long, short = 'd', default_value = ".")]
    directory: PathBuf,

    /// Output directory for blobs (default: <directory>/.gpm/data)
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// Passphrase (prompted when neither this nor --key is given)
    #[arg(long, short = 'p', env = "GPM_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Raw url-safe base64 key instead of a passphrase (see `gpm keygen`)
    #[arg(long, env = "GPM_KEY", hide_env_values = true, conflicts_with = "passphrase")]
    key: Option<String>,

    /// Path to config.toml (default: <directory>/.gpm/config.toml)
    ///
    /// The default stays under `.gpm` even when the config file sets
    /// `sync.reserved_dir` to another name, because the config is read
    /// before that setting is known. Pass --config (or GPM_CONFIG) to use a
    /// config kept in a renamed reserved directory.
    #[arg(long, env = "GPM_CONFIG")]
    config: Option<PathBuf>,

    /// Log format (json, text); overrides the config file
    #[arg(long, env = "GPM_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt new and modified files into the output directory
    Encrypt,

    /// Restore the working directory from the output directory
    ///
    /// Files without a metadata entry are removed, along with directories
    /// that end up empty or sit where a tracked file belongs. Unreferenced
    /// blobs are garbage-collected.
    Decrypt,

    /// Show which files changed since the last encrypt
    Status,

    /// Print a new random key usable with --key
    Keygen,

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

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = config_path(&cli);
    let config = GpmConfig::load_or_default(&config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;

    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| log_format_from_config(&config));
    init_logging(&config.log.level, &format);

    match cli.command {
        Commands::Encrypt => cmd_encrypt(&cli, &config),
        Commands::Decrypt => cmd_decrypt(&cli, &config),
        Commands::Status => cmd_status(&cli, &config),
        Commands::Keygen => cmd_keygen(),
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
    }
}

/// `--config` wins; otherwise the config lives in the default reserved
/// directory, whatever `sync.reserved_dir` later says.
fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(|| {
        let reserved = gpm_core::config::SyncConfig::default().reserved_dir;
        cli.directory.join(reserved).join("config.toml")
    })
}

fn log_format_from_config(config: &GpmConfig) -> LogFormat {
    match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_env("GPM_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level));

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

// ── Keys and engine ───────────────────────────────────────────────────────────

fn master_key(cli: &Cli, config: &GpmConfig) -> Result<MasterKey> {
    if let Some(key) = &cli.key {
        return MasterKey::from_base64(key).context("parsing --key");
    }

    let passphrase = match &cli.passphrase {
        Some(p) => SecretString::from(p.clone()),
        None => SecretString::from(
            rpassword::prompt_password("Passphrase: ").context("reading passphrase")?,
        ),
    };
    MasterKey::from_passphrase(&passphrase, &KdfParams::from(&config.crypto))
        .context("deriving master key")
}

fn build_engine(cli: &Cli, config: &GpmConfig) -> Result<Engine> {
    let master = master_key(cli, config)?;
    let metadata_key = derive_metadata_key(&master).context("deriving metadata key")?;
    let layout = Layout::new(&cli.directory, cli.output.as_deref(), &config.sync);

    tracing::debug!(
        root = %layout.root().display(),
        output = %layout.output_dir().display(),
        backend = ?config.crypto.backend,
        "engine configured"
    );

    Engine::new(
        layout,
        Backend::from_config(config),
        metadata_key,
        EngineOptions::from(config),
    )
    .context("configuring engine")
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Spinner that turns into a bar once the engine reports a total.
fn progress_for(pb: &ProgressBar) -> ProgressFn {
    let pb = pb.clone();
    Box::new(move |done, total, msg| {
        if total > 0 && pb.length() != Some(total) {
            pb.set_style(
                ProgressStyle::with_template(
                    "{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
            );
            pb.set_length(total);
        }
        pb.set_position(done);
        pb.set_message(msg.to_string());
    })
}

// ── `gpm encrypt` ─────────────────────────────────────────────────────────────

fn cmd_encrypt(cli: &Cli, config: &GpmConfig) -> Result<()> {
    let mut engine = build_engine(cli, config)?;

    let pb = make_spinner("encrypt");
    pb.set_message("scanning files...");
    let progress = progress_for(&pb);
    let result = engine.encrypt(Some(&progress));
    pb.finish_and_clear();

    let report = result.with_context(|| {
        format!("encrypting {}", engine.layout().root().display())
    })?;

    println!("Encrypt complete:");
    println!("  added:     {} files", report.added);
    println!("  modified:  {} files", report.modified);
    println!("  deleted:   {} files", report.deleted);
    println!("  skipped:   {} files (unchanged)", report.skipped);
    println!("  output:    {}", engine.layout().output_dir().display());
    Ok(())
}

// ── `gpm decrypt` ─────────────────────────────────────────────────────────────

fn cmd_decrypt(cli: &Cli, config: &GpmConfig) -> Result<()> {
    let mut engine = build_engine(cli, config)?;

    let pb = make_spinner("decrypt");
    pb.set_message("loading metadata...");
    let progress = progress_for(&pb);
    let result = engine.decrypt(Some(&progress));
    pb.finish_and_clear();

    let report = result.with_context(|| {
        format!("decrypting into {}", engine.layout().root().display())
    })?;

    println!("Decrypt complete:");
    println!("  restored:  {} files", report.restored);
    println!("  unchanged: {} files", report.unchanged);
    println!("  removed:   {} untracked files", report.removed_files);
    println!("  pruned:    {} directories", report.removed_dirs);
    println!("  collected: {} orphan blobs", report.collected_blobs);
    Ok(())
}

// ── `gpm status` ──────────────────────────────────────────────────────────────

fn cmd_status(cli: &Cli, config: &GpmConfig) -> Result<()> {
    let engine = build_engine(cli, config)?;
    let entries = engine.status().context("reading status")?;

    if entries.is_empty() {
        println!("nothing tracked");
        return Ok(());
    }
    for entry in &entries {
        println!("{:>10}  {}", entry.status.to_string(), entry.path);
    }
    Ok(())
}

// ── `gpm keygen` / `gpm config show` ─────────────────────────────────────────

fn cmd_keygen() -> Result<()> {
    println!("{}", generate_key().to_base64());
    Ok(())
}

fn cmd_config_show(config: &GpmConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}
