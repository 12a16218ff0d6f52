//! cloudlift - Resumable chunked uploads
//!
//! Usage:
//!   cloudlift init                     - Write a default configuration
//!   cloudlift upload <files>...        - Upload files
//!   cloudlift fingerprint <file>       - Print a file's content fingerprint
//!   cloudlift probe <file>             - Ask the server what it holds for a file

use clap::{Parser, Subcommand};
use cloudlift::{
    chunk::{split, ChunkSource, FileSource},
    client::{HttpStorageClient, StorageClient},
    config::{Config, LoggingConfig},
    fingerprint::{Fingerprint, FingerprintEngine, HashProgress},
    manager::{UploadManager, UploadOptions, UploadRequest},
    registry::{TaskEvent, TaskStatus, UploadTask},
    Error, Result,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cloudlift")]
#[command(author = "cloudlift Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Resumable, deduplicating chunked file uploader")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Upload server base URL
        #[arg(long)]
        server: Option<String>,

        /// Overwrite an existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Upload one or more files
    Upload {
        /// Files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Destination folder on the server
        #[arg(short, long)]
        dest: Option<String>,
    },

    /// Compute a file's fingerprint
    Fingerprint {
        file: PathBuf,

        /// Hash only the first and last chunk
        #[arg(short, long)]
        quick: bool,
    },

    /// Show the server's resume state for a file
    Probe {
        file: PathBuf,

        /// Probe by full-file fingerprint
        #[arg(long)]
        full: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .as_ref()
        .map(|p| expand_tilde(p))
        .unwrap_or_else(Config::default_path);

    // Init runs before any config exists
    let loaded = match &cli.command {
        Commands::Init { .. } => Ok(Config::default()),
        _ => Config::load_or_default(Some(&config_path)),
    };

    let logging = loaded
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    init_logging(cli.verbose, &logging);

    let result = loaded.and_then(|config| run_command(cli.command, &config_path, config));
    if let Err(e) = result {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Install the fmt subscriber. `RUST_LOG` wins over `--verbose`, which wins
/// over the configured level.
fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cloudlift={}", default_level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = match &logging.file {
        Some(path) => match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init(),
            Err(e) => {
                eprintln!("Cannot open log file {}: {}", path.display(), e);
                builder.with_writer(std::io::stderr).try_init()
            }
        },
        None => builder.with_writer(std::io::stderr).try_init(),
    };

    if let Err(e) = installed {
        eprintln!("Failed to set subscriber: {}", e);
    }
}

fn run_command(command: Commands, config_path: &Path, config: Config) -> Result<()> {
    match command {
        Commands::Init { server, force } => cmd_init(config_path, server, force),

        Commands::Upload { files, dest } => cmd_upload(&config, files, dest),

        Commands::Fingerprint { file, quick } => cmd_fingerprint(&config, &file, quick),

        Commands::Probe { file, full } => cmd_probe(&config, &file, full),
    }
}

fn cmd_init(config_path: &Path, server: Option<String>, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        return Err(Error::InvalidConfig(format!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        )));
    }

    let mut config = Config::default();
    if let Some(url) = server {
        config.server.base_url = url;
    }
    config.validate()?;
    config.save(config_path)?;

    info!("Configuration saved to {:?}", config_path);
    info!("Server: {}", config.server.base_url);
    info!("Run 'cloudlift upload <file>' to upload");
    Ok(())
}

fn cmd_upload(config: &Config, files: Vec<PathBuf>, dest: Option<String>) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        let client = HttpStorageClient::new(&config.server)?;
        let manager = UploadManager::new(Arc::new(client), UploadOptions::from(config));
        let printer = tokio::spawn(print_events(manager.subscribe()));

        let mut submitted = 0usize;
        for path in files {
            let mut request = UploadRequest::new(expand_tilde(&path));
            if let Some(dest) = &dest {
                request = request.with_destination(dest.clone());
            }
            match manager.submit(request) {
                Ok(_) => submitted += 1,
                Err(e) => error!("Skipping {}: {}", path.display(), e),
            }
        }

        let tasks = tokio::select! {
            tasks = manager.wait_all() => tasks?,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling uploads");
                manager.cancel_all();
                manager.wait_all().await?
            }
        };
        printer.abort();

        let stats = manager.registry().stats();
        info!(
            "{} submitted, {} completed, {} failed",
            submitted, stats.completed, stats.failed
        );
        for task in tasks.iter().filter(|t| t.status == TaskStatus::Error) {
            error!("{}: {}", task.file_name, task.message);
        }

        if submitted == 0 {
            return Err(Error::InvalidArgument("no files could be submitted".to_string()));
        }
        if stats.failed > 0 {
            return Err(Error::Internal(format!(
                "{} of {} uploads failed",
                stats.failed, stats.total
            )));
        }
        Ok::<(), Error>(())
    })
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<TaskEvent>) {
    loop {
        match events.recv().await {
            Ok(TaskEvent::Updated(task)) => print_task(&task),
            Ok(TaskEvent::Removed(_)) => {}
            Err(RecvError::Lagged(skipped)) => warn!("Dropped {} progress events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_task(task: &UploadTask) {
    match task.status {
        TaskStatus::Uploading => println!(
            "[{}] {} {:>3}% {}",
            task.id,
            task.file_name,
            task.progress,
            format_speed(task.speed)
        ),
        TaskStatus::Success => println!(
            "[{}] {} done -> {}",
            task.id,
            task.file_name,
            task.location.as_deref().unwrap_or("")
        ),
        TaskStatus::Error => println!("[{}] {} failed: {}", task.id, task.file_name, task.message),
        TaskStatus::Waiting | TaskStatus::Merging => {
            if !task.message.is_empty() {
                println!("[{}] {} {}", task.id, task.file_name, task.message);
            }
        }
    }
}

fn format_speed(bytes_per_sec: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
    let mut value = bytes_per_sec;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Fingerprint `path` the same way the upload pipeline does
async fn fingerprint_file(config: &Config, path: &Path, quick: bool) -> Result<Fingerprint> {
    let source = FileSource::open(path)?;
    if source.is_empty() {
        return Err(Error::InvalidArgument(format!("{} is empty", path.display())));
    }
    let chunks = split(source.len(), config.chunk.chunk_size)?;
    let engine = FingerprintEngine::new(Arc::new(source)).with_workers(config.hashing.workers);
    let cancel = CancellationToken::new();

    let on_progress = |p: HashProgress| {
        info!(
            "Hashed {}/{} chunks ({})",
            p.processed_chunks,
            p.total_chunks,
            format_speed(p.speed)
        );
    };

    if quick {
        engine
            .quick_signature(config.chunk.chunk_size, on_progress, &cancel)
            .await
    } else {
        engine.compute(&chunks, on_progress, &cancel).await
    }
}

fn cmd_fingerprint(config: &Config, path: &Path, quick: bool) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    let fingerprint = runtime.block_on(fingerprint_file(config, &expand_tilde(path), quick))?;
    println!("{}", fingerprint);
    Ok(())
}

fn cmd_probe(config: &Config, path: &Path, full: bool) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        let quick = !(full || config.chunk.full_fingerprint);
        let fingerprint = fingerprint_file(config, &expand_tilde(path), quick).await?;
        let client = HttpStorageClient::new(&config.server)?;
        let manifest = client.probe_upload(&fingerprint).await?;

        println!("fingerprint: {}", fingerprint);
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        Ok::<(), Error>(())
    })
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
