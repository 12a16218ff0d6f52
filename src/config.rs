//! Configuration management

use crate::chunk::DEFAULT_CHUNK_SIZE;
use crate::error::{Error, Result};
use crate::fingerprint::{default_hash_workers, MAX_HASH_WORKERS};
use crate::transfer::DEFAULT_TRANSFER_CONCURRENCY;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default destination folder on the server
pub const DEFAULT_DESTINATION: &str = "my-files";

/// Largest chunk size accepted (1 GiB)
const MAX_CHUNK_SIZE: u64 = 1024 * 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub chunk: ChunkConfig,
    pub hashing: HashingConfig,
    pub transfer: TransferConfig,
    pub logging: LoggingConfig,
}

/// Upload server connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL, e.g. `http://localhost:8080`
    pub base_url: String,

    /// Bearer token sent with every request
    pub auth_token: Option<String>,

    /// Per-request timeout
    pub request_timeout_secs: u64,

    /// Retries for probe and chunk requests
    pub retry_attempts: u32,

    /// Base delay for exponential backoff
    pub retry_base_delay_ms: u64,
}

/// Chunking settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Chunk size in bytes
    pub chunk_size: u64,

    /// Probe with the full-file fingerprint instead of the quick signature
    pub full_fingerprint: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HashingConfig {
    /// Parallel hash workers
    pub workers: usize,

    /// Minimum milliseconds between progress reports
    pub report_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Concurrent chunk uploads per file
    pub max_concurrent_chunks: usize,

    /// Server folder used when none is given
    pub default_destination: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path
    pub file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            base_url: "http://localhost:8080".to_string(),
            auth_token: None,
            request_timeout_secs: 60,
            retry_attempts: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        ChunkConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            full_fingerprint: false,
        }
    }
}

impl Default for HashingConfig {
    fn default() -> Self {
        HashingConfig {
            workers: default_hash_workers(),
            report_interval_ms: 500,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            max_concurrent_chunks: DEFAULT_TRANSFER_CONCURRENCY,
            default_destination: DEFAULT_DESTINATION.to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

impl Config {
    /// Default config location (`~/.config/cloudlift/config.yaml`)
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cloudlift")
            .join("config.yaml")
    }

    /// Load configuration from a file (YAML or JSON), with environment
    /// variable substitution and overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = std::fs::read_to_string(path_ref).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config = Self::parse(path_ref, &content, |name| std::env::var(name).ok())?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise defaults plus environment overrides
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_path);
        if path.exists() {
            return Self::load(&path);
        }

        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn parse<F>(path: &Path, content: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let content = substitute_env_vars(content, lookup)?;

        if is_yaml(path) {
            serde_yaml::from_str(&content).map_err(|e| {
                Error::Config(format!("Failed to parse YAML config: {}", e))
            })
        } else {
            serde_json::from_str(&content).map_err(|e| {
                Error::Config(format!("Failed to parse JSON config: {}", e))
            })
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(url) = var("CLOUDLIFT_SERVER_URL") {
            self.server.base_url = url;
        }

        if let Some(token) = var("CLOUDLIFT_TOKEN") {
            self.server.auth_token = Some(token);
        }

        if let Some(size) = var("CLOUDLIFT_CHUNK_SIZE").and_then(|v| v.parse::<u64>().ok()) {
            self.chunk.chunk_size = size;
        }

        if let Some(workers) = var("CLOUDLIFT_HASH_WORKERS").and_then(|v| v.parse::<usize>().ok()) {
            self.hashing.workers = workers;
        }

        if let Some(n) = var("CLOUDLIFT_CONCURRENCY").and_then(|v| v.parse::<usize>().ok()) {
            self.transfer.max_concurrent_chunks = n;
        }
    }

    /// Save configuration to a file (format determined by extension)
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();

        let content = if is_yaml(path_ref) {
            serde_yaml::to_string(self).map_err(|e| {
                Error::Config(format!("Failed to serialize config to YAML: {}", e))
            })?
        } else {
            serde_json::to_string_pretty(self).map_err(|e| {
                Error::Config(format!("Failed to serialize config to JSON: {}", e))
            })?
        };

        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path_ref, content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.base_url.is_empty() {
            return Err(Error::InvalidConfig(
                "Server base URL is required".to_string(),
            ));
        }

        if !self.server.base_url.starts_with("http://")
            && !self.server.base_url.starts_with("https://")
        {
            return Err(Error::InvalidConfig(format!(
                "Server base URL must be http(s): {}",
                self.server.base_url
            )));
        }

        if self.server.request_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "Request timeout must be greater than 0".to_string(),
            ));
        }

        if self.chunk.chunk_size == 0 {
            return Err(Error::InvalidConfig(
                "Chunk size must be greater than 0".to_string(),
            ));
        }

        if self.chunk.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidConfig(
                "Chunk size exceeds the 1 GiB limit".to_string(),
            ));
        }

        if self.hashing.workers == 0 || self.hashing.workers > MAX_HASH_WORKERS {
            return Err(Error::InvalidConfig(format!(
                "Hash workers must be between 1 and {}",
                MAX_HASH_WORKERS
            )));
        }

        if self.transfer.max_concurrent_chunks == 0 {
            return Err(Error::InvalidConfig(
                "Transfer concurrency must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Substitute `${VAR_NAME}` references using `lookup`.
/// Unknown variables are left as written.
fn substitute_env_vars<F>(content: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
        .map_err(|e| Error::Internal(format!("env pattern: {}", e)))?;

    let result = re.replace_all(content, |caps: &regex::Captures| {
        lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
    });
    Ok(result.into_owned())
}
