//! Upload pipelines
//!
//! [`UploadManager`] registers each submitted file with the
//! [`UploadRegistry`] and runs one pipeline task per file:
//! split, fingerprint, probe the server, transfer missing chunks, merge.

use crate::chunk::{split, ChunkSource, FileSource};
use crate::client::{RemoteLocation, StorageClient};
use crate::config::{Config, DEFAULT_DESTINATION};
use crate::error::{Error, Result};
use crate::fingerprint::{default_hash_workers, FingerprintEngine, HashProgress};
use crate::progress::{percent, DEFAULT_REPORT_INTERVAL};
use crate::registry::{CancelOutcome, TaskEvent, TaskHandle, TaskId, UploadRegistry, UploadTask};
use crate::transfer::{FileIdentity, TransferScheduler, DEFAULT_TRANSFER_CONCURRENCY};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A file to upload
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub path: PathBuf,
    /// Server folder; the configured default when `None`
    pub destination: Option<String>,
}

impl UploadRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        UploadRequest {
            path: path.into(),
            destination: None,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub chunk_size: u64,
    /// Hash the whole file before probing instead of the quick signature
    pub full_fingerprint: bool,
    pub hash_workers: usize,
    pub transfer_concurrency: usize,
    pub report_interval: Duration,
    pub default_destination: String,
}

impl Default for UploadOptions {
    fn default() -> Self {
        UploadOptions {
            chunk_size: crate::chunk::DEFAULT_CHUNK_SIZE,
            full_fingerprint: false,
            hash_workers: default_hash_workers(),
            transfer_concurrency: DEFAULT_TRANSFER_CONCURRENCY,
            report_interval: DEFAULT_REPORT_INTERVAL,
            default_destination: DEFAULT_DESTINATION.to_string(),
        }
    }
}

impl From<&Config> for UploadOptions {
    fn from(config: &Config) -> Self {
        UploadOptions {
            chunk_size: config.chunk.chunk_size,
            full_fingerprint: config.chunk.full_fingerprint,
            hash_workers: config.hashing.workers,
            transfer_concurrency: config.transfer.max_concurrent_chunks,
            report_interval: Duration::from_millis(config.hashing.report_interval_ms),
            default_destination: config.transfer.default_destination.clone(),
        }
    }
}

/// Runs upload pipelines and exposes task lifecycle operations
pub struct UploadManager {
    registry: Arc<UploadRegistry>,
    client: Arc<dyn StorageClient>,
    options: UploadOptions,
    requests: DashMap<TaskId, UploadRequest>,
    running: DashMap<TaskId, JoinHandle<()>>,
}

impl UploadManager {
    pub fn new(client: Arc<dyn StorageClient>, options: UploadOptions) -> Self {
        UploadManager {
            registry: Arc::new(UploadRegistry::new()),
            client,
            options,
            requests: DashMap::new(),
            running: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<UploadRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.registry.subscribe()
    }

    /// Register a file and start uploading it.
    ///
    /// Empty and unreadable files are rejected before a task is created.
    pub fn submit(&self, request: UploadRequest) -> Result<TaskId> {
        let source = FileSource::open(&request.path)?;
        if source.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "{} is empty",
                request.path.display()
            )));
        }
        let file_name = file_name_of(&request)?;

        let handle = self.registry.add(&file_name, source.len());
        let id = handle.id;
        self.requests.insert(id, request.clone());
        self.spawn(request, handle);

        info!(task = id, file = %file_name, size = source.len(), "Upload submitted");
        Ok(id)
    }

    fn spawn(&self, request: UploadRequest, handle: TaskHandle) {
        let id = handle.id;
        let pipeline = Pipeline {
            registry: Arc::clone(&self.registry),
            client: Arc::clone(&self.client),
            options: self.options.clone(),
            request,
            handle,
        };
        let join = tokio::spawn(pipeline.run());
        // Nobody waited on these; drop them before they accumulate
        self.running.retain(|_, join| !join.is_finished());
        self.running.insert(id, join);
    }

    /// Wait for the task's current pipeline and return its final snapshot
    pub async fn wait(&self, id: TaskId) -> Result<UploadTask> {
        if let Some((_, join)) = self.running.remove(&id) {
            join.await?;
        }
        self.registry.get(id).ok_or(Error::TaskNotFound(id))
    }

    /// Wait for every running pipeline
    pub async fn wait_all(&self) -> Result<Vec<UploadTask>> {
        let ids: Vec<TaskId> = self.running.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, join)) = self.running.remove(&id) {
                join.await?;
            }
        }
        Ok(self.registry.list())
    }

    /// Restart a failed task from a fresh probe
    pub fn retry(&self, id: TaskId) -> Result<()> {
        let request = self
            .requests
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(Error::TaskNotFound(id))?;
        let handle = self.registry.retry(id)?;
        self.spawn(request, handle);
        Ok(())
    }

    /// Retry every failed task, returning how many were restarted
    pub fn retry_all_failed(&self) -> usize {
        self.registry
            .failed_ids()
            .into_iter()
            .filter(|id| self.retry(*id).is_ok())
            .count()
    }

    pub fn cancel(&self, id: TaskId) -> CancelOutcome {
        let outcome = self.registry.cancel(id);
        if outcome == CancelOutcome::Removed {
            self.requests.remove(&id);
        }
        outcome
    }

    pub fn cancel_all(&self) -> usize {
        self.registry.cancel_all()
    }

    pub fn clear_completed(&self) -> usize {
        let removed = self.registry.clear_completed();
        self.requests
            .retain(|id, _| self.registry.get(*id).is_some());
        removed
    }
}

fn file_name_of(request: &UploadRequest) -> Result<String> {
    request
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::InvalidArgument(format!("{} has no file name", request.path.display()))
        })
}

/// One attempt at uploading one file
struct Pipeline {
    registry: Arc<UploadRegistry>,
    client: Arc<dyn StorageClient>,
    options: UploadOptions,
    request: UploadRequest,
    handle: TaskHandle,
}

impl Pipeline {
    async fn run(self) {
        match self.attempt().await {
            Ok(location) => {
                self.registry.complete(&self.handle, &location.location);
            }
            Err(e) if e.is_cancelled() => {
                debug!(task = self.handle.id, "Pipeline stopped after cancellation");
            }
            Err(e) => {
                self.registry.fail(&self.handle, &e.to_string());
            }
        }
    }

    async fn attempt(&self) -> Result<RemoteLocation> {
        let registry = &self.registry;
        let handle = &self.handle;
        let cancel = &handle.cancel;
        let options = &self.options;

        let source = FileSource::open(&self.request.path)?;
        let expected = registry.get(handle.id).map(|t| t.file_size).unwrap_or(0);
        if source.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "{} changed size since submission",
                self.request.path.display()
            )));
        }
        let source: Arc<dyn ChunkSource> = Arc::new(source);
        let file_size = source.len();
        let chunks = split(file_size, options.chunk_size)?;

        // Fingerprint
        registry.set_message(handle, "computing fingerprint");
        let engine = FingerprintEngine::new(Arc::clone(&source))
            .with_workers(options.hash_workers)
            .with_report_interval(options.report_interval);
        let on_hash = |p: HashProgress| {
            let message = format!(
                "computing fingerprint {}%",
                percent(p.processed_bytes, p.total_bytes)
            );
            registry.set_message(handle, &message);
        };
        let fingerprint = if options.full_fingerprint {
            engine.compute(&chunks, on_hash, cancel).await?
        } else {
            engine
                .quick_signature(options.chunk_size, on_hash, cancel)
                .await?
        };

        // Probe
        registry.set_message(handle, "checking server");
        let manifest = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            manifest = self.client.probe_upload(&fingerprint) => manifest?,
        };
        debug!(
            task = handle.id,
            completed = manifest.completed,
            resumed = manifest.uploaded_chunks.len(),
            "Resume manifest received"
        );
        if !manifest.completed {
            registry.start(handle);
        }

        // Transfer
        let identity = FileIdentity {
            file_name: file_name_of(&self.request)?,
            file_size,
            fingerprint,
            destination_path: self
                .request
                .destination
                .clone()
                .unwrap_or_else(|| options.default_destination.clone()),
        };
        let scheduler = TransferScheduler::new(Arc::clone(&self.client), source)
            .with_concurrency(options.transfer_concurrency)
            .with_report_interval(options.report_interval);

        scheduler
            .upload_chunks(
                &identity,
                &chunks,
                &manifest,
                |p| {
                    registry.update_progress(handle, p.processed_bytes, p.speed);
                },
                cancel,
            )
            .await
    }
}
