//! Content fingerprinting
//!
//! Chunks are read by a pool of blocking workers that may finish in any
//! order. Results pass through a [`ReorderBuffer`] so the single BLAKE3
//! accumulator is always fed bytes in file order. The fingerprint therefore
//! depends only on the content, never on chunk size or worker count.

mod reorder;

pub use reorder::ReorderBuffer;

use crate::chunk::{quick_signature_chunks, Chunk, ChunkSource};
use crate::error::{Error, Result};
use crate::progress::{ProgressThrottle, DEFAULT_REPORT_INTERVAL};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on hash workers
pub const MAX_HASH_WORKERS: usize = 12;

/// Hash workers sized to the machine, capped at [`MAX_HASH_WORKERS`]
pub fn default_hash_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(MAX_HASH_WORKERS)
}

/// Hex-encoded BLAKE3 digest used as a content-addressing key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    fn from_hash(hash: blake3::Hash) -> Self {
        Fingerprint(hash.to_hex().to_string())
    }

    /// Parse a fingerprint from its hex form
    pub fn parse(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| Error::InvalidArgument(format!("invalid fingerprint: {}", e)))?;
        if bytes.len() != blake3::OUT_LEN {
            return Err(Error::InvalidArgument(format!(
                "fingerprint must be {} bytes, got {}",
                blake3::OUT_LEN,
                bytes.len()
            )));
        }
        Ok(Fingerprint(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Progress snapshot emitted while hashing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HashProgress {
    pub processed_bytes: u64,
    pub processed_chunks: usize,
    pub total_bytes: u64,
    pub total_chunks: usize,
    /// Bytes per second since the previous report
    pub speed: f64,
}

/// Parallel, order-preserving fingerprint computation over a chunk source
pub struct FingerprintEngine {
    source: Arc<dyn ChunkSource>,
    workers: usize,
    report_interval: Duration,
}

impl FingerprintEngine {
    pub fn new(source: Arc<dyn ChunkSource>) -> Self {
        FingerprintEngine {
            source,
            workers: default_hash_workers(),
            report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Fingerprint of the first and last `chunk_size` bytes only.
    ///
    /// Used as a cheap existence probe before hashing the whole file.
    pub async fn quick_signature<F>(
        &self,
        chunk_size: u64,
        on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<Fingerprint>
    where
        F: Fn(HashProgress) + Sync,
    {
        let jobs = quick_signature_chunks(self.source.len(), chunk_size)?;
        self.compute(&jobs, on_progress, cancel).await
    }

    /// Fingerprint the given chunks.
    ///
    /// `chunks` must be indexed `0..n` with no gaps. Any worker failure aborts
    /// the whole computation; no partial digest is ever returned.
    pub async fn compute<F>(
        &self,
        chunks: &[Chunk],
        on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<Fingerprint>
    where
        F: Fn(HashProgress) + Sync,
    {
        validate_jobs(chunks)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let total_chunks = chunks.len();
        let total_bytes: u64 = chunks.iter().map(|c| c.size).sum();
        let pool = self.workers.clamp(1, total_chunks);
        let window = pool * 2;

        debug!(
            chunks = total_chunks,
            bytes = total_bytes,
            workers = pool,
            "Starting fingerprint"
        );

        let mut workers: JoinSet<(usize, Result<Bytes>)> = JoinSet::new();
        let mut reorder: ReorderBuffer<Bytes> = ReorderBuffer::new();
        let mut hasher = blake3::Hasher::new();
        let mut throttle = ProgressThrottle::new(self.report_interval);
        let mut next_job = 0usize;
        let mut processed_bytes = 0u64;

        while reorder.next_expected() < total_chunks {
            // Admit pending jobs while a worker is idle and the window has room
            while next_job < total_chunks
                && workers.len() < pool
                && workers.len() + reorder.held() < window
            {
                let chunk = chunks[next_job];
                let source = Arc::clone(&self.source);
                workers.spawn_blocking(move || (chunk.index, read_job(source.as_ref(), &chunk)));
                next_job += 1;
            }

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    workers.abort_all();
                    reorder.clear();
                    debug!("Fingerprint cancelled");
                    return Err(Error::Cancelled);
                }
                joined = workers.join_next() => joined,
            };

            let (index, bytes) = match joined {
                Some(Ok((index, Ok(bytes)))) => (index, bytes),
                Some(Ok((index, Err(e)))) => {
                    workers.abort_all();
                    reorder.clear();
                    warn!(chunk = index, error = %e, "Hash worker failed");
                    return Err(Error::WorkerFailure {
                        index,
                        reason: e.to_string(),
                    });
                }
                Some(Err(e)) => {
                    workers.abort_all();
                    reorder.clear();
                    return Err(e.into());
                }
                None => {
                    return Err(Error::Internal(format!(
                        "hash pool drained at chunk {} of {}",
                        reorder.next_expected(),
                        total_chunks
                    )));
                }
            };
            reorder.insert(index, bytes);

            let mut ready = Vec::new();
            while let Some(bytes) = reorder.pop_ready() {
                ready.push(bytes);
            }
            if ready.is_empty() {
                continue;
            }

            // Fold off the async thread; buffers are released right after
            let (advanced, folded) = tokio::task::spawn_blocking(move || {
                let mut folded = 0u64;
                for buf in &ready {
                    hasher.update(buf);
                    folded += buf.len() as u64;
                }
                (hasher, folded)
            })
            .await?;
            hasher = advanced;
            processed_bytes += folded;

            if cancel.is_cancelled() {
                workers.abort_all();
                reorder.clear();
                return Err(Error::Cancelled);
            }

            let finished = reorder.next_expected() == total_chunks;
            if let Some(speed) = throttle.poll(processed_bytes, finished) {
                on_progress(HashProgress {
                    processed_bytes,
                    processed_chunks: reorder.next_expected(),
                    total_bytes,
                    total_chunks,
                    speed,
                });
            }
        }

        let fingerprint = Fingerprint::from_hash(hasher.finalize());
        info!(fingerprint = %fingerprint, bytes = total_bytes, "Fingerprint computed");
        Ok(fingerprint)
    }
}

fn validate_jobs(chunks: &[Chunk]) -> Result<()> {
    if chunks.is_empty() {
        return Err(Error::InvalidArgument(
            "nothing to fingerprint".to_string(),
        ));
    }
    for (position, chunk) in chunks.iter().enumerate() {
        if chunk.index != position {
            return Err(Error::InvalidArgument(format!(
                "chunk at position {} has index {}",
                position, chunk.index
            )));
        }
    }
    Ok(())
}

/// Read one chunk and verify its length
fn read_job(source: &dyn ChunkSource, chunk: &Chunk) -> Result<Bytes> {
    let read = catch_unwind(AssertUnwindSafe(|| source.read_chunk(chunk)))
        .map_err(|_| Error::Internal("chunk reader panicked".to_string()))?;
    let bytes = read?;
    if bytes.len() as u64 != chunk.size {
        return Err(Error::Internal(format!(
            "expected {} bytes, read {}",
            chunk.size,
            bytes.len()
        )));
    }
    Ok(bytes)
}
