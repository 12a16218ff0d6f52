//! Chunked transfer scheduling
//!
//! Uploads the chunks the server does not have yet through a bounded pool,
//! folds per-chunk byte acknowledgements into file-level progress, and asks
//! the server to assemble the result.

use crate::chunk::{Chunk, ChunkSource};
use crate::client::{ByteProgress, ChunkUpload, MergeRequest, RemoteLocation, ResumeManifest, StorageClient};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::progress::{ProgressThrottle, DEFAULT_REPORT_INTERVAL};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Default number of concurrent chunk uploads
pub const DEFAULT_TRANSFER_CONCURRENCY: usize = 5;

/// What is being uploaded and where it goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    pub file_name: String,
    pub file_size: u64,
    pub fingerprint: Fingerprint,
    pub destination_path: String,
}

impl FileIdentity {
    fn default_location(&self) -> String {
        format!(
            "{}/{}",
            self.destination_path.trim_end_matches('/'),
            self.file_name
        )
    }
}

/// File-level transfer progress
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub processed_bytes: u64,
    pub total_bytes: u64,
    pub completed_chunks: usize,
    pub total_chunks: usize,
    /// Bytes per second since the previous report
    pub speed: f64,
}

/// Running byte totals across resumed, finished and in-flight chunks.
///
/// Each chunk contributes the largest acknowledgement seen for it, so
/// transport retries never move the total backwards.
struct Tally {
    sizes: HashMap<usize, u64>,
    acked: HashMap<usize, u64>,
    processed: u64,
    completed: usize,
}

impl Tally {
    fn new(chunks: &[Chunk], manifest: &ResumeManifest) -> Self {
        let mut tally = Tally {
            sizes: HashMap::new(),
            acked: HashMap::new(),
            processed: 0,
            completed: 0,
        };
        for chunk in chunks {
            if manifest.is_uploaded(chunk.index) {
                tally.processed += chunk.size;
                tally.completed += 1;
            } else {
                tally.sizes.insert(chunk.index, chunk.size);
            }
        }
        tally
    }

    fn ack(&mut self, index: usize, bytes: u64) {
        let Some(&size) = self.sizes.get(&index) else {
            return;
        };
        let acked = self.acked.entry(index).or_insert(0);
        let bytes = bytes.min(size);
        if bytes > *acked {
            self.processed += bytes - *acked;
            *acked = bytes;
        }
    }

    fn finish(&mut self, index: usize) {
        if let Some(size) = self.sizes.remove(&index) {
            let acked = self.acked.remove(&index).unwrap_or(0);
            self.processed += size - acked;
            self.completed += 1;
        }
    }
}

/// Bounded-concurrency chunk uploader for one file
pub struct TransferScheduler {
    client: Arc<dyn StorageClient>,
    source: Arc<dyn ChunkSource>,
    concurrency: usize,
    report_interval: Duration,
}

impl TransferScheduler {
    pub fn new(client: Arc<dyn StorageClient>, source: Arc<dyn ChunkSource>) -> Self {
        TransferScheduler {
            client,
            source,
            concurrency: DEFAULT_TRANSFER_CONCURRENCY,
            report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Upload every chunk missing from `manifest`, then merge.
    ///
    /// A manifest marked `completed` short-circuits: nothing is transferred
    /// and the existing object is returned as a deduplicated location.
    pub async fn upload_chunks<F>(
        &self,
        file: &FileIdentity,
        chunks: &[Chunk],
        manifest: &ResumeManifest,
        on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<RemoteLocation>
    where
        F: Fn(TransferProgress) + Sync,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if manifest.completed {
            let location = manifest
                .location
                .clone()
                .unwrap_or_else(|| file.default_location());
            info!(file = %file.file_name, location = %location, "Content already stored, skipping transfer");
            return Ok(RemoteLocation {
                location,
                deduplicated: true,
            });
        }

        validate_chunks(file, chunks)?;

        let total_chunks = chunks.len();
        let mut tally = Tally::new(chunks, manifest);
        let mut pending: VecDeque<Chunk> = chunks
            .iter()
            .filter(|c| !manifest.is_uploaded(c.index))
            .copied()
            .collect();
        let report = |tally: &Tally, speed: f64| {
            on_progress(TransferProgress {
                processed_bytes: tally.processed,
                total_bytes: file.file_size,
                completed_chunks: tally.completed,
                total_chunks,
                speed,
            })
        };

        debug!(
            file = %file.file_name,
            resumed = tally.completed,
            pending = pending.len(),
            "Starting chunk transfer"
        );

        let mut throttle = ProgressThrottle::new(self.report_interval).with_baseline(tally.processed);
        if tally.completed > 0 && !pending.is_empty() {
            report(&tally, 0.0);
        }

        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<(usize, u64)>();
        let mut transfers: JoinSet<(usize, Result<()>)> = JoinSet::new();

        loop {
            // FIFO admission into free slots
            while transfers.len() < self.concurrency {
                let Some(chunk) = pending.pop_front() else {
                    break;
                };
                let tx = ack_tx.clone();
                let progress: ByteProgress = Arc::new(move |bytes| {
                    let _ = tx.send((chunk.index, bytes));
                });
                let client = Arc::clone(&self.client);
                let source = Arc::clone(&self.source);
                let upload = ChunkTemplate {
                    file_name: file.file_name.clone(),
                    fingerprint: file.fingerprint.clone(),
                    total_chunks,
                    destination_path: file.destination_path.clone(),
                };
                transfers.spawn(async move {
                    let result = transfer_one(client, source, chunk, upload, progress).await;
                    (chunk.index, result)
                });
            }

            if transfers.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    transfers.abort_all();
                    debug!(file = %file.file_name, "Transfer cancelled");
                    return Err(Error::Cancelled);
                }
                Some((index, bytes)) = ack_rx.recv() => tally.ack(index, bytes),
                joined = transfers.join_next() => match joined {
                    Some(Ok((index, Ok(())))) => {
                        tally.finish(index);
                        debug!(chunk = index, completed = tally.completed, total = total_chunks, "Chunk uploaded");
                    }
                    Some(Ok((index, Err(e)))) => {
                        transfers.abort_all();
                        error!(chunk = index, error = %e, "Chunk transfer failed");
                        return Err(Error::PartialFailure {
                            index,
                            uploaded: tally.completed,
                            total: total_chunks,
                            reason: e.to_string(),
                        });
                    }
                    Some(Err(e)) => {
                        transfers.abort_all();
                        return Err(e.into());
                    }
                    None => {}
                },
            }

            if tally.processed < file.file_size {
                if let Some(speed) = throttle.poll(tally.processed, false) {
                    report(&tally, speed);
                }
            }
        }

        let speed = throttle.poll(tally.processed, true).unwrap_or(0.0);
        report(&tally, speed);

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.merge(file, total_chunks, cancel).await
    }

    /// Ask the server to assemble `chunk_count` stored chunks.
    ///
    /// Usable on its own when a previous merge failed after every chunk landed.
    pub async fn merge(
        &self,
        file: &FileIdentity,
        chunk_count: usize,
        cancel: &CancellationToken,
    ) -> Result<RemoteLocation> {
        let request = MergeRequest {
            file_name: file.file_name.clone(),
            fingerprint: file.fingerprint.clone(),
            total_size: file.file_size,
            chunk_count,
            destination_path: file.destination_path.clone(),
        };

        let merged = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            merged = self.client.merge_chunks(&request) => merged,
        };

        match merged {
            Ok(location) => {
                info!(file = %file.file_name, location = %location.location, chunks = chunk_count, "Merge complete");
                Ok(location)
            }
            Err(e) => {
                error!(file = %file.file_name, error = %e, "Merge failed");
                Err(Error::MergeFailure(e.to_string()))
            }
        }
    }
}

/// Per-file fields shared by every chunk upload
struct ChunkTemplate {
    file_name: String,
    fingerprint: Fingerprint,
    total_chunks: usize,
    destination_path: String,
}

async fn transfer_one(
    client: Arc<dyn StorageClient>,
    source: Arc<dyn ChunkSource>,
    chunk: Chunk,
    template: ChunkTemplate,
    progress: ByteProgress,
) -> Result<()> {
    let data = tokio::task::spawn_blocking(move || source.read_chunk(&chunk)).await??;
    client
        .upload_chunk(
            ChunkUpload {
                file_name: template.file_name,
                fingerprint: template.fingerprint,
                index: chunk.index,
                total_chunks: template.total_chunks,
                destination_path: template.destination_path,
                data,
            },
            progress,
        )
        .await
}

fn validate_chunks(file: &FileIdentity, chunks: &[Chunk]) -> Result<()> {
    if chunks.is_empty() {
        return Err(Error::InvalidArgument("no chunks to upload".to_string()));
    }
    let mut offset = 0u64;
    for (position, chunk) in chunks.iter().enumerate() {
        if chunk.index != position || chunk.offset != offset {
            return Err(Error::InvalidArgument(format!(
                "chunk {} is out of sequence",
                chunk.index
            )));
        }
        offset += chunk.size;
    }
    if offset != file.file_size {
        return Err(Error::InvalidArgument(format!(
            "chunks cover {} bytes but file has {}",
            offset, file.file_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::split;
    use crate::client::MemoryStorage;
    use bytes::Bytes;
    use parking_lot::Mutex;

    fn sample_data(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 253) as u8).collect::<Vec<u8>>())
    }

    fn identity(data: &Bytes) -> FileIdentity {
        FileIdentity {
            file_name: "movie.mkv".to_string(),
            file_size: data.len() as u64,
            fingerprint: Fingerprint::parse(&blake3::hash(data).to_hex()).unwrap(),
            destination_path: "my-files".to_string(),
        }
    }

    fn scheduler(storage: &Arc<MemoryStorage>, data: &Bytes) -> TransferScheduler {
        TransferScheduler::new(storage.clone(), Arc::new(data.clone()))
            .with_report_interval(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_resume_uploads_only_missing_chunks() {
        let data = sample_data(23_000_000);
        let file = identity(&data);
        let chunks = split(file.file_size, 5_000_000).unwrap();
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[4].size, 3_000_000);

        let storage = Arc::new(MemoryStorage::new());
        for chunk in &chunks[..2] {
            storage.insert_partial(
                file.fingerprint.clone(),
                chunk.index,
                data.slice(chunk.offset as usize..chunk.end() as usize),
            );
        }
        let manifest = storage.probe_upload(&file.fingerprint).await.unwrap();

        let location = scheduler(&storage, &data)
            .upload_chunks(&file, &chunks, &manifest, |_| {}, &CancellationToken::new())
            .await
            .unwrap();

        let mut uploaded = storage.upload_calls();
        uploaded.sort_unstable();
        assert_eq!(uploaded, vec![2, 3, 4]);

        let merges = storage.merge_calls();
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].chunk_count, 5);
        assert_eq!(merges[0].total_size, 23_000_000);
        assert_eq!(location.location, "my-files/movie.mkv");
        assert!(!location.deduplicated);
        assert_eq!(storage.object(&file.fingerprint).unwrap(), data);
    }

    #[tokio::test]
    async fn test_completed_manifest_short_circuits() {
        let data = sample_data(10_000);
        let file = identity(&data);
        let chunks = split(file.file_size, 1024).unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let manifest = ResumeManifest {
            completed: true,
            uploaded_chunks: Default::default(),
            location: Some("my-files/existing.mkv".to_string()),
        };
        let reports = Mutex::new(0usize);

        let location = scheduler(&storage, &data)
            .upload_chunks(&file, &chunks, &manifest, |_| *reports.lock() += 1, &CancellationToken::new())
            .await
            .unwrap();

        assert!(location.deduplicated);
        assert_eq!(location.location, "my-files/existing.mkv");
        assert!(storage.upload_calls().is_empty());
        assert!(storage.merge_calls().is_empty());
        assert_eq!(*reports.lock(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let data = sample_data(20 * 512);
        let file = identity(&data);
        let chunks = split(file.file_size, 512).unwrap();
        let storage = Arc::new(MemoryStorage::new());
        storage.set_upload_delay(Duration::from_millis(10));

        scheduler(&storage, &data)
            .with_concurrency(3)
            .upload_chunks(&file, &chunks, &ResumeManifest::default(), |_| {}, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(storage.upload_calls().len(), 20);
        assert!(storage.max_in_flight() <= 3);
        assert!(storage.max_in_flight() >= 2);
    }

    #[tokio::test]
    async fn test_admission_is_fifo() {
        let data = sample_data(8 * 100);
        let file = identity(&data);
        let chunks = split(file.file_size, 100).unwrap();
        let storage = Arc::new(MemoryStorage::new());

        scheduler(&storage, &data)
            .with_concurrency(1)
            .upload_chunks(&file, &chunks, &ResumeManifest::default(), |_| {}, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(storage.upload_calls(), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_complete() {
        let data = sample_data(50_000);
        let file = identity(&data);
        let chunks = split(file.file_size, 4096).unwrap();
        let storage = Arc::new(MemoryStorage::new());
        storage.set_upload_delay(Duration::from_millis(1));
        storage.insert_partial(file.fingerprint.clone(), 0, data.slice(0..4096));
        let manifest = storage.probe_upload(&file.fingerprint).await.unwrap();
        let reports = Mutex::new(Vec::new());

        scheduler(&storage, &data)
            .upload_chunks(&file, &chunks, &manifest, |p| reports.lock().push(p), &CancellationToken::new())
            .await
            .unwrap();

        let reports = reports.into_inner();
        assert_eq!(reports[0].processed_bytes, 4096);
        assert_eq!(reports[0].completed_chunks, 1);
        assert!(reports
            .windows(2)
            .all(|w| w[0].processed_bytes <= w[1].processed_bytes));
        let last = reports.last().unwrap();
        assert_eq!(last.processed_bytes, 50_000);
        assert_eq!(last.completed_chunks, chunks.len());
        assert_eq!(last.total_chunks, chunks.len());
    }

    #[tokio::test]
    async fn test_chunk_failure_is_partial_failure() {
        let data = sample_data(5000);
        let file = identity(&data);
        let chunks = split(file.file_size, 1000).unwrap();
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_chunk(2, u32::MAX);

        let err = scheduler(&storage, &data)
            .with_concurrency(1)
            .upload_chunks(&file, &chunks, &ResumeManifest::default(), |_| {}, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            Error::PartialFailure { index, uploaded, total, .. } => {
                assert_eq!(index, 2);
                assert_eq!(uploaded, 2);
                assert_eq!(total, 5);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(storage.merge_calls().is_empty());
        assert_eq!(storage.stored_chunks(&file.fingerprint), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_cancel_stops_transfer_without_merge() {
        let data = sample_data(10 * 100);
        let file = identity(&data);
        let chunks = split(file.file_size, 100).unwrap();
        let storage = Arc::new(MemoryStorage::new());
        storage.set_upload_delay(Duration::from_millis(200));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = scheduler(&storage, &data)
            .with_concurrency(2)
            .upload_chunks(&file, &chunks, &ResumeManifest::default(), |_| {}, &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(storage.merge_calls().is_empty());
        assert!(storage.upload_calls().len() <= 2);
    }

    #[tokio::test]
    async fn test_merge_failure_then_merge_only_retry() {
        let data = sample_data(3000);
        let file = identity(&data);
        let chunks = split(file.file_size, 1000).unwrap();
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_merge(Some("disk full"));
        let scheduler = scheduler(&storage, &data);
        let cancel = CancellationToken::new();

        let err = scheduler
            .upload_chunks(&file, &chunks, &ResumeManifest::default(), |_| {}, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MergeFailure(_)));

        storage.fail_merge(None);
        let location = scheduler.merge(&file, chunks.len(), &cancel).await.unwrap();
        assert_eq!(location.location, "my-files/movie.mkv");
        assert_eq!(storage.upload_calls().len(), 3);
        assert_eq!(storage.merge_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_all_chunks_resumed_goes_straight_to_merge() {
        let data = sample_data(2000);
        let file = identity(&data);
        let chunks = split(file.file_size, 1000).unwrap();
        let storage = Arc::new(MemoryStorage::new());
        for chunk in &chunks {
            storage.insert_partial(
                file.fingerprint.clone(),
                chunk.index,
                data.slice(chunk.offset as usize..chunk.end() as usize),
            );
        }
        let manifest = storage.probe_upload(&file.fingerprint).await.unwrap();
        let reports = Mutex::new(Vec::new());

        scheduler(&storage, &data)
            .upload_chunks(&file, &chunks, &manifest, |p| reports.lock().push(p), &CancellationToken::new())
            .await
            .unwrap();

        assert!(storage.upload_calls().is_empty());
        assert_eq!(storage.merge_calls().len(), 1);
        let reports = reports.into_inner();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].processed_bytes, 2000);
    }

    #[tokio::test]
    async fn test_rejects_mismatched_sizes() {
        let data = sample_data(1000);
        let mut file = identity(&data);
        file.file_size = 999;
        let chunks = split(1000, 100).unwrap();
        let storage = Arc::new(MemoryStorage::new());

        let err = scheduler(&storage, &data)
            .upload_chunks(&file, &chunks, &ResumeManifest::default(), |_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(storage.upload_calls().is_empty());
    }
}
