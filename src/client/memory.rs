//! In-process storage backend
//!
//! Keeps chunks and assembled objects in memory. Failures and latency can be
//! injected, and every call is recorded so pipelines can be inspected.

use super::{ByteProgress, ChunkUpload, MergeRequest, RemoteLocation, ResumeManifest, StorageClient};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredObject {
    location: String,
    data: Bytes,
}

#[derive(Default)]
struct State {
    objects: HashMap<Fingerprint, StoredObject>,
    partial: HashMap<Fingerprint, BTreeMap<usize, Bytes>>,
    /// Remaining injected failures per chunk index
    chunk_failures: HashMap<usize, u32>,
    merge_failure: Option<String>,
    upload_delay: Duration,
    probe_calls: usize,
    upload_calls: Vec<usize>,
    merge_calls: Vec<MergeRequest>,
}

/// Storage backend that lives entirely in memory
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight counter when an upload ends or is aborted
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a fully stored object
    pub fn insert_object(&self, fingerprint: Fingerprint, location: &str, data: Bytes) {
        self.state.lock().objects.insert(
            fingerprint,
            StoredObject {
                location: location.to_string(),
                data,
            },
        );
    }

    /// Seed a chunk left behind by an earlier attempt
    pub fn insert_partial(&self, fingerprint: Fingerprint, index: usize, data: Bytes) {
        self.state
            .lock()
            .partial
            .entry(fingerprint)
            .or_default()
            .insert(index, data);
    }

    /// Fail the next `times` uploads of chunk `index`
    pub fn fail_chunk(&self, index: usize, times: u32) {
        self.state.lock().chunk_failures.insert(index, times);
    }

    /// Fail every merge with `reason` until cleared with `None`
    pub fn fail_merge(&self, reason: Option<&str>) {
        self.state.lock().merge_failure = reason.map(str::to_string);
    }

    pub fn set_upload_delay(&self, delay: Duration) {
        self.state.lock().upload_delay = delay;
    }

    pub fn probe_calls(&self) -> usize {
        self.state.lock().probe_calls
    }

    /// Chunk indices in the order their uploads started
    pub fn upload_calls(&self) -> Vec<usize> {
        self.state.lock().upload_calls.clone()
    }

    pub fn merge_calls(&self) -> Vec<MergeRequest> {
        self.state.lock().merge_calls.clone()
    }

    /// Peak number of concurrent chunk uploads
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Indices stored for a fingerprint that has not been merged yet
    pub fn stored_chunks(&self, fingerprint: &Fingerprint) -> Vec<usize> {
        self.state
            .lock()
            .partial
            .get(fingerprint)
            .map(|chunks| chunks.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Bytes of an assembled object
    pub fn object(&self, fingerprint: &Fingerprint) -> Option<Bytes> {
        self.state
            .lock()
            .objects
            .get(fingerprint)
            .map(|o| o.data.clone())
    }
}

#[async_trait]
impl StorageClient for MemoryStorage {
    async fn probe_upload(&self, fingerprint: &Fingerprint) -> Result<ResumeManifest> {
        let mut state = self.state.lock();
        state.probe_calls += 1;

        if let Some(object) = state.objects.get(fingerprint) {
            return Ok(ResumeManifest {
                completed: true,
                uploaded_chunks: Default::default(),
                location: Some(object.location.clone()),
            });
        }

        Ok(ResumeManifest {
            completed: false,
            uploaded_chunks: state
                .partial
                .get(fingerprint)
                .map(|chunks| chunks.keys().copied().collect())
                .unwrap_or_default(),
            location: None,
        })
    }

    async fn upload_chunk(&self, upload: ChunkUpload, progress: ByteProgress) -> Result<()> {
        let delay = {
            let mut state = self.state.lock();
            state.upload_calls.push(upload.index);
            state.upload_delay
        };

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let len = upload.data.len() as u64;
        progress(len / 2);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        {
            let mut state = self.state.lock();
            if let Some(remaining) = state.chunk_failures.get_mut(&upload.index) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::TransferFailure {
                        index: upload.index,
                        reason: "injected failure".to_string(),
                    });
                }
            }
            state
                .partial
                .entry(upload.fingerprint.clone())
                .or_default()
                .insert(upload.index, upload.data);
        }

        progress(len);
        debug!(chunk = upload.index, bytes = len, "Stored chunk in memory");
        Ok(())
    }

    async fn merge_chunks(&self, request: &MergeRequest) -> Result<RemoteLocation> {
        let mut state = self.state.lock();
        state.merge_calls.push(request.clone());

        if let Some(reason) = &state.merge_failure {
            return Err(Error::Remote {
                code: 500,
                message: reason.clone(),
            });
        }

        let chunks = state
            .partial
            .get(&request.fingerprint)
            .cloned()
            .unwrap_or_default();
        if let Some(missing) = (0..request.chunk_count).find(|i| !chunks.contains_key(i)) {
            return Err(Error::Remote {
                code: 400,
                message: format!("chunk {} missing", missing),
            });
        }

        let mut data = BytesMut::with_capacity(request.total_size as usize);
        for index in 0..request.chunk_count {
            if let Some(chunk) = chunks.get(&index) {
                data.extend_from_slice(chunk);
            }
        }
        if data.len() as u64 != request.total_size {
            return Err(Error::Remote {
                code: 400,
                message: format!(
                    "assembled {} bytes, expected {}",
                    data.len(),
                    request.total_size
                ),
            });
        }

        let location = format!(
            "{}/{}",
            request.destination_path.trim_end_matches('/'),
            request.file_name
        );
        state.partial.remove(&request.fingerprint);
        state.objects.insert(
            request.fingerprint.clone(),
            StoredObject {
                location: location.clone(),
                data: data.freeze(),
            },
        );

        Ok(RemoteLocation {
            location,
            deduplicated: false,
        })
    }
}
