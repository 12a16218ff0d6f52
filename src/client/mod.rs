//! Remote storage service interface
//!
//! The transfer pipeline only talks to storage through [`StorageClient`].
//! [`http::HttpStorageClient`] speaks the upload server's HTTP API and
//! [`memory::MemoryStorage`] keeps everything in process.

mod backoff;
pub mod http;
pub mod memory;

pub use backoff::ExponentialBackoff;
pub use http::HttpStorageClient;
pub use memory::MemoryStorage;

use crate::error::Result;
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Server-side state for a fingerprint, valid for one upload attempt only
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeManifest {
    /// The server already holds the complete object
    pub completed: bool,
    /// Chunk indices stored by an earlier attempt
    pub uploaded_chunks: BTreeSet<usize>,
    /// Location of the existing object when `completed`
    pub location: Option<String>,
}

impl ResumeManifest {
    pub fn is_uploaded(&self, index: usize) -> bool {
        self.uploaded_chunks.contains(&index)
    }
}

/// One chunk upload request
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub file_name: String,
    pub fingerprint: Fingerprint,
    pub index: usize,
    pub total_chunks: usize,
    pub destination_path: String,
    pub data: Bytes,
}

/// Request to assemble uploaded chunks into the final object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    pub file_name: String,
    pub fingerprint: Fingerprint,
    pub total_size: u64,
    pub chunk_count: usize,
    pub destination_path: String,
}

/// Where a finished upload lives on the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLocation {
    pub location: String,
    /// Content was already stored; nothing was transferred
    pub deduplicated: bool,
}

/// Callback receiving the cumulative bytes of one chunk accepted by the transport
pub type ByteProgress = Arc<dyn Fn(u64) + Send + Sync>;

/// Remote storage operations used by the upload pipeline
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Ask which parts of `fingerprint` the server already holds
    async fn probe_upload(&self, fingerprint: &Fingerprint) -> Result<ResumeManifest>;

    /// Store one chunk. Retries are the client's responsibility.
    async fn upload_chunk(&self, upload: ChunkUpload, progress: ByteProgress) -> Result<()>;

    /// Assemble all chunks of a file
    async fn merge_chunks(&self, request: &MergeRequest) -> Result<RemoteLocation>;
}
