//! cloudlift - Resumable, deduplicating chunked file uploads
//!
//! Files are split into fixed-size chunks, fingerprinted by a pool of
//! parallel hash workers, checked against the server for content it already
//! holds, and transferred under a bounded concurrency budget before the
//! server is asked to assemble them.

pub mod chunk;
pub mod client;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod manager;
pub mod progress;
pub mod registry;
pub mod transfer;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::client::{HttpStorageClient, StorageClient};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::fingerprint::{Fingerprint, FingerprintEngine};
    pub use crate::manager::{UploadManager, UploadOptions, UploadRequest};
    pub use crate::registry::{TaskEvent, TaskStatus, UploadRegistry, UploadTask};
}
