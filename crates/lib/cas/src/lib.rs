//! Local content-addressed storage for workers.
//!
//! [`CasFileCache`] keeps blobs on disk under a flat root with
//! reference-counted LRU eviction; [`ExecFileSystem`] stages per-operation
//! exec directories by hard-linking out of the cache.

mod exec;
mod file_cache;
mod output_directory;

pub use exec::ExecFileSystem;
pub use file_cache::{BlobSource, CacheEvent, CasFileCache, CasFileCacheConfig};
pub use output_directory::OutputDirectory;

use granary_api::{Code, Digest, Status};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("blob not found: {0}")]
    NotFound(Digest),

    #[error("blob size mismatch, expected {expected}, was {actual}")]
    SizeMismatch { expected: i64, actual: i64 },

    #[error("{0}")]
    InvalidEntry(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("fetch failed: {0}")]
    Fetch(Status),
}

impl CacheError {
    pub fn code(&self) -> Code {
        match self {
            CacheError::NotFound(_) => Code::NotFound,
            CacheError::SizeMismatch { .. } => Code::InvalidArgument,
            CacheError::InvalidEntry(_) => Code::InvalidArgument,
            CacheError::Io(err) if err.kind() == std::io::ErrorKind::NotFound => Code::NotFound,
            CacheError::Io(_) => Code::Internal,
            CacheError::Fetch(status) => status.code,
        }
    }
}

impl From<CacheError> for Status {
    fn from(err: CacheError) -> Status {
        match err {
            CacheError::Fetch(status) => status,
            other => Status::new(other.code(), other.to_string()),
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Test helpers shared with the integration crates.
pub mod testing {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use futures::stream::{self, BoxStream};
    use granary_api::{Digest, DigestUtil, Status};

    use super::file_cache::BlobSource;

    /// Blob source over an in-memory map.
    #[derive(Clone, Default)]
    pub struct MapBlobSource {
        blobs: Arc<Mutex<HashMap<Digest, Bytes>>>,
    }

    impl MapBlobSource {
        pub fn new() -> MapBlobSource {
            MapBlobSource::default()
        }

        pub fn insert(&self, blob: impl Into<Bytes>) -> Digest {
            let blob = blob.into();
            let digest = DigestUtil.compute(&blob);
            self.insert_with_digest(digest.clone(), blob);
            digest
        }

        /// Register contents under an arbitrary digest (corruption tests).
        pub fn insert_with_digest(&self, digest: Digest, blob: impl Into<Bytes>) {
            self.blobs
                .lock()
                .expect("blobs poisoned")
                .insert(digest, blob.into());
        }

        pub fn remove(&self, digest: &Digest) {
            self.blobs.lock().expect("blobs poisoned").remove(digest);
        }
    }

    #[async_trait::async_trait]
    impl BlobSource for MapBlobSource {
        async fn open(
            &self,
            digest: &Digest,
            offset: i64,
        ) -> Result<BoxStream<'static, std::io::Result<Bytes>>, Status> {
            let blob = self
                .blobs
                .lock()
                .expect("blobs poisoned")
                .get(digest)
                .cloned()
                .ok_or_else(|| Status::not_found(format!("blobs/{digest}")))?;
            let chunk = blob.slice((offset as usize).min(blob.len())..);
            Ok(Box::pin(stream::iter([Ok(chunk)])))
        }
    }
}
