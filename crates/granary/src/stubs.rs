//! Client stubs for other workers.
//!
//! The RPC transport lives outside this crate; shards and workers talk to a
//! worker through the [`WorkerStub`] contract, and the registry caches one
//! stub per worker name until it is invalidated (malfunctioning workers are
//! dropped together with their backplane registration).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use granary_api::{Digest, Status};

#[async_trait::async_trait]
pub trait WorkerStub: Send + Sync {
    /// Subset of `digests` the worker does not hold.
    async fn find_missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>, Status>;

    /// Read a blob range; a zero limit reads to the end.
    async fn get_blob(&self, digest: &Digest, offset: i64, limit: i64) -> Result<Bytes, Status>;

    async fn put_blob(&self, digest: &Digest, blob: Bytes) -> Result<(), Status>;
}

/// Creates a stub for a worker name. Production installs the transport
/// factory here; tests install in-process fakes.
pub trait WorkerStubFactory: Send + Sync {
    fn create(&self, worker_name: &str) -> Arc<dyn WorkerStub>;
}

impl<F> WorkerStubFactory for F
where
    F: Fn(&str) -> Arc<dyn WorkerStub> + Send + Sync,
{
    fn create(&self, worker_name: &str) -> Arc<dyn WorkerStub> {
        self(worker_name)
    }
}

pub struct WorkerStubs {
    factory: Box<dyn WorkerStubFactory>,
    stubs: Mutex<HashMap<String, Arc<dyn WorkerStub>>>,
}

impl WorkerStubs {
    pub fn new(factory: Box<dyn WorkerStubFactory>) -> Arc<WorkerStubs> {
        Arc::new(WorkerStubs {
            factory,
            stubs: Mutex::new(HashMap::new()),
        })
    }

    pub fn get(&self, worker_name: &str) -> Arc<dyn WorkerStub> {
        self.stubs
            .lock()
            .expect("stubs poisoned")
            .entry(worker_name.to_string())
            .or_insert_with(|| self.factory.create(worker_name))
            .clone()
    }

    pub fn invalidate(&self, worker_name: &str) {
        self.stubs
            .lock()
            .expect("stubs poisoned")
            .remove(worker_name);
    }

    pub fn invalidate_all(&self) {
        self.stubs.lock().expect("stubs poisoned").clear();
    }
}

/// A stub serving a worker's CAS cache in-process. Used for the worker's
/// own name and wherever the deployment co-locates roles; tests use it as
/// the standard worker fake.
pub struct LocalWorkerStub {
    cache: Arc<granary_cas::CasFileCache>,
}

impl LocalWorkerStub {
    pub fn new(cache: Arc<granary_cas::CasFileCache>) -> Arc<LocalWorkerStub> {
        Arc::new(LocalWorkerStub { cache })
    }
}

#[async_trait::async_trait]
impl WorkerStub for LocalWorkerStub {
    async fn find_missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>, Status> {
        Ok(self.cache.find_missing_blobs(digests).await)
    }

    async fn get_blob(&self, digest: &Digest, offset: i64, limit: i64) -> Result<Bytes, Status> {
        let (offset, length) =
            granary_api::bytestream::check_read_range(offset, limit, digest.size_bytes)?;
        let blob = self.cache.get_blob(digest).await.map_err(Status::from)?;
        Ok(blob.slice(offset as usize..(offset + length) as usize))
    }

    async fn put_blob(&self, digest: &Digest, blob: Bytes) -> Result<(), Status> {
        self.cache
            .put_blob(digest, blob)
            .await
            .map_err(Status::from)
    }
}

/// Factory for deployments whose transport adapter has not been wired in:
/// every remote call reports the worker unreachable.
pub struct UnconnectedStubFactory;

impl WorkerStubFactory for UnconnectedStubFactory {
    fn create(&self, _worker_name: &str) -> Arc<dyn WorkerStub> {
        Arc::new(UnconnectedStub)
    }
}

struct UnconnectedStub;

#[async_trait::async_trait]
impl WorkerStub for UnconnectedStub {
    async fn find_missing_blobs(&self, _digests: &[Digest]) -> Result<Vec<Digest>, Status> {
        Err(Status::unavailable("worker transport not configured"))
    }

    async fn get_blob(&self, _digest: &Digest, _offset: i64, _limit: i64) -> Result<Bytes, Status> {
        Err(Status::unavailable("worker transport not configured"))
    }

    async fn put_blob(&self, _digest: &Digest, _blob: Bytes) -> Result<(), Status> {
        Err(Status::unavailable("worker transport not configured"))
    }
}
