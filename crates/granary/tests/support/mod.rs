//! Shared fixtures for the integration tests: an in-memory worker fake with
//! scriptable failure modes, wired through the stub registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use granary::stubs::{WorkerStub, WorkerStubFactory, WorkerStubs};
use granary_api::{bytestream, Code, Digest, DigestUtil, Status};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerMode {
    Healthy,
    Unavailable,
}

/// An in-process worker CAS double.
pub struct TestWorker {
    pub name: String,
    blobs: Mutex<HashMap<Digest, Bytes>>,
    mode: Mutex<WorkerMode>,
    pub find_missing_calls: AtomicU32,
    pub get_blob_calls: AtomicU32,
}

impl TestWorker {
    pub fn new(name: &str) -> Arc<TestWorker> {
        Arc::new(TestWorker {
            name: name.to_string(),
            blobs: Mutex::new(HashMap::new()),
            mode: Mutex::new(WorkerMode::Healthy),
            find_missing_calls: AtomicU32::new(0),
            get_blob_calls: AtomicU32::new(0),
        })
    }

    pub fn insert(&self, blob: impl Into<Bytes>) -> Digest {
        let blob = blob.into();
        let digest = DigestUtil.compute(&blob);
        self.blobs
            .lock()
            .expect("blobs poisoned")
            .insert(digest.clone(), blob);
        digest
    }

    pub fn holds(&self, digest: &Digest) -> bool {
        self.blobs.lock().expect("blobs poisoned").contains_key(digest)
    }

    pub fn set_mode(&self, mode: WorkerMode) {
        *self.mode.lock().expect("mode poisoned") = mode;
    }

    fn check_mode(&self) -> Result<(), Status> {
        match *self.mode.lock().expect("mode poisoned") {
            WorkerMode::Healthy => Ok(()),
            WorkerMode::Unavailable => Err(Status::unavailable(format!(
                "worker {} unreachable",
                self.name
            ))),
        }
    }
}

#[async_trait::async_trait]
impl WorkerStub for TestWorker {
    async fn find_missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>, Status> {
        self.find_missing_calls.fetch_add(1, Ordering::SeqCst);
        self.check_mode()?;
        let blobs = self.blobs.lock().expect("blobs poisoned");
        Ok(digests
            .iter()
            .filter(|digest| !blobs.contains_key(*digest))
            .cloned()
            .collect())
    }

    async fn get_blob(&self, digest: &Digest, offset: i64, limit: i64) -> Result<Bytes, Status> {
        self.get_blob_calls.fetch_add(1, Ordering::SeqCst);
        self.check_mode()?;
        let blob = self
            .blobs
            .lock()
            .expect("blobs poisoned")
            .get(digest)
            .cloned()
            .ok_or_else(|| Status::new(Code::NotFound, format!("blobs/{digest}")))?;
        let (offset, length) = bytestream::check_read_range(offset, limit, blob.len() as i64)?;
        Ok(blob.slice(offset as usize..(offset + length) as usize))
    }

    async fn put_blob(&self, digest: &Digest, blob: Bytes) -> Result<(), Status> {
        self.check_mode()?;
        self.blobs
            .lock()
            .expect("blobs poisoned")
            .insert(digest.clone(), blob);
        Ok(())
    }
}

/// Registry of test workers addressable by name.
#[derive(Clone, Default)]
pub struct TestWorkerFleet {
    workers: Arc<Mutex<HashMap<String, Arc<TestWorker>>>>,
}

impl TestWorkerFleet {
    pub fn new() -> TestWorkerFleet {
        TestWorkerFleet::default()
    }

    pub fn add(&self, name: &str) -> Arc<TestWorker> {
        let worker = TestWorker::new(name);
        self.workers
            .lock()
            .expect("fleet poisoned")
            .insert(name.to_string(), worker.clone());
        worker
    }

    pub fn stubs(&self) -> Arc<WorkerStubs> {
        let fleet = self.clone();
        WorkerStubs::new(Box::new(fleet))
    }
}

impl WorkerStubFactory for TestWorkerFleet {
    fn create(&self, worker_name: &str) -> Arc<dyn WorkerStub> {
        let worker = self
            .workers
            .lock()
            .expect("fleet poisoned")
            .get(worker_name)
            .cloned();
        match worker {
            Some(worker) => worker,
            // Unknown names behave like dead hosts.
            None => {
                let worker = TestWorker::new(worker_name);
                worker.set_mode(WorkerMode::Unavailable);
                worker
            }
        }
    }
}

/// A watcher that records every observation.
pub struct RecordingWatcher {
    observed: Mutex<Vec<Option<granary_api::Operation>>>,
}

impl RecordingWatcher {
    pub fn new() -> Arc<RecordingWatcher> {
        Arc::new(RecordingWatcher {
            observed: Mutex::new(Vec::new()),
        })
    }

    pub fn observed(&self) -> Vec<Option<granary_api::Operation>> {
        self.observed.lock().expect("observed poisoned").clone()
    }

    pub fn stages(&self) -> Vec<granary_api::ExecutionStage> {
        self.observed()
            .into_iter()
            .flatten()
            .map(|operation| operation.stage())
            .collect()
    }

    pub fn terminal(&self) -> Option<granary_api::Operation> {
        self.observed()
            .into_iter()
            .flatten()
            .find(|operation| operation.done)
    }
}

impl granary::Watcher for RecordingWatcher {
    fn observe(&self, operation: Option<granary_api::Operation>) {
        self.observed
            .lock()
            .expect("observed poisoned")
            .push(operation);
    }
}
