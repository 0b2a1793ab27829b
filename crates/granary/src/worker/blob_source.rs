//! Remote fill for the local CAS cache.
//!
//! A cache miss is served from the other workers recorded in the
//! blob-location index; workers that turn out not to hold the blob are
//! skipped, unreachable ones are ignored (the frontend removes them).

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, BoxStream};
use granary_api::{Code, Digest, Status};
use granary_backplane::Backplane;
use granary_cas::BlobSource;
use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::stubs::WorkerStubs;

pub struct RemoteBlobSource {
    backplane: Arc<dyn Backplane>,
    stubs: Arc<WorkerStubs>,
    /// This worker's own name; never a fetch candidate.
    worker_name: String,
}

impl RemoteBlobSource {
    pub fn new(
        backplane: Arc<dyn Backplane>,
        stubs: Arc<WorkerStubs>,
        worker_name: String,
    ) -> RemoteBlobSource {
        RemoteBlobSource {
            backplane,
            stubs,
            worker_name,
        }
    }
}

#[async_trait::async_trait]
impl BlobSource for RemoteBlobSource {
    async fn open(
        &self,
        digest: &Digest,
        offset: i64,
    ) -> Result<BoxStream<'static, std::io::Result<Bytes>>, Status> {
        let workers = self.backplane.get_workers().await?;
        let locations = self.backplane.get_blob_location_set(digest).await?;
        let mut candidates: Vec<String> = locations
            .intersection(&workers)
            .filter(|worker| **worker != self.worker_name)
            .cloned()
            .collect();
        candidates.shuffle(&mut rand::thread_rng());

        for worker in candidates {
            match self.stubs.get(&worker).get_blob(digest, offset, 0).await {
                Ok(blob) => {
                    debug!(blob = %digest, worker, "fetched blob from peer");
                    return Ok(Box::pin(stream::iter([Ok(blob)])));
                }
                Err(status) if status.code == Code::NotFound => {
                    info!(blob = %digest, worker, "peer did not contain blob");
                }
                Err(status) if status.code.is_retriable() => {
                    info!(blob = %digest, worker, error = %status, "peer fetch failed");
                }
                Err(status) => return Err(status),
            }
        }
        Err(Status::not_found(format!("blobs/{digest}")))
    }
}
