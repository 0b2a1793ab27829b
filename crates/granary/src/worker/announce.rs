//! Blob-location announcer.
//!
//! Consumes cache events and keeps the backplane's blob-location index in
//! step with this worker's CAS contents: puts add the worker to a digest's
//! location set, expirations remove it.

use std::sync::Arc;

use granary_backplane::{Backplane, Retrier};
use granary_cas::CacheEvent;
use tokio::sync::mpsc;
use tracing::{error, info};

pub struct BlobLocationAnnouncer {
    pub backplane: Arc<dyn Backplane>,
    pub worker_name: String,
}

impl BlobLocationAnnouncer {
    /// Drain cache events until the channel closes (cache drop) or
    /// shutdown.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<CacheEvent>,
        shutdown: tokio_util::sync::WaitForCancellationFutureOwned,
    ) {
        let retrier = Retrier::default();
        let mut shutdown = std::pin::pin!(shutdown);
        loop {
            let event = tokio::select! {
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                CacheEvent::Put(digest) => {
                    let result = retrier
                        .execute(|| self.backplane.add_blob_location(&digest, &self.worker_name))
                        .await;
                    if let Err(err) = result {
                        error!(blob = %digest, error = %err, "failed to announce blob");
                    }
                }
                CacheEvent::Expired(digests) => {
                    let result = retrier
                        .execute(|| {
                            self.backplane
                                .remove_blobs_location(&digests, &self.worker_name)
                        })
                        .await;
                    if let Err(err) = result {
                        error!(count = digests.len(), error = %err, "failed to retract blobs");
                    }
                }
            }
        }
        info!(worker = self.worker_name, "blob location announcer stopped");
    }
}
