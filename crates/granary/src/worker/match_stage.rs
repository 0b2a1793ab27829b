//! Match stage: claim a queue entry and build the operation context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use granary_api::{
    ActionResult, Digest, DigestUtil, Directory, ExecuteOperationMetadata, ExecutionStage,
    Operation, QueueEntry, QueuedOperation,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::poller::Poller;
use crate::worker::context::WorkerContext;
use crate::worker::pipeline::OperationContext;

pub(crate) async fn run(
    context: Arc<WorkerContext>,
    output: mpsc::Sender<OperationContext>,
    shutdown: CancellationToken,
) {
    loop {
        // Claim a downstream slot before matching: no queue entry is taken
        // that the pipeline cannot hold.
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = output.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let entry = tokio::select! {
            _ = shutdown.cancelled() => break,
            entry = context.match_entry() => entry,
        };
        let entry = match entry {
            Ok(Some(entry)) => entry,
            Ok(None) => continue,
            Err(err) => {
                warn!(error = %err, "match failed");
                continue;
            }
        };
        let operation_name = entry
            .execute_entry
            .as_ref()
            .map(|execute_entry| execute_entry.operation_name.clone())
            .unwrap_or_default();
        info!(operation = operation_name, "matched");

        match fetch(&context, &entry).await {
            Some(operation_context) => {
                debug!(operation = operation_name, "match complete");
                permit.send(operation_context);
            }
            None => {
                info!(operation = operation_name, "operation fetch failed; requeueing");
                context.requeue(&operation_name).await;
            }
        }
    }
}

/// Resolve the queued operation into an OperationContext, or `None` when
/// this worker cannot run it.
async fn fetch(context: &Arc<WorkerContext>, entry: &QueueEntry) -> Option<OperationContext> {
    let execute_entry = entry.execute_entry.as_ref()?;
    let queued_operation = match context.get_queued_operation(entry).await {
        Ok(Some(queued_operation)) => queued_operation,
        Ok(None) => return None,
        Err(err) => {
            warn!(operation = execute_entry.operation_name, error = %err, "queued operation fetch failed");
            return None;
        }
    };
    let QueuedOperation {
        action,
        command,
        directories,
    } = queued_operation;
    let action = action?;
    let command = command?;
    if command.arguments.is_empty() {
        return None;
    }

    // Refuse actions whose timeout exceeds this worker's ceiling; another
    // worker may accept them.
    let maximum = context.config.maximum_action_timeout;
    if !maximum.is_zero() && action.timeout_secs > maximum.as_secs() as i64 {
        return None;
    }

    let metadata = ExecuteOperationMetadata {
        stage: ExecutionStage::Queued as i32,
        action_digest: execute_entry.action_digest.clone(),
        stdout_stream_name: execute_entry.stdout_stream_name.clone(),
        stderr_stream_name: execute_entry.stderr_stream_name.clone(),
    };
    let operation = Operation {
        name: execute_entry.operation_name.clone(),
        ..Default::default()
    }
    .with_execute_metadata(metadata.clone());

    let claim_lost = Arc::new(AtomicBool::new(false));
    let poller = Arc::new(Poller::new(context.config.operation_poll_period));
    let lost = claim_lost.clone();
    let requeue_context = context.clone();
    let requeue_name = execute_entry.operation_name.clone();
    context.resume_poller(
        &poller,
        entry.clone(),
        ExecutionStage::Queued,
        move || {
            lost.store(true, Ordering::SeqCst);
            requeue_context.deactivate(&requeue_name);
        },
    );

    Some(OperationContext {
        operation,
        queue_entry: entry.clone(),
        action,
        command,
        directories_index: directories_index(directories),
        metadata,
        exec_dir: None,
        action_result: ActionResult::default(),
        poller,
        claim_lost,
    })
}

pub(crate) fn directories_index(directories: Vec<Directory>) -> HashMap<Digest, Directory> {
    let mut index = HashMap::new();
    for directory in directories {
        let digest = DigestUtil.compute_message(&directory);
        index.entry(digest).or_insert(directory);
    }
    index
}
