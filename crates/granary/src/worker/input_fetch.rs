//! Input fetch stage: stage the exec directory from the CAS cache.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::worker::context::WorkerContext;
use crate::worker::pipeline::{next_context, OperationContext, SharedReceiver};

pub(crate) async fn run(
    context: Arc<WorkerContext>,
    input: SharedReceiver<OperationContext>,
    output: mpsc::Sender<OperationContext>,
    shutdown: CancellationToken,
) {
    while let Some(mut operation_context) = next_context(&input, &shutdown).await {
        let operation_name = operation_context.operation_name().to_string();
        if operation_context.claim_lost() {
            info!(operation = operation_name, "claim lost before input fetch");
            operation_context.poller.pause();
            continue;
        }

        debug!(operation = operation_name, "fetching inputs");
        let staged = context
            .exec_fs
            .create_exec_dir(
                &operation_name,
                &operation_context.directories_index,
                &operation_context.action,
                &operation_context.command,
            )
            .await;
        match staged {
            Ok(exec_dir) => {
                operation_context.exec_dir = Some(exec_dir);
                let permit = tokio::select! {
                    _ = shutdown.cancelled() => {
                        abandon(&context, operation_context).await;
                        break;
                    }
                    permit = output.reserve() => match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            abandon(&context, operation_context).await;
                            break;
                        }
                    },
                };
                permit.send(operation_context);
            }
            Err(err) => {
                warn!(operation = operation_name, error = %err, "input fetch failed");
                operation_context.poller.pause();
                context.requeue(&operation_name).await;
            }
        }
    }
}

/// Drop a staged context without reporting (shutdown path).
async fn abandon(context: &Arc<WorkerContext>, operation_context: OperationContext) {
    operation_context.poller.pause();
    if let Some(exec_dir) = operation_context.exec_dir.as_ref() {
        let _ = context.exec_fs.destroy_exec_dir(exec_dir).await;
    }
    context
        .requeue(operation_context.operation_name())
        .await;
}
