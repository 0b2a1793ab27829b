//! Execute stage: run the subprocess under the action timeout.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use granary_api::{ExecutionStage, Status};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::worker::context::WorkerContext;
use crate::worker::pipeline::{next_context, OperationContext, SharedReceiver};
use crate::worker::report;

pub(crate) async fn run(
    context: Arc<WorkerContext>,
    input: SharedReceiver<OperationContext>,
    output: mpsc::Sender<OperationContext>,
    shutdown: CancellationToken,
) {
    while let Some(mut operation_context) = next_context(&input, &shutdown).await {
        let operation_name = operation_context.operation_name().to_string();
        if operation_context.claim_lost() {
            info!(operation = operation_name, "claim lost before execution");
            abandon(&context, operation_context).await;
            continue;
        }

        // The claim is now executing: restart the liveness poll at the new
        // stage and announce the transition.
        operation_context.poller.pause();
        operation_context.metadata.stage = ExecutionStage::Executing as i32;
        let executing = operation_context
            .operation
            .clone()
            .with_execute_metadata(operation_context.metadata.clone());
        operation_context.operation = executing.clone();
        if let Err(err) = context.put_operation(&executing).await {
            warn!(operation = operation_name, error = %err, "failed to announce executing");
        }
        {
            let lost = operation_context.claim_lost.clone();
            let deactivate_context = context.clone();
            let deactivate_name = operation_name.clone();
            context.resume_poller(
                &operation_context.poller,
                operation_context.queue_entry.clone(),
                ExecutionStage::Executing,
                move || {
                    lost.store(true, std::sync::atomic::Ordering::SeqCst);
                    deactivate_context.deactivate(&deactivate_name);
                },
            );
        }

        debug!(operation = operation_name, "executing");
        match execute_command(&context, &mut operation_context).await {
            Ok(()) => {
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
            Err(status) => {
                warn!(operation = operation_name, error = %status, "execution failed");
                report::report_error(&context, operation_context, &status).await;
            }
        }
    }
}

/// Spawn the action's command inside the exec dir and collect its outcome
/// into the action result.
async fn execute_command(
    context: &Arc<WorkerContext>,
    operation_context: &mut OperationContext,
) -> Result<(), Status> {
    let command = &operation_context.command;
    let exec_dir = operation_context
        .exec_dir
        .clone()
        .ok_or_else(|| Status::internal("execute stage without exec dir"))?;
    let working_directory = if command.working_directory.is_empty() {
        exec_dir.clone()
    } else {
        exec_dir.join(&command.working_directory)
    };

    let timeout = if operation_context.action.timeout_secs > 0 {
        Duration::from_secs(operation_context.action.timeout_secs as u64)
    } else {
        context.config.default_action_timeout
    };

    let program = &command.arguments[0];
    let mut subprocess = tokio::process::Command::new(program);
    subprocess
        .args(&command.arguments[1..])
        .current_dir(&working_directory)
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for variable in &command.environment_variables {
        subprocess.env(&variable.name, &variable.value);
    }

    let child = subprocess
        .spawn()
        .map_err(|err| Status::invalid_argument(format!("failed to spawn {program}: {err}")))?;
    let outcome = tokio::time::timeout(timeout, child.wait_with_output()).await;
    let output = match outcome {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => return Err(Status::internal(format!("wait failed: {err}"))),
        Err(_) => {
            return Err(Status::deadline_exceeded(format!(
                "action timed out after {}s",
                timeout.as_secs()
            )));
        }
    };

    let action_result = &mut operation_context.action_result;
    action_result.exit_code = output.status.code().unwrap_or(-1);
    action_result.stdout_raw = output.stdout;
    action_result.stderr_raw = output.stderr;
    Ok(())
}

async fn abandon(context: &Arc<WorkerContext>, operation_context: OperationContext) {
    operation_context.poller.pause();
    if let Some(exec_dir) = operation_context.exec_dir.as_ref() {
        let _ = context.exec_fs.destroy_exec_dir(exec_dir).await;
    }
    context.requeue(operation_context.operation_name()).await;
}
