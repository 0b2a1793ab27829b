//! Report stage: upload outputs, store the action result, complete the
//! operation, tear down the exec dir.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use granary_api::{
    operation, ActionKey, Digest, DigestUtil, Directory, DirectoryNode, ExecuteResponse,
    ExecutionStage, FileNode, OutputDirectory, OutputFile, Status, Tree,
};
use prost::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::worker::context::WorkerContext;
use crate::worker::pipeline::{next_context, OperationContext, SharedReceiver};

pub(crate) async fn run(
    context: Arc<WorkerContext>,
    input: SharedReceiver<OperationContext>,
    shutdown: CancellationToken,
) {
    while let Some(operation_context) = next_context(&input, &shutdown).await {
        let operation_name = operation_context.operation_name().to_string();
        if operation_context.claim_lost() {
            info!(operation = operation_name, "claim lost before report");
            teardown(&context, &operation_context).await;
            continue;
        }
        debug!(operation = operation_name, "reporting result");
        match report_result(&context, operation_context).await {
            Ok(()) => info!(operation = operation_name, "operation reported"),
            Err(err) => warn!(operation = operation_name, error = %err, "report failed"),
        }
    }
}

async fn report_result(
    context: &Arc<WorkerContext>,
    mut operation_context: OperationContext,
) -> Result<(), Status> {
    let uploaded = upload_outputs(context, &mut operation_context).await;
    if let Err(status) = uploaded {
        report_error(context, operation_context, &status).await;
        return Err(status);
    }

    let action_result = operation_context.action_result.clone();
    if !operation_context.action.do_not_cache {
        let action_digest = operation_context
            .metadata
            .action_digest
            .clone()
            .ok_or_else(|| Status::internal("operation without action digest"))?;
        context
            .put_action_result(&ActionKey(action_digest), &action_result)
            .await?;
    }

    operation_context.metadata.stage = ExecutionStage::Completed as i32;
    let completed = granary_api::Operation {
        done: true,
        result: Some(operation::Result::Response(ExecuteResponse {
            result: Some(action_result),
            cached_result: false,
            status: Some(Status::ok().to_proto()),
        })),
        ..operation_context.operation.clone()
    }
    .with_execute_metadata(operation_context.metadata.clone());
    let put = context.put_operation(&completed).await;
    teardown(context, &operation_context).await;
    put?;
    Ok(())
}

/// Surface a failed operation: done + error status, COMPLETED stage.
pub(crate) async fn report_error(
    context: &Arc<WorkerContext>,
    operation_context: OperationContext,
    status: &Status,
) {
    let mut metadata = operation_context.metadata.clone();
    metadata.stage = ExecutionStage::Completed as i32;
    let errored = granary_api::Operation {
        done: true,
        result: Some(operation::Result::Error(status.to_proto())),
        ..operation_context.operation.clone()
    }
    .with_execute_metadata(metadata);
    if let Err(err) = context.put_operation(&errored).await {
        warn!(
            operation = operation_context.operation_name(),
            error = %err,
            "failed to error-complete operation"
        );
    }
    teardown(context, &operation_context).await;
}

async fn teardown(context: &Arc<WorkerContext>, operation_context: &OperationContext) {
    operation_context.poller.pause();
    if let Some(exec_dir) = operation_context.exec_dir.as_ref() {
        if let Err(err) = context.exec_fs.destroy_exec_dir(exec_dir).await {
            warn!(
                operation = operation_context.operation_name(),
                error = %err,
                "failed to destroy exec dir"
            );
        }
    }
    context.deactivate(operation_context.operation_name());
}

/// Collect declared outputs into the action result, storing every blob in
/// the local CAS (the announcer propagates locations).
async fn upload_outputs(
    context: &Arc<WorkerContext>,
    operation_context: &mut OperationContext,
) -> Result<(), Status> {
    let exec_dir = operation_context
        .exec_dir
        .clone()
        .ok_or_else(|| Status::internal("report stage without exec dir"))?;
    let cache = context.exec_fs.file_cache().clone();
    let command = operation_context.command.clone();
    let action_result = &mut operation_context.action_result;

    for output_file in &command.output_files {
        let output_path = exec_dir.join(output_file);
        if !output_path.exists() {
            debug!(output = output_file, "declared output file does not exist");
            continue;
        }
        let contents = tokio::fs::read(&output_path).await.map_err(Status::from)?;
        let digest = DigestUtil.compute(&contents);
        let is_executable = is_executable(&output_path).await;
        cache
            .put_blob(&digest, Bytes::from(contents))
            .await
            .map_err(Status::from)?;
        action_result.output_files.push(OutputFile {
            path: output_file.clone(),
            digest: Some(digest),
            is_executable,
        });
    }

    for output_directory in &command.output_directories {
        let output_path = exec_dir.join(output_directory);
        if !output_path.exists() {
            debug!(output = output_directory, "declared output directory does not exist");
            continue;
        }
        let mut children = Vec::new();
        let root = read_output_directory(&cache, &output_path, &mut children).await?;
        let tree = Tree {
            root: Some(root),
            children,
        };
        let tree_blob = Bytes::from(tree.encode_to_vec());
        let tree_digest = DigestUtil.compute(&tree_blob);
        cache
            .put_blob(&tree_digest, tree_blob)
            .await
            .map_err(Status::from)?;
        action_result.output_directories.push(OutputDirectory {
            path: output_directory.clone(),
            tree_digest: Some(tree_digest),
        });
    }

    digest_std_output(
        &cache,
        &mut action_result.stdout_raw,
        &mut action_result.stdout_digest,
        context.config.inline_content_limit,
    )
    .await?;
    digest_std_output(
        &cache,
        &mut action_result.stderr_raw,
        &mut action_result.stderr_digest,
        context.config.inline_content_limit,
    )
    .await?;
    Ok(())
}

/// Store a std stream in the CAS; contents above the inline limit leave
/// only their digest behind.
async fn digest_std_output(
    cache: &Arc<granary_cas::CasFileCache>,
    raw: &mut Vec<u8>,
    digest: &mut Option<Digest>,
    inline_limit: usize,
) -> Result<(), Status> {
    if raw.is_empty() {
        return Ok(());
    }
    let computed = DigestUtil.compute(raw);
    cache
        .put_blob(&computed, Bytes::from(raw.clone()))
        .await
        .map_err(Status::from)?;
    *digest = Some(computed);
    if raw.len() > inline_limit {
        raw.clear();
    }
    Ok(())
}

/// Walk an output directory into a Directory message, storing file blobs
/// and accumulating child directories for the Tree.
fn read_output_directory<'a>(
    cache: &'a Arc<granary_cas::CasFileCache>,
    path: &'a Path,
    children: &'a mut Vec<Directory>,
) -> BoxFuture<'a, Result<Directory, Status>> {
    Box::pin(async move {
        let mut directory = Directory::default();
        let mut dirents = tokio::fs::read_dir(path).await.map_err(Status::from)?;
        let mut entries: Vec<(String, PathBuf, std::fs::Metadata)> = Vec::new();
        while let Some(dirent) = dirents.next_entry().await.map_err(Status::from)? {
            let name = dirent.file_name().to_string_lossy().into_owned();
            let metadata = dirent.metadata().await.map_err(Status::from)?;
            entries.push((name, dirent.path(), metadata));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, entry_path, metadata) in entries {
            if metadata.is_dir() {
                let child = read_output_directory(cache, &entry_path, children).await?;
                directory.directories.push(DirectoryNode {
                    name,
                    digest: Some(DigestUtil.compute_message(&child)),
                });
                children.push(child);
            } else if metadata.is_file() {
                let contents = tokio::fs::read(&entry_path).await.map_err(Status::from)?;
                let digest = DigestUtil.compute(&contents);
                let is_executable = is_executable(&entry_path).await;
                if !digest.is_empty() {
                    cache
                        .put_blob(&digest, Bytes::from(contents))
                        .await
                        .map_err(Status::from)?;
                }
                directory.files.push(FileNode {
                    name,
                    digest: Some(digest),
                    is_executable,
                });
            }
        }
        Ok(directory)
    })
}

async fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::metadata(path)
        .await
        .map(|metadata| metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
