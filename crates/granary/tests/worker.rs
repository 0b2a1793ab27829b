//! End-to-end worker pipeline: match, stage inputs, execute a real
//! subprocess, report the result.

mod support;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use granary::queue_service::OperationQueueService;
use granary::worker::blob_source::RemoteBlobSource;
use granary::worker::{Pipeline, WorkerConfig, WorkerContext};
use granary_api::{
    ActionKey, Command, Digest, DigestUtil, Directory, ExecuteEntry, FileNode, Operation,
    QueueEntry, QueuedOperation,
};
use granary_backend_memory::MemoryBackplane;
use granary_backplane::{Backplane, ChannelMessage, OperationListener};
use granary_cas::{CasFileCache, CasFileCacheConfig, ExecFileSystem};
use prost::Message;

use support::TestWorkerFleet;

struct NullListener;

impl OperationListener for NullListener {
    fn on_message(&self, _channel: &str, _message: ChannelMessage) {}
    fn on_reset(&self, _channel: &str, _operation: Option<Operation>) {}
}

struct WorkerHarness {
    _dir: tempfile::TempDir,
    backplane: Arc<MemoryBackplane>,
    context: Arc<WorkerContext>,
    peer: Arc<support::TestWorker>,
}

async fn harness() -> WorkerHarness {
    let dir = tempfile::tempdir().expect("tempdir");
    let backplane = Arc::new(MemoryBackplane::default());
    backplane
        .start(Arc::new(NullListener))
        .await
        .expect("start backplane");

    // A peer worker holds every seeded blob; this worker pulls from it.
    let fleet = TestWorkerFleet::new();
    let peer = fleet.add("peer:8981");
    backplane.add_worker("peer:8981").await.expect("add peer");

    let worker_name = "local:8981".to_string();
    backplane.add_worker(&worker_name).await.expect("add worker");
    let remote_source = Arc::new(RemoteBlobSource::new(
        backplane.clone(),
        fleet.stubs(),
        worker_name.clone(),
    ));
    let cache = Arc::new(CasFileCache::new(
        CasFileCacheConfig {
            root: dir.path().join("cas"),
            max_size_bytes: 1 << 24,
        },
        remote_source.clone(),
        None,
    ));
    let exec_fs = Arc::new(ExecFileSystem::new(
        dir.path().join("exec"),
        cache,
        true,
    ));
    exec_fs.start().await.expect("start exec fs");

    let context = WorkerContext::new(
        WorkerConfig {
            name: worker_name,
            input_fetch_width: 1,
            execute_width: 1,
            report_width: 1,
            operation_poll_period: Duration::from_secs(5),
            default_action_timeout: Duration::from_secs(30),
            maximum_action_timeout: Duration::from_secs(60),
            inline_content_limit: 1024,
        },
        Arc::new(OperationQueueService::new(backplane.clone())),
        backplane.clone(),
        exec_fs,
        remote_source,
    );
    WorkerHarness {
        _dir: dir,
        backplane,
        context,
        peer,
    }
}

/// Seed a queued operation on the peer and push its entry to the ready
/// queue. Returns the operation name and action digest.
async fn queue_action(
    harness: &WorkerHarness,
    arguments: Vec<String>,
    output_files: Vec<String>,
    timeout_secs: i64,
) -> (String, Digest) {
    let input_digest = harness.peer.insert("line one\n");
    let root = Directory {
        files: vec![FileNode {
            name: "input.txt".to_string(),
            digest: Some(input_digest.clone()),
            is_executable: false,
        }],
        ..Default::default()
    };
    let command = Command {
        arguments,
        output_files,
        ..Default::default()
    };
    let action = granary_api::Action {
        command_digest: Some(DigestUtil.compute_message(&command)),
        input_root_digest: Some(DigestUtil.compute_message(&root)),
        timeout_secs,
        ..Default::default()
    };
    let action_digest = DigestUtil.compute_message(&action);

    let queued_operation = QueuedOperation {
        action: Some(action),
        command: Some(command),
        directories: vec![root],
    };
    let queued_blob = Bytes::from(queued_operation.encode_to_vec());
    let queued_digest = harness.peer.insert(queued_blob);
    harness
        .backplane
        .add_blobs_location(
            &[queued_digest.clone(), input_digest],
            "peer:8981",
        )
        .await
        .expect("announce");

    let operation_name = format!("operations/{}", uuid::Uuid::new_v4());
    let execute_entry = ExecuteEntry {
        operation_name: operation_name.clone(),
        action_digest: Some(action_digest.clone()),
        skip_cache_lookup: true,
        stdout_stream_name: format!("{operation_name}/streams/stdout"),
        stderr_stream_name: format!("{operation_name}/streams/stderr"),
        ..Default::default()
    };
    let entry = QueueEntry {
        execute_entry: Some(execute_entry),
        queued_operation_digest: Some(queued_digest),
    };
    let operation = Operation {
        name: operation_name.clone(),
        ..Default::default()
    };
    harness
        .backplane
        .queue(&entry, &operation)
        .await
        .expect("queue");
    (operation_name, action_digest)
}

async fn await_done(harness: &WorkerHarness, operation_name: &str) -> Operation {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        if let Some(operation) = harness
            .backplane
            .get_operation(operation_name)
            .await
            .expect("get operation")
        {
            if operation.done {
                return operation;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "operation {operation_name} did not complete"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn pipeline_executes_and_reports() {
    let harness = harness().await;
    let (operation_name, action_digest) = queue_action(
        &harness,
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "/usr/bin/tr a-z A-Z < input.txt > out.txt && echo staged".to_string(),
        ],
        vec!["out.txt".to_string()],
        30,
    )
    .await;

    let shutdown = tokio_util::sync::CancellationToken::new();
    let pipeline = tokio::spawn(Pipeline::new(harness.context.clone()).run(shutdown.clone()));

    let operation = await_done(&harness, &operation_name).await;
    shutdown.cancel();
    let _ = pipeline.await;

    let response = match operation.result.as_ref().expect("result") {
        granary_api::operation::Result::Response(response) => response,
        other => panic!("expected response, got {other:?}"),
    };
    assert!(!response.cached_result);
    let action_result = response.result.as_ref().expect("action result");
    assert_eq!(action_result.exit_code, 0);
    assert_eq!(action_result.stdout_raw, b"staged\n");

    // The declared output was captured and content-addressed.
    assert_eq!(action_result.output_files.len(), 1);
    let output = &action_result.output_files[0];
    assert_eq!(output.path, "out.txt");
    let expected = DigestUtil.compute(b"LINE ONE\n");
    assert_eq!(output.digest.as_ref().expect("digest"), &expected);

    // The result landed in the action cache and the claim was released.
    let cached = harness
        .backplane
        .get_action_result(&ActionKey(action_digest))
        .await
        .expect("action cache")
        .expect("cached result");
    assert_eq!(cached.exit_code, 0);
    assert!(harness
        .backplane
        .get_dispatched_operations()
        .await
        .expect("dispatched")
        .is_empty());
}

#[tokio::test]
async fn failing_command_reports_its_exit_code() {
    let harness = harness().await;
    let (operation_name, _) = queue_action(
        &harness,
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo boom >&2; exit 7".to_string(),
        ],
        vec![],
        30,
    )
    .await;

    let shutdown = tokio_util::sync::CancellationToken::new();
    let pipeline = tokio::spawn(Pipeline::new(harness.context.clone()).run(shutdown.clone()));
    let operation = await_done(&harness, &operation_name).await;
    shutdown.cancel();
    let _ = pipeline.await;

    let response = match operation.result.as_ref().expect("result") {
        granary_api::operation::Result::Response(response) => response,
        other => panic!("expected response, got {other:?}"),
    };
    let action_result = response.result.as_ref().expect("action result");
    assert_eq!(action_result.exit_code, 7);
    assert_eq!(action_result.stderr_raw, b"boom\n");
}

#[tokio::test]
async fn timed_out_action_is_error_completed() {
    let harness = harness().await;
    let (operation_name, _) = queue_action(
        &harness,
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "/bin/sleep 30".to_string(),
        ],
        vec![],
        1,
    )
    .await;

    let shutdown = tokio_util::sync::CancellationToken::new();
    let pipeline = tokio::spawn(Pipeline::new(harness.context.clone()).run(shutdown.clone()));
    let operation = await_done(&harness, &operation_name).await;
    shutdown.cancel();
    let _ = pipeline.await;

    let status = operation.error_status().expect("error status");
    assert_eq!(
        granary_api::Code::from_i32(status.code),
        granary_api::Code::DeadlineExceeded
    );
}

#[tokio::test]
async fn take_hands_each_entry_to_exactly_one_consumer() {
    let harness = harness().await;
    let (_, _) = queue_action(
        &harness,
        vec!["/bin/true".to_string()],
        vec![],
        30,
    )
    .await;

    let mut takers = Vec::new();
    for _ in 0..4 {
        let backplane = harness.backplane.clone();
        takers.push(tokio::spawn(async move {
            OperationQueueService::new(backplane)
                .take()
                .await
                .expect("take")
        }));
    }
    let mut claimed = 0;
    for taker in takers {
        if taker.await.expect("join").is_some() {
            claimed += 1;
        }
    }
    assert_eq!(claimed, 1);
}
