//! Instance scheduler behavior against the in-memory backplane.

mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use granary::instance::monitor::{DispatchedMonitor, DispatchedMonitorConfig};
use granary::instance::{Instance, InstanceConfig};
use granary::queue_service::OperationQueueService;
use granary::Poller;
use granary_api::{
    ActionKey, ActionResult, Code, Command, Digest, DigestUtil, Directory, ExecutionStage,
    Operation, QueuedOperation, RequestMetadata, Status,
};
use granary_backend_memory::MemoryBackplane;
use granary_backplane::Backplane;
use prost::Message;

use support::{RecordingWatcher, TestWorkerFleet, WorkerMode};

struct Farm {
    backplane: Arc<MemoryBackplane>,
    instance: Arc<Instance>,
    fleet: TestWorkerFleet,
}

async fn farm() -> Farm {
    let backplane = Arc::new(MemoryBackplane::default());
    let fleet = TestWorkerFleet::new();
    let instance = Instance::new(
        InstanceConfig {
            watcher_ttl: Duration::from_secs(30),
            ..InstanceConfig::default()
        },
        backplane.clone(),
        fleet.stubs(),
    );
    instance.start().await.expect("start instance");
    Farm {
        backplane,
        instance,
        fleet,
    }
}

/// A runnable action: command blob plus empty input root.
struct SeededAction {
    action_digest: Digest,
    action: granary_api::Action,
}

fn seed_action(worker: &support::TestWorker) -> SeededAction {
    let command = Command {
        arguments: vec!["/bin/true".to_string()],
        ..Default::default()
    };
    let command_blob = command.encode_to_vec();
    let command_digest = worker.insert(command_blob);
    let root = Directory::default();
    let action = granary_api::Action {
        command_digest: Some(command_digest),
        input_root_digest: Some(DigestUtil.compute_message(&root)),
        ..Default::default()
    };
    let action_blob = action.encode_to_vec();
    let action_digest = worker.insert(action_blob);
    SeededAction {
        action_digest,
        action,
    }
}

async fn register_worker(farm: &Farm, worker: &support::TestWorker, digests: &[Digest]) {
    farm.backplane
        .add_worker(&worker.name)
        .await
        .expect("add worker");
    farm.backplane
        .add_blobs_location(digests, &worker.name)
        .await
        .expect("announce blobs");
}

fn request_metadata(invocation: &str) -> RequestMetadata {
    RequestMetadata {
        tool_name: "granary-test".to_string(),
        tool_invocation_id: invocation.to_string(),
        ..Default::default()
    }
}

/// Drive the queuer path for the single prequeued entry.
async fn promote_one(farm: &Farm) -> Result<(), Status> {
    let entry = farm
        .backplane
        .deprequeue_operation()
        .await
        .expect("deprequeue")
        .expect("prequeued entry");
    let poller = Poller::new(Duration::from_secs(5));
    farm.instance.queue(&entry, &poller).await
}

#[tokio::test]
async fn cached_hit_completes_without_touching_workers() {
    let farm = farm().await;
    let worker = farm.fleet.add("worker-1");
    let seeded = seed_action(&worker);
    register_worker(&farm, &worker, &[]).await;

    let cached_result = ActionResult {
        exit_code: 0,
        ..Default::default()
    };
    farm.backplane
        .put_action_result(&ActionKey(seeded.action_digest.clone()), &cached_result)
        .await
        .expect("seed action cache");

    let watcher = RecordingWatcher::new();
    farm.instance
        .execute(
            seeded.action_digest.clone(),
            false,
            None,
            None,
            request_metadata("inv-cached"),
            watcher.clone(),
        )
        .await
        .expect("execute");
    promote_one(&farm).await.expect("promote");

    let terminal = watcher.terminal().expect("terminal observation");
    match terminal.result.as_ref().expect("result") {
        granary_api::operation::Result::Response(response) => {
            assert!(response.cached_result);
            assert_eq!(
                response.result.as_ref().expect("action result").exit_code,
                0
            );
        }
        other => panic!("expected response, got {other:?}"),
    }
    assert_eq!(
        worker
            .find_missing_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
    assert_eq!(
        worker
            .get_blob_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn queue_then_match_hands_the_entry_to_one_worker() {
    let farm = farm().await;
    let worker = farm.fleet.add("worker-1");
    let seeded = seed_action(&worker);
    register_worker(
        &farm,
        &worker,
        &[
            seeded.action_digest.clone(),
            seeded.action.command_digest.clone().expect("command"),
        ],
    )
    .await;

    let watcher = RecordingWatcher::new();
    farm.instance
        .execute(
            seeded.action_digest.clone(),
            false,
            None,
            None,
            request_metadata("inv-queue"),
            watcher.clone(),
        )
        .await
        .expect("execute");
    promote_one(&farm).await.expect("promote");

    // Stage publications are monotonic and reach QUEUED.
    let stages = watcher.stages();
    assert!(stages.windows(2).all(|pair| pair[0] <= pair[1]), "{stages:?}");
    assert_eq!(stages.last(), Some(&ExecutionStage::Queued));

    let service = OperationQueueService::new(farm.backplane.clone() as Arc<dyn Backplane>);
    let entry = service.take().await.expect("take").expect("queue entry");
    let operation_name = entry
        .execute_entry
        .as_ref()
        .expect("execute entry")
        .operation_name
        .clone();
    assert!(!operation_name.is_empty());
    // The queued operation payload is fetchable by its digest.
    let queued_digest = entry.queued_operation_digest.clone().expect("digest");
    let blob = farm
        .instance
        .get_blob(&queued_digest, 0, 0)
        .await
        .expect("queued operation blob");
    let queued_operation = QueuedOperation::decode(blob.as_ref()).expect("decode");
    assert_eq!(queued_operation.action, Some(seeded.action.clone()));

    // A second concurrent take gets nothing.
    assert!(service.take().await.expect("second take").is_none());
}

#[tokio::test]
async fn missing_command_fails_precondition() {
    let farm = farm().await;
    let worker = farm.fleet.add("worker-1");
    // Seed only the action; its command digest resolves nowhere.
    let command = Command {
        arguments: vec!["/bin/true".to_string()],
        ..Default::default()
    };
    let command_digest = DigestUtil.compute(&command.encode_to_vec());
    let action = granary_api::Action {
        command_digest: Some(command_digest.clone()),
        ..Default::default()
    };
    let action_digest = worker.insert(action.encode_to_vec());
    register_worker(&farm, &worker, &[action_digest.clone()]).await;

    let watcher = RecordingWatcher::new();
    farm.instance
        .execute(
            action_digest,
            false,
            None,
            None,
            request_metadata("inv-missing"),
            watcher.clone(),
        )
        .await
        .expect("execute");
    let err = promote_one(&farm).await.expect_err("must fail validation");
    assert_eq!(err.code, Code::FailedPrecondition);

    let terminal = watcher.terminal().expect("terminal observation");
    let status = terminal.error_status().expect("error status");
    assert_eq!(Code::from_i32(status.code), Code::FailedPrecondition);
    assert_eq!(status.violations.len(), 1);
    assert_eq!(status.violations[0].r#type, "MISSING");
    assert_eq!(
        status.violations[0].subject,
        format!("blobs/{command_digest}")
    );
    // No stage past QUEUED was ever published.
    assert!(watcher
        .stages()
        .iter()
        .all(|stage| *stage <= ExecutionStage::Queued || *stage == ExecutionStage::Completed));
}

#[tokio::test]
async fn retry_with_same_metadata_skips_cache_lookup() {
    let farm = farm().await;
    let worker = farm.fleet.add("worker-1");
    let seeded = seed_action(&worker);
    register_worker(&farm, &worker, &[]).await;
    farm.backplane
        .put_action_result(&ActionKey(seeded.action_digest.clone()), &ActionResult::default())
        .await
        .expect("seed action cache");

    let metadata = request_metadata("inv-retry");
    let watcher = RecordingWatcher::new();
    farm.instance
        .execute(
            seeded.action_digest.clone(),
            false,
            None,
            None,
            metadata.clone(),
            watcher.clone(),
        )
        .await
        .expect("execute");
    promote_one(&farm).await.expect("promote");
    assert!(watcher.terminal().is_some(), "first call served from cache");

    // Same request metadata again: the prequeued entry must skip the cache.
    farm.instance
        .execute(
            seeded.action_digest.clone(),
            false,
            None,
            None,
            metadata,
            RecordingWatcher::new(),
        )
        .await
        .expect("execute retry");
    let entry = farm
        .backplane
        .deprequeue_operation()
        .await
        .expect("deprequeue")
        .expect("second entry");
    assert!(entry.skip_cache_lookup);
}

#[tokio::test]
async fn find_missing_blobs_fails_over_and_removes_dead_workers() {
    let farm = farm().await;
    let dead = farm.fleet.add("worker-dead");
    dead.set_mode(WorkerMode::Unavailable);
    let live = farm.fleet.add("worker-live");
    let held = live.insert("held blob");
    let absent = DigestUtil.compute(b"absent blob");
    register_worker(&farm, &dead, &[]).await;
    register_worker(&farm, &live, &[held.clone()]).await;

    let missing = farm
        .instance
        .find_missing_blobs(&[held.clone(), absent.clone()])
        .await
        .expect("find missing");
    assert_eq!(missing, vec![absent]);

    // The unreachable worker was dropped from the farm.
    let workers = farm.backplane.get_workers().await.expect("workers");
    assert!(!workers.contains("worker-dead"));
    assert!(workers.contains("worker-live"));
}

#[tokio::test]
async fn get_blob_corrects_an_empty_location_set() {
    let farm = farm().await;
    let worker = farm.fleet.add("worker-1");
    let digest = worker.insert("unannounced blob");
    // Worker registered, but the location index knows nothing of the blob.
    register_worker(&farm, &worker, &[]).await;

    let blob = farm
        .instance
        .get_blob(&digest, 0, 0)
        .await
        .expect("get after correction");
    assert_eq!(&blob[..], b"unannounced blob");

    let locations = farm
        .backplane
        .get_blob_location_set(&digest)
        .await
        .expect("locations");
    assert!(locations.contains("worker-1"));
}

#[tokio::test]
async fn get_blob_reports_not_found_after_one_correction_pass() {
    let farm = farm().await;
    let worker = farm.fleet.add("worker-1");
    register_worker(&farm, &worker, &[]).await;
    let absent = DigestUtil.compute(b"nowhere");

    let err = farm
        .instance
        .get_blob(&absent, 0, 0)
        .await
        .expect_err("not found");
    assert_eq!(err.code, Code::NotFound);
}

#[tokio::test]
async fn overdue_dispatched_operations_are_requeued() {
    let farm = farm().await;
    let worker = farm.fleet.add("worker-1");
    let seeded = seed_action(&worker);
    register_worker(
        &farm,
        &worker,
        &[
            seeded.action_digest.clone(),
            seeded.action.command_digest.clone().expect("command"),
        ],
    )
    .await;

    farm.instance
        .execute(
            seeded.action_digest.clone(),
            true,
            None,
            None,
            request_metadata("inv-requeue"),
            RecordingWatcher::new(),
        )
        .await
        .expect("execute");
    promote_one(&farm).await.expect("promote");

    let service = OperationQueueService::new(farm.backplane.clone() as Arc<dyn Backplane>);
    let entry = service.take().await.expect("take").expect("entry");
    let operation_name = entry
        .execute_entry
        .as_ref()
        .expect("execute entry")
        .operation_name
        .clone();

    // Simulate worker death: zero the deadline, then run a monitor sweep.
    assert!(service
        .poll(&entry, ExecutionStage::Queued, 0)
        .await
        .expect("poll"));
    let monitor = DispatchedMonitor {
        instance: farm.instance.clone(),
        config: DispatchedMonitorConfig::default(),
    };
    monitor.sweep().await;

    // The same operation is matchable again.
    let retaken = service.take().await.expect("retake").expect("entry");
    assert_eq!(
        retaken
            .execute_entry
            .as_ref()
            .expect("execute entry")
            .operation_name,
        operation_name
    );
    let operation: Option<Operation> = farm
        .backplane
        .get_operation(&operation_name)
        .await
        .expect("operation");
    assert!(!operation.expect("present").done);
}
