//! The match -> input fetch -> execute -> report pipeline.
//!
//! Stages are task pools joined by bounded channels. A stage reserves a
//! downstream slot before it emits, so backpressure propagates to the match
//! stage without unbounded queues: the worker never claims more work than
//! its pipeline can hold.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use granary_api::{
    Action, ActionResult, Command, Digest, Directory, ExecuteOperationMetadata, Operation,
    QueueEntry,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::poller::Poller;
use crate::worker::context::WorkerContext;
use crate::worker::{execute, input_fetch, match_stage, report};

/// The in-flight unit passed between stages.
pub struct OperationContext {
    pub operation: Operation,
    pub queue_entry: QueueEntry,
    pub action: Action,
    pub command: Command,
    pub directories_index: HashMap<Digest, Directory>,
    pub metadata: ExecuteOperationMetadata,
    pub exec_dir: Option<PathBuf>,
    pub action_result: ActionResult,
    pub poller: Arc<Poller>,
    /// Set when the liveness poll reports the claim lost; stages abandon
    /// the operation at their next boundary.
    pub claim_lost: Arc<AtomicBool>,
}

impl OperationContext {
    pub fn operation_name(&self) -> &str {
        &self.operation.name
    }

    pub fn claim_lost(&self) -> bool {
        self.claim_lost.load(Ordering::SeqCst)
    }
}

pub struct Pipeline {
    context: Arc<WorkerContext>,
}

impl Pipeline {
    pub fn new(context: Arc<WorkerContext>) -> Pipeline {
        Pipeline { context }
    }

    /// Run all stages until shutdown; resolves when every stage has exited.
    pub async fn run(self, shutdown: CancellationToken) {
        let config = &self.context.config;
        info!(
            worker = config.name,
            input_fetch_width = config.input_fetch_width,
            execute_width = config.execute_width,
            report_width = config.report_width,
            "pipeline starting"
        );

        let (fetch_tx, fetch_rx) = mpsc::channel::<OperationContext>(1);
        let (execute_tx, execute_rx) = mpsc::channel::<OperationContext>(1);
        let (report_tx, report_rx) = mpsc::channel::<OperationContext>(1);

        let mut stage_tasks = Vec::new();

        stage_tasks.push(tokio::spawn(match_stage::run(
            self.context.clone(),
            fetch_tx,
            shutdown.clone(),
        )));

        let fetch_rx = shared(fetch_rx);
        for _ in 0..config.input_fetch_width {
            stage_tasks.push(tokio::spawn(input_fetch::run(
                self.context.clone(),
                fetch_rx.clone(),
                execute_tx.clone(),
                shutdown.clone(),
            )));
        }
        drop(execute_tx);

        let execute_rx = shared(execute_rx);
        for _ in 0..config.execute_width {
            stage_tasks.push(tokio::spawn(execute::run(
                self.context.clone(),
                execute_rx.clone(),
                report_tx.clone(),
                shutdown.clone(),
            )));
        }
        drop(report_tx);

        let report_rx = shared(report_rx);
        for _ in 0..config.report_width {
            stage_tasks.push(tokio::spawn(report::run(
                self.context.clone(),
                report_rx.clone(),
                shutdown.clone(),
            )));
        }

        for task in stage_tasks {
            let _ = task.await;
        }
        info!(worker = config.name, "pipeline stopped");
    }
}

/// Wrap a receiver so a pool of stage tasks can share it.
pub(crate) type SharedReceiver<T> = Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>;

fn shared<T>(receiver: mpsc::Receiver<T>) -> SharedReceiver<T> {
    Arc::new(tokio::sync::Mutex::new(receiver))
}

/// Pop the next context, or `None` on shutdown/closed channel.
pub(crate) async fn next_context(
    receiver: &SharedReceiver<OperationContext>,
    shutdown: &CancellationToken,
) -> Option<OperationContext> {
    let mut receiver = tokio::select! {
        _ = shutdown.cancelled() => return None,
        receiver = receiver.lock() => receiver,
    };
    tokio::select! {
        _ = shutdown.cancelled() => None,
        context = receiver.recv() => context,
    }
}
