//! Worker-side execution pipeline and its context.

pub mod announce;
pub mod blob_source;
pub mod context;
pub mod execute;
pub mod input_fetch;
pub mod match_stage;
pub mod pipeline;
pub mod report;

pub use context::{WorkerConfig, WorkerContext};
pub use pipeline::{OperationContext, Pipeline};
