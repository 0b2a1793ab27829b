//! The granary scheduling plane.
//!
//! Frontend shards validate, cache-check and queue operations; workers claim
//! queue entries, stage inputs from the local CAS cache, execute, and report
//! results. All shared state lives in the backplane.

pub mod config;
pub mod instance;
pub mod poller;
pub mod queue_service;
pub mod stubs;
pub mod watchers;
pub mod worker;

pub use instance::Instance;
pub use poller::Poller;
pub use watchers::{WatchHandle, Watcher, WatcherHub};
