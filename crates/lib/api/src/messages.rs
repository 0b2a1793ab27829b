//! Message types exchanged between clients, frontend shards and workers.
//!
//! These are hand-derived prost messages rather than protoc output; the
//! field numbering is part of the wire contract and must not be reordered.

/// Content address of a blob.
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct Digest {
    /// Lowercase hex sha256 of the blob contents.
    #[prost(string, tag = "1")]
    pub hash: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub size_bytes: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Property {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub value: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Platform {
    #[prost(message, repeated, tag = "1")]
    pub properties: ::prost::alloc::vec::Vec<Property>,
}

/// A unit of work: command + input tree + constraints, content-addressed.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Action {
    #[prost(message, optional, tag = "1")]
    pub command_digest: ::core::option::Option<Digest>,
    #[prost(message, optional, tag = "2")]
    pub input_root_digest: ::core::option::Option<Digest>,
    /// Zero means no action-level timeout.
    #[prost(int64, tag = "3")]
    pub timeout_secs: i64,
    #[prost(bool, tag = "4")]
    pub do_not_cache: bool,
    #[prost(message, optional, tag = "5")]
    pub platform: ::core::option::Option<Platform>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnvironmentVariable {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub value: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Command {
    #[prost(string, repeated, tag = "1")]
    pub arguments: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(message, repeated, tag = "2")]
    pub environment_variables: ::prost::alloc::vec::Vec<EnvironmentVariable>,
    /// Paths relative to the exec root, using forward slashes.
    #[prost(string, repeated, tag = "3")]
    pub output_files: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, repeated, tag = "4")]
    pub output_directories: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, tag = "5")]
    pub working_directory: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileNode {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub digest: ::core::option::Option<Digest>,
    #[prost(bool, tag = "3")]
    pub is_executable: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DirectoryNode {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub digest: ::core::option::Option<Digest>,
}

/// One level of an input tree. The transitive closure of an input root
/// forms a Tree.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Directory {
    #[prost(message, repeated, tag = "1")]
    pub files: ::prost::alloc::vec::Vec<FileNode>,
    #[prost(message, repeated, tag = "2")]
    pub directories: ::prost::alloc::vec::Vec<DirectoryNode>,
}

/// Recursive directory bundle reported for an output directory.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Tree {
    #[prost(message, optional, tag = "1")]
    pub root: ::core::option::Option<Directory>,
    #[prost(message, repeated, tag = "2")]
    pub children: ::prost::alloc::vec::Vec<Directory>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OutputFile {
    #[prost(string, tag = "1")]
    pub path: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub digest: ::core::option::Option<Digest>,
    #[prost(bool, tag = "3")]
    pub is_executable: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OutputDirectory {
    #[prost(string, tag = "1")]
    pub path: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub tree_digest: ::core::option::Option<Digest>,
}

/// The outcome of running an Action.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActionResult {
    #[prost(message, repeated, tag = "1")]
    pub output_files: ::prost::alloc::vec::Vec<OutputFile>,
    #[prost(message, repeated, tag = "2")]
    pub output_directories: ::prost::alloc::vec::Vec<OutputDirectory>,
    #[prost(int32, tag = "3")]
    pub exit_code: i32,
    #[prost(bytes = "vec", tag = "4")]
    pub stdout_raw: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, optional, tag = "5")]
    pub stdout_digest: ::core::option::Option<Digest>,
    #[prost(bytes = "vec", tag = "6")]
    pub stderr_raw: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, optional, tag = "7")]
    pub stderr_digest: ::core::option::Option<Digest>,
}

/// Coarse operation state. The published sequence for one operation is
/// strictly non-decreasing under this order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum ExecutionStage {
    Unknown = 0,
    CacheCheck = 1,
    Queued = 2,
    Executing = 3,
    Completed = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecuteOperationMetadata {
    #[prost(enumeration = "ExecutionStage", tag = "1")]
    pub stage: i32,
    #[prost(message, optional, tag = "2")]
    pub action_digest: ::core::option::Option<Digest>,
    #[prost(string, tag = "3")]
    pub stdout_stream_name: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub stderr_stream_name: ::prost::alloc::string::String,
}

/// Client-supplied request provenance. Keys the retry cache, so it must
/// hash consistently.
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct RequestMetadata {
    #[prost(string, tag = "1")]
    pub tool_name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub tool_version: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub action_id: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub tool_invocation_id: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub correlated_invocations_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Violation {
    #[prost(string, tag = "1")]
    pub r#type: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub subject: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub description: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PreconditionFailure {
    #[prost(message, repeated, tag = "1")]
    pub violations: ::prost::alloc::vec::Vec<Violation>,
}

/// Wire form of a terminal status, including precondition violations.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "3")]
    pub violations: ::prost::alloc::vec::Vec<Violation>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecuteResponse {
    #[prost(message, optional, tag = "1")]
    pub result: ::core::option::Option<ActionResult>,
    #[prost(bool, tag = "2")]
    pub cached_result: bool,
    #[prost(message, optional, tag = "3")]
    pub status: ::core::option::Option<RpcStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecutionPolicy {
    #[prost(int32, tag = "1")]
    pub priority: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResultsCachePolicy {
    #[prost(int32, tag = "1")]
    pub priority: i32,
}

/// Envelope of a client execute request, as carried through the prequeue.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecuteEntry {
    #[prost(string, tag = "1")]
    pub operation_name: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub action_digest: ::core::option::Option<Digest>,
    #[prost(bool, tag = "3")]
    pub skip_cache_lookup: bool,
    #[prost(message, optional, tag = "4")]
    pub execution_policy: ::core::option::Option<ExecutionPolicy>,
    #[prost(message, optional, tag = "5")]
    pub results_cache_policy: ::core::option::Option<ResultsCachePolicy>,
    #[prost(message, optional, tag = "6")]
    pub request_metadata: ::core::option::Option<RequestMetadata>,
    #[prost(string, tag = "7")]
    pub stdout_stream_name: ::prost::alloc::string::String,
    #[prost(string, tag = "8")]
    pub stderr_stream_name: ::prost::alloc::string::String,
}

/// Fully resolved execution envelope, content-addressed as a single blob so
/// workers can fetch it atomically.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueuedOperation {
    #[prost(message, optional, tag = "1")]
    pub action: ::core::option::Option<Action>,
    #[prost(message, optional, tag = "2")]
    pub command: ::core::option::Option<Command>,
    #[prost(message, repeated, tag = "3")]
    pub directories: ::prost::alloc::vec::Vec<Directory>,
}

/// What workers dequeue from the ready queue.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueueEntry {
    #[prost(message, optional, tag = "1")]
    pub execute_entry: ::core::option::Option<ExecuteEntry>,
    #[prost(message, optional, tag = "2")]
    pub queued_operation_digest: ::core::option::Option<Digest>,
}

/// Dispatched-map record, live from match until complete or requeue.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DispatchedOperation {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    /// Epoch milliseconds past which the DispatchedMonitor requeues.
    #[prost(int64, tag = "2")]
    pub requeue_at: i64,
    #[prost(message, optional, tag = "3")]
    pub queue_entry: ::core::option::Option<QueueEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueuedOperationMetadata {
    #[prost(message, optional, tag = "1")]
    pub execute_operation_metadata: ::core::option::Option<ExecuteOperationMetadata>,
    #[prost(message, optional, tag = "2")]
    pub queued_operation_digest: ::core::option::Option<Digest>,
    #[prost(message, optional, tag = "3")]
    pub request_metadata: ::core::option::Option<RequestMetadata>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OperationMetadata {
    #[prost(oneof = "operation_metadata::Kind", tags = "1, 2")]
    pub kind: ::core::option::Option<operation_metadata::Kind>,
}

pub mod operation_metadata {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Execute(super::ExecuteOperationMetadata),
        #[prost(message, tag = "2")]
        Queued(super::QueuedOperationMetadata),
    }
}

/// External-facing handle for a submitted execution.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Operation {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub done: bool,
    #[prost(message, optional, tag = "3")]
    pub metadata: ::core::option::Option<OperationMetadata>,
    #[prost(oneof = "operation::Result", tags = "4, 5")]
    pub result: ::core::option::Option<operation::Result>,
}

pub mod operation {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "4")]
        Error(super::RpcStatus),
        #[prost(message, tag = "5")]
        Response(super::ExecuteResponse),
    }
}

impl Operation {
    /// The execute metadata, resolved through either metadata form.
    pub fn execute_metadata(&self) -> Option<&ExecuteOperationMetadata> {
        match self.metadata.as_ref()?.kind.as_ref()? {
            operation_metadata::Kind::Execute(metadata) => Some(metadata),
            operation_metadata::Kind::Queued(metadata) => {
                metadata.execute_operation_metadata.as_ref()
            }
        }
    }

    pub fn stage(&self) -> ExecutionStage {
        self.execute_metadata()
            .and_then(|metadata| ExecutionStage::try_from(metadata.stage).ok())
            .unwrap_or(ExecutionStage::Unknown)
    }

    /// Copy of this operation with metadata reduced to the execute form.
    /// Published operations never carry the queued payload digest.
    pub fn stripped(&self) -> Operation {
        let metadata = self.execute_metadata().cloned().unwrap_or_default();
        Operation {
            name: self.name.clone(),
            done: self.done,
            metadata: Some(OperationMetadata {
                kind: Some(operation_metadata::Kind::Execute(metadata)),
            }),
            result: self.result.clone(),
        }
    }

    pub fn with_execute_metadata(mut self, metadata: ExecuteOperationMetadata) -> Operation {
        self.metadata = Some(OperationMetadata {
            kind: Some(operation_metadata::Kind::Execute(metadata)),
        });
        self
    }

    pub fn with_queued_metadata(mut self, metadata: QueuedOperationMetadata) -> Operation {
        self.metadata = Some(OperationMetadata {
            kind: Some(operation_metadata::Kind::Queued(metadata)),
        });
        self
    }

    pub fn error_status(&self) -> Option<&RpcStatus> {
        match self.result.as_ref()? {
            operation::Result::Error(status) => Some(status),
            operation::Result::Response(response) => response.status.as_ref(),
        }
    }
}
