//! Canonical status codes and the error currency shared across the farm.

use crate::messages::{Digest, RpcStatus, Violation};

pub const VIOLATION_TYPE_MISSING: &str = "MISSING";

/// Canonical RPC status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    pub fn from_i32(value: i32) -> Code {
        match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    /// Whether a failure with this code is worth retrying against the same
    /// resource. Cancellation is never retriable; callers decide about
    /// deadline expiry themselves.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            Code::Unavailable | Code::ResourceExhausted | Code::Aborted | Code::Unknown
        )
    }
}

/// A status with an optional precondition-failure payload. This is the error
/// type that crosses component boundaries; terminal operations carry its
/// wire form ([`RpcStatus`]).
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
    pub violations: Vec<Violation>,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Status {
        Status {
            code,
            message: message.into(),
            violations: Vec::new(),
        }
    }

    pub fn ok() -> Status {
        Status::new(Code::Ok, "")
    }

    pub fn invalid_argument(message: impl Into<String>) -> Status {
        Status::new(Code::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Status {
        Status::new(Code::NotFound, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Status {
        Status::new(Code::Unavailable, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Status {
        Status::new(Code::DeadlineExceeded, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Status {
        Status::new(Code::Cancelled, message)
    }

    pub fn out_of_range(message: impl Into<String>) -> Status {
        Status::new(Code::OutOfRange, message)
    }

    pub fn internal(message: impl Into<String>) -> Status {
        Status::new(Code::Internal, message)
    }

    /// FailedPrecondition carrying a MISSING violation for a blob.
    pub fn missing_blob(digest: &Digest, description: impl Into<String>) -> Status {
        Status {
            code: Code::FailedPrecondition,
            message: "missing input".to_string(),
            violations: vec![Violation {
                r#type: VIOLATION_TYPE_MISSING.to_string(),
                subject: format!("blobs/{digest}"),
                description: description.into(),
            }],
        }
    }

    pub fn with_violations(mut self, violations: Vec<Violation>) -> Status {
        self.violations = violations;
        self
    }

    pub fn to_proto(&self) -> RpcStatus {
        RpcStatus {
            code: self.code as i32,
            message: self.message.clone(),
            violations: self.violations.clone(),
        }
    }

    pub fn from_proto(status: &RpcStatus) -> Status {
        Status {
            code: Code::from_i32(status.code),
            message: status.message.clone(),
            violations: status.violations.clone(),
        }
    }
}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Status {
        let code = match err.kind() {
            std::io::ErrorKind::NotFound => Code::NotFound,
            std::io::ErrorKind::TimedOut => Code::DeadlineExceeded,
            _ => Code::Internal,
        };
        Status::new(code, err.to_string())
    }
}
