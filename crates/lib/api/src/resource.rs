//! Byte-stream resource names.
//!
//! Downloads read `blobs/<hash>_<size>`, uploads write
//! `uploads/<uuid>/blobs/<hash>_<size>`, and operation output streams live at
//! `<operation_name>/streams/{stdout,stderr}`. Names may carry an instance
//! prefix ahead of these segments.

use uuid::Uuid;

use crate::messages::Digest;
use crate::status::Status;

#[derive(Clone, Debug, PartialEq)]
pub enum Resource {
    Blob {
        instance: String,
        digest: Digest,
    },
    UploadBlob {
        instance: String,
        uuid: Uuid,
        digest: Digest,
    },
    OperationStream {
        operation_name: String,
        stream: StreamKind,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

pub fn blob_resource_name(digest: &Digest) -> String {
    format!("blobs/{digest}")
}

pub fn upload_resource_name(uuid: &Uuid, digest: &Digest) -> String {
    format!("uploads/{uuid}/blobs/{digest}")
}

pub fn stream_resource_name(operation_name: &str, stream: StreamKind) -> String {
    format!("{operation_name}/streams/{}", stream.as_str())
}

/// Parse a resource name. Malformed names are InvalidArgument.
pub fn parse(resource_name: &str) -> Result<Resource, Status> {
    let segments: Vec<&str> = resource_name.split('/').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(invalid(resource_name));
    }

    if let Some(index) = segments.iter().position(|segment| *segment == "uploads") {
        // [instance...]/uploads/<uuid>/blobs/<hash>_<size>
        if segments.len() != index + 4 || segments[index + 2] != "blobs" {
            return Err(invalid(resource_name));
        }
        let uuid = segments[index + 1]
            .parse::<Uuid>()
            .map_err(|_| invalid(resource_name))?;
        let digest = Digest::parse_key(segments[index + 3]).ok_or_else(|| invalid(resource_name))?;
        return Ok(Resource::UploadBlob {
            instance: segments[..index].join("/"),
            uuid,
            digest,
        });
    }

    if let Some(index) = segments.iter().position(|segment| *segment == "blobs") {
        // [instance...]/blobs/<hash>_<size>
        if segments.len() != index + 2 {
            return Err(invalid(resource_name));
        }
        let digest = Digest::parse_key(segments[index + 1]).ok_or_else(|| invalid(resource_name))?;
        return Ok(Resource::Blob {
            instance: segments[..index].join("/"),
            digest,
        });
    }

    // <operation_name...>/streams/{stdout,stderr}
    if segments.len() >= 3 && segments[segments.len() - 2] == "streams" {
        let stream = match segments[segments.len() - 1] {
            "stdout" => StreamKind::Stdout,
            "stderr" => StreamKind::Stderr,
            _ => return Err(invalid(resource_name)),
        };
        return Ok(Resource::OperationStream {
            operation_name: segments[..segments.len() - 2].join("/"),
            stream,
        });
    }

    Err(invalid(resource_name))
}

fn invalid(resource_name: &str) -> Status {
    Status::invalid_argument(format!("invalid resource name: {resource_name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::DigestUtil;
    use crate::status::Code;

    #[test]
    fn parses_blob_download() {
        let digest = DigestUtil.compute(b"blob");
        let resource = parse(&blob_resource_name(&digest)).expect("parse");
        assert_eq!(
            resource,
            Resource::Blob {
                instance: String::new(),
                digest,
            }
        );
    }

    #[test]
    fn parses_instance_prefixed_upload() {
        let digest = DigestUtil.compute(b"blob");
        let uuid = Uuid::new_v4();
        let name = format!("shard-a/uploads/{uuid}/blobs/{digest}");
        let resource = parse(&name).expect("parse");
        assert_eq!(
            resource,
            Resource::UploadBlob {
                instance: "shard-a".to_string(),
                uuid,
                digest,
            }
        );
    }

    #[test]
    fn parses_operation_stream() {
        let name = stream_resource_name("operations/abc-123", StreamKind::Stderr);
        let resource = parse(&name).expect("parse");
        assert_eq!(
            resource,
            Resource::OperationStream {
                operation_name: "operations/abc-123".to_string(),
                stream: StreamKind::Stderr,
            }
        );
    }

    #[test]
    fn rejects_malformed_names() {
        let digest = DigestUtil.compute(b"blob");
        for name in [
            "",
            "blobs",
            "blobs/not-a-digest",
            "blobs//x",
            &format!("uploads/not-a-uuid/blobs/{digest}"),
            &format!("uploads/{}/wrong/{digest}", Uuid::new_v4()),
            "op/streams/stdlog",
            "streams/stdout",
        ] {
            let err = parse(name).expect_err(name);
            assert_eq!(err.code, Code::InvalidArgument, "{name}");
        }
    }
}
