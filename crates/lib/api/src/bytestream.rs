//! Write-stream discipline for blob uploads.
//!
//! A write carries its resource name on the first chunk only; every later
//! chunk's offset must equal the committed size, and `finish_write` closes
//! the stream. A mid-stream resource-name change is rejected.

use bytes::Bytes;

use crate::status::Status;

#[derive(Clone, Debug, Default)]
pub struct WriteRequest {
    /// Set on the first request; empty afterwards.
    pub resource_name: String,
    pub write_offset: i64,
    pub finish_write: bool,
    pub data: Bytes,
}

/// Tracks one write stream and enforces the chunk discipline.
#[derive(Debug, Default)]
pub struct WriteValidator {
    resource_name: Option<String>,
    committed_size: i64,
    finished: bool,
}

impl WriteValidator {
    pub fn new() -> WriteValidator {
        WriteValidator::default()
    }

    pub fn committed_size(&self) -> i64 {
        self.committed_size
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn resource_name(&self) -> Option<&str> {
        self.resource_name.as_deref()
    }

    /// Validate one request and account its data. Returns the chunk to
    /// append on success.
    pub fn accept(&mut self, request: &WriteRequest) -> Result<Bytes, Status> {
        if self.finished {
            return Err(Status::invalid_argument(
                "write request after finish_write".to_string(),
            ));
        }
        match (&self.resource_name, request.resource_name.is_empty()) {
            (None, true) => {
                return Err(Status::invalid_argument(
                    "missing resource name on first write request",
                ));
            }
            (None, false) => {
                self.resource_name = Some(request.resource_name.clone());
            }
            (Some(_), true) => {}
            (Some(current), false) if *current != request.resource_name => {
                return Err(Status::invalid_argument(format!(
                    "resource name changed while handling write: {} -> {}",
                    current, request.resource_name
                )));
            }
            (Some(_), false) => {}
        }
        if request.write_offset != self.committed_size {
            return Err(Status::invalid_argument(format!(
                "write offset {} does not match committed size {}",
                request.write_offset, self.committed_size
            )));
        }
        self.committed_size += request.data.len() as i64;
        if request.finish_write {
            self.finished = true;
        }
        Ok(request.data.clone())
    }
}

/// Bounds-check a read request against a blob size. Offsets past the end are
/// OutOfRange; a zero limit means unlimited.
pub fn check_read_range(offset: i64, limit: i64, size_bytes: i64) -> Result<(i64, i64), Status> {
    if offset < 0 || limit < 0 {
        return Err(Status::invalid_argument("negative read offset or limit"));
    }
    if offset > size_bytes {
        return Err(Status::out_of_range(format!(
            "read offset {offset} past end of blob ({size_bytes} bytes)"
        )));
    }
    let available = size_bytes - offset;
    let length = if limit == 0 { available } else { limit.min(available) };
    Ok((offset, length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    fn request(name: &str, offset: i64, data: &[u8], finish: bool) -> WriteRequest {
        WriteRequest {
            resource_name: name.to_string(),
            write_offset: offset,
            finish_write: finish,
            data: Bytes::copy_from_slice(data),
        }
    }

    #[test]
    fn accepts_a_well_formed_stream() {
        let mut validator = WriteValidator::new();
        validator
            .accept(&request("blobs/ab12_8", 0, b"gran", false))
            .expect("first chunk");
        validator
            .accept(&request("", 4, b"ary!", true))
            .expect("second chunk");
        assert_eq!(validator.committed_size(), 8);
        assert!(validator.is_finished());
    }

    #[test]
    fn rejects_missing_initial_resource_name() {
        let mut validator = WriteValidator::new();
        let err = validator
            .accept(&request("", 0, b"data", false))
            .expect_err("no name");
        assert_eq!(err.code, Code::InvalidArgument);
    }

    #[test]
    fn rejects_mid_stream_name_change() {
        let mut validator = WriteValidator::new();
        validator
            .accept(&request("blobs/ab12_8", 0, b"gran", false))
            .expect("first chunk");
        let err = validator
            .accept(&request("blobs/cd34_8", 4, b"ary!", false))
            .expect_err("name change");
        assert_eq!(err.code, Code::InvalidArgument);
    }

    #[test]
    fn rejects_offset_mismatch() {
        let mut validator = WriteValidator::new();
        validator
            .accept(&request("blobs/ab12_8", 0, b"gran", false))
            .expect("first chunk");
        let err = validator
            .accept(&request("", 3, b"ary!", false))
            .expect_err("bad offset");
        assert_eq!(err.code, Code::InvalidArgument);
    }

    #[test]
    fn rejects_writes_after_finish() {
        let mut validator = WriteValidator::new();
        validator
            .accept(&request("blobs/ab12_4", 0, b"gran", true))
            .expect("finish");
        let err = validator
            .accept(&request("", 4, b"more", false))
            .expect_err("after finish");
        assert_eq!(err.code, Code::InvalidArgument);
    }

    #[test]
    fn read_range_bounds() {
        assert_eq!(check_read_range(0, 0, 10).expect("full"), (0, 10));
        assert_eq!(check_read_range(4, 0, 10).expect("tail"), (4, 6));
        assert_eq!(check_read_range(4, 3, 10).expect("window"), (4, 3));
        assert_eq!(check_read_range(10, 0, 10).expect("empty tail"), (10, 0));
        let err = check_read_range(11, 0, 10).expect_err("past end");
        assert_eq!(err.code, Code::OutOfRange);
    }
}
