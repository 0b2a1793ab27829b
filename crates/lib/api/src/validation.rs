//! Validation of resolved operations before they reach the ready queue.

use std::collections::HashSet;

use crate::digest::DigestUtil;
use crate::messages::{Digest, Directory, QueuedOperation};
use crate::status::{Status, VIOLATION_TYPE_MISSING};

pub const MISSING_ACTION: &str = "The action was not found in the CAS.";
pub const MISSING_COMMAND: &str = "The command was not found in the CAS.";
pub const MISSING_INPUT: &str = "A requested input was not found in the CAS.";

/// Validate a fully resolved QueuedOperation against its action digest.
///
/// Missing constituents are FailedPrecondition with MISSING violations; a
/// present but unusable command is InvalidArgument.
pub fn validate_queued_operation(
    action_digest: &Digest,
    queued_operation: &QueuedOperation,
) -> Result<(), Status> {
    let action = match queued_operation.action.as_ref() {
        None => return Err(Status::missing_blob(action_digest, MISSING_ACTION)),
        Some(action) => action,
    };

    let command_digest = action
        .command_digest
        .as_ref()
        .ok_or_else(|| Status::invalid_argument("action has no command digest"))?;
    let command = match queued_operation.command.as_ref() {
        None => return Err(Status::missing_blob(command_digest, MISSING_COMMAND)),
        Some(command) => command,
    };
    if command.arguments.is_empty() {
        return Err(Status::invalid_argument("command has no arguments"));
    }

    if let Some(input_root) = action.input_root_digest.as_ref() {
        validate_directory_closure(input_root, &queued_operation.directories)?;
    }
    Ok(())
}

/// Every directory reachable from the input root must be present in the
/// directory list.
fn validate_directory_closure(
    input_root: &Digest,
    directories: &[Directory],
) -> Result<(), Status> {
    let index: HashSet<Digest> = directories
        .iter()
        .map(|directory| DigestUtil.compute_message(directory))
        .collect();

    let mut pending = vec![input_root.clone()];
    let mut visited = HashSet::new();
    while let Some(digest) = pending.pop() {
        if digest.is_empty() || !visited.insert(digest.clone()) {
            continue;
        }
        if !index.contains(&digest) {
            return Err(Status::missing_blob(&digest, MISSING_INPUT));
        }
        let directory = directories
            .iter()
            .find(|directory| DigestUtil.compute_message(*directory) == digest)
            .expect("digest present in index");
        for node in &directory.directories {
            if let Some(child) = node.digest.as_ref() {
                pending.push(child.clone());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Action, Command, DirectoryNode};
    use crate::status::Code;

    fn action_with_inputs(command: &Command, root: &Directory) -> Action {
        Action {
            command_digest: Some(DigestUtil.compute_message(command)),
            input_root_digest: Some(DigestUtil.compute_message(root)),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_complete_operation() {
        let command = Command {
            arguments: vec!["/bin/true".to_string()],
            ..Default::default()
        };
        let root = Directory::default();
        let queued = QueuedOperation {
            action: Some(action_with_inputs(&command, &root)),
            command: Some(command),
            directories: vec![root],
        };
        let action_digest = DigestUtil.compute_message(queued.action.as_ref().expect("action"));
        validate_queued_operation(&action_digest, &queued).expect("valid");
    }

    #[test]
    fn missing_command_is_precondition_failure() {
        let command = Command {
            arguments: vec!["/bin/true".to_string()],
            ..Default::default()
        };
        let root = Directory::default();
        let queued = QueuedOperation {
            action: Some(action_with_inputs(&command, &root)),
            command: None,
            directories: vec![root],
        };
        let command_digest = DigestUtil.compute_message(&command);
        let err = validate_queued_operation(&DigestUtil.compute(b"action"), &queued)
            .expect_err("missing command");
        assert_eq!(err.code, Code::FailedPrecondition);
        assert_eq!(err.violations[0].r#type, VIOLATION_TYPE_MISSING);
        assert_eq!(err.violations[0].subject, format!("blobs/{command_digest}"));
    }

    #[test]
    fn empty_arguments_is_invalid() {
        let command = Command::default();
        let root = Directory::default();
        let queued = QueuedOperation {
            action: Some(action_with_inputs(&command, &root)),
            command: Some(command),
            directories: vec![root],
        };
        let err = validate_queued_operation(&DigestUtil.compute(b"action"), &queued)
            .expect_err("no arguments");
        assert_eq!(err.code, Code::InvalidArgument);
    }

    #[test]
    fn unresolved_subdirectory_is_missing_input() {
        let command = Command {
            arguments: vec!["/bin/true".to_string()],
            ..Default::default()
        };
        let absent_child = DigestUtil.compute(b"absent directory");
        let root = Directory {
            directories: vec![DirectoryNode {
                name: "deps".to_string(),
                digest: Some(absent_child.clone()),
            }],
            ..Default::default()
        };
        let queued = QueuedOperation {
            action: Some(action_with_inputs(&command, &root)),
            command: Some(command),
            directories: vec![root],
        };
        let err = validate_queued_operation(&DigestUtil.compute(b"action"), &queued)
            .expect_err("missing child");
        assert_eq!(err.code, Code::FailedPrecondition);
        assert_eq!(err.violations[0].subject, format!("blobs/{absent_child}"));
    }
}
