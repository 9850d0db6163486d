//! # Node IDs and Cursors
//!
//! Opaque identifiers exposed by the admin API. A node ID is the base64
//! encoding of `"{Kind}:{id}"`; pagination cursors are job node IDs.

use std::fmt;

use base64::Engine;

use crate::error::{ApiError, validation_error};

const MAX_NODE_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    PermissionsSyncJob,
    User,
    Repository,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::PermissionsSyncJob => "PermissionsSyncJob",
            NodeKind::User => "User",
            NodeKind::Repository => "Repository",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn marshal_node_id(kind: NodeKind, id: i32) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("{kind}:{id}"))
}

/// Decode a node ID of the expected kind into its database id.
///
/// `field` names the offending parameter in the error details.
pub fn unmarshal_node_id(expected: NodeKind, value: &str, field: &str) -> Result<i32, ApiError> {
    let invalid = |reason: &str| {
        validation_error(
            &format!("invalid {expected} ID"),
            serde_json::json!({ field: reason }),
        )
    };

    if value.is_empty() {
        return Err(invalid("cannot be empty"));
    }
    if value.len() > MAX_NODE_ID_LEN {
        return Err(invalid("is too long"));
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|_| invalid("is not valid base64"))?;
    let decoded = String::from_utf8(decoded).map_err(|_| invalid("contains invalid UTF-8"))?;

    let (kind, id) = decoded
        .split_once(':')
        .ok_or_else(|| invalid("is malformed"))?;
    if kind != expected.as_str() {
        return Err(invalid(&format!("must be a {expected} ID, got {kind}")));
    }
    id.parse::<i32>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| invalid("contains an invalid id"))
}

/// Cursor pointing after the given job.
pub fn encode_job_cursor(job_id: i32) -> String {
    marshal_node_id(NodeKind::PermissionsSyncJob, job_id)
}

pub fn decode_job_cursor(cursor: &str) -> Result<i32, ApiError> {
    unmarshal_node_id(NodeKind::PermissionsSyncJob, cursor, "after")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_has_expected_encoding() {
        assert_eq!(marshal_node_id(NodeKind::User, 42), "VXNlcjo0Mg==");
        assert_eq!(unmarshal_node_id(NodeKind::User, "VXNlcjo0Mg==", "userID").unwrap(), 42);
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let repo_id = marshal_node_id(NodeKind::Repository, 7);
        let err = unmarshal_node_id(NodeKind::PermissionsSyncJob, &repo_id, "jobID").unwrap_err();
        assert_eq!(err.code, Into::<Box<str>>::into("VALIDATION_FAILED"));
        assert!(err.message.contains("PermissionsSyncJob"));
        let details = err.details.unwrap();
        assert!(details["jobID"].as_str().unwrap().contains("got Repository"));
    }

    #[test]
    fn malformed_ids_are_rejected() {
        for value in ["", "not base64!", "VXNlcg==", "VXNlcjphYmM=", &"a".repeat(200)] {
            assert!(
                unmarshal_node_id(NodeKind::User, value, "userID").is_err(),
                "{value} should be rejected"
            );
        }
    }

    #[test]
    fn job_cursor_roundtrips() {
        let cursor = encode_job_cursor(15);
        assert_eq!(decode_job_cursor(&cursor).unwrap(), 15);
        assert!(decode_job_cursor(&marshal_node_id(NodeKind::User, 15)).is_err());
    }
}
