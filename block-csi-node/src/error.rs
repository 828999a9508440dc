//! Error taxonomy for the node plugin.
//!
//! Every failure inside the node service is a [`NodeError`]. The gRPC
//! boundary converts it into a [`tonic::Status`] whose code tells the
//! container orchestrator whether the request itself was wrong, whether it
//! collided with existing state, or whether the host failed underneath it.

use std::io;

use thiserror::Error;
use tonic::Status;

use crate::types::TransportParseError;

#[derive(Error, Debug)]
pub enum NodeError {
    /// Malformed or incomplete request, or an unsupported capability.
    #[error("Request Validation Error: {0}")]
    InvalidRequest(String),

    #[error("volume '{0}' is already being processed")]
    AlreadyProcessing(String),

    #[error("device '{device}' is already mounted at '{mountpoint}'")]
    MountedElsewhere { device: String, mountpoint: String },

    #[error("could not find path: {0}")]
    PathNotFound(String),

    #[error("invalid publish context: {0}")]
    PublishContext(String),

    #[error("unexpected format of '{path}': {reason}")]
    Format { path: String, reason: String },

    #[error(transparent)]
    UnsupportedTransport(#[from] TransportParseError),

    #[error("nothing was written to scan file '{0}'")]
    NothingWritten(String),

    #[error("deadline exceeded while {0}")]
    DeadlineExceeded(String),

    #[error("volume not staged at '{0}'")]
    NotStaged(String),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("{0} is not implemented")]
    Unimplemented(&'static str),

    #[error("IO error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl NodeError {
    /// Wrap an IO error together with the path it occurred on.
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        NodeError::Io {
            path: path.into(),
            source,
        }
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            NodeError::InvalidRequest(_) => "invalid_argument",
            NodeError::AlreadyProcessing(_) | NodeError::MountedElsewhere { .. } => {
                "already_exists"
            }
            NodeError::NotStaged(_) => "failed_precondition",
            NodeError::Unimplemented(_) => "unimplemented",
            NodeError::DeadlineExceeded(_) => "deadline_exceeded",
            _ => "internal",
        }
    }
}

impl From<NodeError> for Status {
    fn from(err: NodeError) -> Self {
        let message = err.to_string();
        match err {
            NodeError::InvalidRequest(_) => Status::invalid_argument(message),
            NodeError::AlreadyProcessing(_) | NodeError::MountedElsewhere { .. } => {
                Status::already_exists(message)
            }
            NodeError::NotStaged(_) => Status::failed_precondition(message),
            NodeError::Unimplemented(_) => Status::unimplemented(message),
            NodeError::DeadlineExceeded(_) => Status::deadline_exceeded(message),
            _ => Status::internal(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_client_errors_map_to_invalid_argument() {
        let status: Status = NodeError::InvalidRequest("Volume ID not provided".into()).into();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(status.message().contains("Volume ID not provided"));
    }

    #[test]
    fn test_conflicts_map_to_already_exists() {
        let status: Status = NodeError::AlreadyProcessing("vol-1".into()).into();
        assert_eq!(status.code(), Code::AlreadyExists);

        let status: Status = NodeError::MountedElsewhere {
            device: "/dev/dm-2".into(),
            mountpoint: "/other".into(),
        }
        .into();
        assert_eq!(status.code(), Code::AlreadyExists);
    }

    #[test]
    fn test_host_failures_map_to_internal_with_text() {
        let err = NodeError::io(
            "/sys/class/scsi_host/host3/scan",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        let status: Status = err.into();
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().contains("host3/scan"));
        assert!(status.message().contains("denied"));

        let status: Status = NodeError::PathNotFound("/dev/disk/by-path/x".into()).into();
        assert_eq!(status.code(), Code::Internal);
    }

    #[test]
    fn test_unimplemented_is_explicit() {
        let status: Status = NodeError::Unimplemented("NodeGetVolumeStats").into();
        assert_eq!(status.code(), Code::Unimplemented);
        assert_eq!(NodeError::Unimplemented("x").kind(), "unimplemented");
    }
}
