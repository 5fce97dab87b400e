use fabricfs_connect::ConnectorError;
use thiserror::Error;
use tonic::Status;

/// Controller failure, classified for the caller.
///
/// The variant decides the gRPC status code, which is the contract the
/// orchestrator retries against: `Aborted` means try again later, `Internal`
/// means nothing durable was half-done (every mutation is independently
/// resumable), `FailedPrecondition` means retrying is pointless until the
/// backend changes.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("{0}")]
    Aborted(String),

    #[error("{0}")]
    OutOfRange(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unimplemented(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

impl From<ControllerError> for Status {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::InvalidArgument(msg) => Status::invalid_argument(msg),
            ControllerError::FailedPrecondition(msg) => Status::failed_precondition(msg),
            ControllerError::Aborted(msg) => Status::aborted(msg),
            ControllerError::OutOfRange(msg) => Status::out_of_range(msg),
            ControllerError::NotFound(msg) => Status::not_found(msg),
            ControllerError::Unimplemented(msg) => Status::unimplemented(msg),
            ControllerError::Internal(msg) => Status::internal(msg),
        }
    }
}

impl From<ConnectorError> for ControllerError {
    fn from(err: ConnectorError) -> Self {
        ControllerError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        let status: Status = ControllerError::Aborted("busy".to_string()).into();
        assert_eq!(status.code(), tonic::Code::Aborted);

        let status: Status = ControllerError::InvalidArgument("bad".to_string()).into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status: Status = ControllerError::OutOfRange("limit".to_string()).into();
        assert_eq!(status.code(), tonic::Code::OutOfRange);
    }

    #[test]
    fn test_connector_error_is_internal() {
        let err: ControllerError =
            ConnectorError::Transport("connection refused".to_string()).into();
        assert!(matches!(err, ControllerError::Internal(_)));
    }
}
