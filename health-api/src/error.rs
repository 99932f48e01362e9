//! Error types and RPC status conversion
//!
//! Two error surfaces exist in this crate:
//!
//! - [`Error`] covers everything that happens outside a single RPC call:
//!   loading configuration, building a client, mounting an endpoint.
//! - [`tonic::Status`] is the per-call error. Providers, the registry, the
//!   client and the server handlers all speak `Status`, so a failure travels
//!   from a provider to a remote caller without being rewrapped.

use thiserror::Error;
use tonic::{Code, Status};

/// Result type alias using the crate's error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate
///
/// Large error variants are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// A client could not be authorized (token minting failed)
    #[error("Client construction failed: {0}")]
    Construction(String),

    /// An option carried a value this crate does not understand
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// Outbound transport failure outside of a call, e.g. a token endpoint
    #[error("Transport error: {0}")]
    Transport(String),

    /// The endpoint was already mounted onto a router
    #[error("Endpoint already mounted at {0}")]
    AlreadyMounted(String),

    /// A message failed validation
    #[error("Validation error: {0}")]
    Validation(#[from] crate::validation::ValidationError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A call returned a non-OK status
    #[error("RPC failed: {0}")]
    Rpc(Box<Status>),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// gRPC status code this error maps to when it reaches a caller
    pub fn code(&self) -> Code {
        match self {
            Error::Config(_) | Error::AlreadyMounted(_) => Code::FailedPrecondition,
            Error::Construction(_) => Code::Unauthenticated,
            Error::Transport(_) => Code::Unavailable,
            Error::InvalidOption(_) | Error::Validation(_) => Code::InvalidArgument,
            Error::Rpc(status) => status.code(),
            Error::Io(_) | Error::Internal(_) => Code::Internal,
        }
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Error::Rpc(Box::new(status))
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Rpc(status) => *status,
            other => Status::new(other.code(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::ValidationError;

    #[test]
    fn test_construction_error_maps_to_unauthenticated() {
        let status: Status = Error::Construction("metadata server unreachable".into()).into();
        assert_eq!(status.code(), Code::Unauthenticated);
        assert!(status.message().contains("metadata server unreachable"));
    }

    #[test]
    fn test_invalid_option_maps_to_invalid_argument() {
        let status: Status = Error::InvalidOption("unknown protocol `thrift`".into()).into();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_status_round_trips_through_error() {
        let err: Error = Status::not_found("unknown service payments").into();
        assert_eq!(err.code(), Code::NotFound);

        let status: Status = err.into();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "unknown service payments");
    }

    #[test]
    fn test_validation_error_maps_to_invalid_argument() {
        let err: Error = ValidationError::new("service", "must not be empty").into();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(
            err.to_string(),
            "Validation error: invalid service: must not be empty"
        );
    }

    #[test]
    fn test_already_mounted_display() {
        let err = Error::AlreadyMounted("/grpc.health.v1.Health/".into());
        assert_eq!(
            err.to_string(),
            "Endpoint already mounted at /grpc.health.v1.Health/"
        );
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[test]
    fn test_io_error_conversion() {
        let err: Error = std::io::Error::other("disk gone").into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.code(), Code::Internal);
    }
}
