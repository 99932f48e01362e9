//! Message validation
//!
//! Messages declare their field rules by implementing [`Validate`]. The
//! server runs every inbound request through
//! [`ValidationLayer`](crate::server::layers::ValidationLayer) before the
//! handler sees it.

use std::fmt;

use thiserror::Error;
use tonic::Status;

/// A single rule violation on a message field
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    field: String,
    reason: String,
}

impl ValidationError {
    /// Create a violation for `field`
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Name of the offending field
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Why the field was rejected
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// All violations found by [`Validate::validate_all`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationErrors(Vec<ValidationError>);

impl ValidationErrors {
    /// Record another violation
    pub fn push(&mut self, err: ValidationError) {
        self.0.push(err);
    }

    /// Whether no violation was recorded
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The recorded violations, in field order
    pub fn errors(&self) -> &[ValidationError] {
        &self.0
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        f.write_str(&joined)
    }
}

impl std::error::Error for ValidationErrors {}

impl From<ValidationErrors> for Status {
    fn from(errs: ValidationErrors) -> Self {
        Status::invalid_argument(errs.to_string())
    }
}

impl From<ValidationError> for Status {
    fn from(err: ValidationError) -> Self {
        Status::invalid_argument(err.to_string())
    }
}

/// Field rules for a message
pub trait Validate {
    /// Collect every violation
    fn validate_all(&self) -> Result<(), ValidationErrors>;

    /// Stop at the first violation
    fn validate(&self) -> Result<(), ValidationError> {
        match self.validate_all() {
            Ok(()) => Ok(()),
            Err(errs) => match errs.0.into_iter().next() {
                Some(first) => Err(first),
                None => Ok(()),
            },
        }
    }
}

impl<T: Validate> Validate for tonic::Request<T> {
    fn validate_all(&self) -> Result<(), ValidationErrors> {
        self.get_ref().validate_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, u32);

    impl Validate for Named {
        fn validate_all(&self) -> Result<(), ValidationErrors> {
            let mut errs = ValidationErrors::default();
            if self.0.is_empty() {
                errs.push(ValidationError::new("name", "must not be empty"));
            }
            if self.1 > 10 {
                errs.push(ValidationError::new("size", "must be at most 10"));
            }
            if errs.is_empty() {
                Ok(())
            } else {
                Err(errs)
            }
        }
    }

    #[test]
    fn test_validate_returns_first_violation() {
        let err = Named("", 11).validate().unwrap_err();
        assert_eq!(err.field(), "name");
        assert_eq!(err.reason(), "must not be empty");
    }

    #[test]
    fn test_validate_all_joins_violations() {
        let errs = Named("", 11).validate_all().unwrap_err();
        assert_eq!(errs.errors().len(), 2);
        assert_eq!(
            errs.to_string(),
            "invalid name: must not be empty; invalid size: must be at most 10"
        );
    }

    #[test]
    fn test_request_wrapper_delegates() {
        assert!(tonic::Request::new(Named("ok", 1)).validate().is_ok());
        let status: Status = tonic::Request::new(Named("ok", 99))
            .validate()
            .unwrap_err()
            .into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
