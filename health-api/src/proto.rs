//! `grpc.health.v1` messages
//!
//! Generated from `proto/grpc/health/v1/health.proto` by the build script,
//! which also derives serde so either codec can move them over the wire.

use crate::validation::{Validate, ValidationErrors};

pub mod v1 {
    tonic::include_proto!("grpc.health.v1");
}

pub use v1::health_check_response::ServingStatus;
pub use v1::{HealthCheckRequest, HealthCheckResponse};

/// Fully-qualified service name
pub const SERVICE_NAME: &str = "grpc.health.v1.Health";

/// Base path every procedure is mounted under
pub const SERVICE_PATH: &str = "/grpc.health.v1.Health/";

/// Unary `Check` procedure path
pub const CHECK_PATH: &str = "/grpc.health.v1.Health/Check";

/// Server-streaming `Watch` procedure path
pub const WATCH_PATH: &str = "/grpc.health.v1.Health/Watch";

impl HealthCheckRequest {
    /// Request for a named service
    pub fn for_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl HealthCheckResponse {
    /// Response carrying `status`
    pub fn with_status(status: ServingStatus) -> Self {
        Self {
            status: status as i32,
        }
    }
}

// No field rules are declared for either message.
impl Validate for HealthCheckRequest {
    fn validate_all(&self) -> Result<(), ValidationErrors> {
        Ok(())
    }
}

impl Validate for HealthCheckResponse {
    fn validate_all(&self) -> Result<(), ValidationErrors> {
        Ok(())
    }
}

pub(crate) fn is_zero(value: &i32) -> bool {
    *value == 0
}

/// proto3 JSON mapping for the `status` enum field: names on output, names
/// or numbers on input.
pub(crate) mod serving_status_json {
    use serde::{de, Deserialize, Deserializer, Serializer};

    use super::ServingStatus;

    pub fn serialize<S: Serializer>(value: &i32, serializer: S) -> Result<S::Ok, S::Error> {
        match ServingStatus::try_from(*value) {
            Ok(status) => serializer.serialize_str(status.as_str_name()),
            Err(_) => serializer.serialize_i32(*value),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Name(String),
        Number(i32),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(n),
            Repr::Name(name) => ServingStatus::from_str_name(&name)
                .map(|s| s as i32)
                .ok_or_else(|| de::Error::custom(format!("unknown ServingStatus `{name}`"))),
        }
    }
}
