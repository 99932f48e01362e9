//! Build script for health-api
//!
//! Compiles `proto/grpc/health/v1/health.proto` into `$OUT_DIR/grpc.health.v1.rs`,
//! included by `src/proto.rs`. Only the messages are generated; the
//! endpoint and the client drive `tonic::server::Grpc` and
//! `tonic::client::Grpc` themselves so one route can also answer Connect
//! and gRPC-Web.
//!
//! # Protocol Buffer Compiler
//!
//! Requires `protoc` on the build host (or the `PROTOC` environment
//! variable pointing at it).

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto = "proto/grpc/health/v1/health.proto";
    println!("cargo:rerun-if-changed={proto}");

    tonic_prost_build::configure()
        .build_client(false)
        .build_server(false)
        // proto3 JSON mapping for the JSON codec
        .type_attribute(
            ".grpc.health.v1",
            "#[derive(serde::Serialize, serde::Deserialize)]",
        )
        .type_attribute(
            ".grpc.health.v1.HealthCheckResponse.ServingStatus",
            "#[serde(rename_all = \"SCREAMING_SNAKE_CASE\")]",
        )
        .field_attribute(
            ".grpc.health.v1.HealthCheckRequest.service",
            "#[serde(default, skip_serializing_if = \"String::is_empty\")]",
        )
        .field_attribute(
            ".grpc.health.v1.HealthCheckResponse.status",
            "#[serde(default, with = \"crate::proto::serving_status_json\", \
             skip_serializing_if = \"crate::proto::is_zero\")]",
        )
        .compile_protos(&[proto], &["proto"])?;

    Ok(())
}
