//! # health-api
//!
//! The `grpc.health.v1.Health` service for axum applications: answer
//! "is service X healthy" for many named services from one endpoint, and
//! ask the same question of remote endpoints.
//!
//! ## Features
//!
//! - **Registry**: service name to provider map; unknown names fail `NOT_FOUND`
//! - **Client**: ordered options for protocol, codec, transport, bearer
//!   tokens, interceptors and deadlines
//! - **Server**: mountable `Check`/`Watch` route group with panic recovery
//!   and request validation
//! - **Protocols**: Connect, gRPC and gRPC-Web, each with protobuf or JSON
//!
//! ## Example
//!
//! ```rust,no_run
//! use axum::Router;
//! use health_api::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     // Upstream dependency checked over the network
//!     let upstream = HealthClient::from_settings(&config.client).await?;
//!
//!     let registry = HealthRegistry::new()
//!         .with("", ServingStatusProvider::new())
//!         .with("upstream", upstream);
//!
//!     let app = HealthServer::new(registry).mount(Router::new())?;
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, app).await?;
//!
//!     shutdown_tracing();
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod interceptors;
pub mod observability;
pub mod proto;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod service;
pub mod validation;

pub use error::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{ClientSettings, Config, ServiceConfig};

    pub use crate::error::{Error, Result};

    pub use crate::observability::{init_tracing, shutdown_tracing};

    pub use crate::proto::{
        HealthCheckRequest, HealthCheckResponse, ServingStatus, CHECK_PATH, SERVICE_NAME,
        SERVICE_PATH, WATCH_PATH,
    };

    pub use crate::service::{HealthService, NopHealthClient, ServingStatusProvider};

    pub use crate::registry::HealthRegistry;

    pub use crate::client::{
        Authenticator, ClientOption, HealthClient, HealthClientBuilder, HttpTransport,
        MetadataIdTokenAuthenticator, StaticTokenAuthenticator, Transport,
    };

    pub use crate::interceptors::{Interceptor, REQUEST_ID};

    pub use crate::server::{HealthServer, WatchSender, WatchStream};

    pub use crate::codec::Codec;
    pub use crate::protocol::Protocol;

    pub use crate::validation::{Validate, ValidationError};

    pub use tonic::{Code, Request, Status};
}
