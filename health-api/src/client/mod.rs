//! Health check client
//!
//! ```rust,no_run
//! use health_api::prelude::*;
//!
//! # async fn example() -> health_api::Result<()> {
//! let client = HealthClient::builder("http://localhost:8080")
//!     .option(Protocol::Grpc)
//!     .option(Codec::Json)
//!     .build()
//!     .await?;
//!
//! let response = client.check(HealthCheckRequest::for_service("payments")).await?;
//! println!("{:?}", response.status());
//! # Ok(())
//! # }
//! ```
//!
//! A call passes through, from the caller inward: the tracing interceptor,
//! the logging interceptor, user interceptors in the order supplied, then
//! the transport.

mod auth;
mod call;
mod options;
mod transport;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tonic::{Request, Response, Status};
use tower::util::BoxCloneSyncService;
use tower::ServiceExt;

pub use auth::{
    Authenticator, MetadataIdTokenAuthenticator, StaticTokenAuthenticator, TokenSource,
    METADATA_HOST_ENV,
};
pub use options::{ClientConfig, ClientOption};
pub use transport::{HttpReply, HttpTransport, Transport};

use crate::codec::Codec;
use crate::config::ClientSettings;
use crate::error::Result;
use crate::interceptors::{logging_interceptor, tracing_interceptor, CheckService};
use crate::proto::{HealthCheckRequest, HealthCheckResponse};
use crate::protocol::Protocol;
use crate::service::HealthService;
use call::UnaryCaller;

/// Collects options for a [`HealthClient`]
#[derive(Debug)]
pub struct HealthClientBuilder {
    url: String,
    options: Vec<ClientOption>,
}

impl HealthClientBuilder {
    /// Append one option
    pub fn option(mut self, option: impl Into<ClientOption>) -> Self {
        self.options.push(option.into());
        self
    }

    /// Append several options, keeping their order
    pub fn options(mut self, options: impl IntoIterator<Item = ClientOption>) -> Self {
        self.options.extend(options);
        self
    }

    /// Apply options in order and assemble the call chain
    ///
    /// Only the authorization option touches the network here; a malformed
    /// URL otherwise surfaces on the first call.
    pub async fn build(self) -> Result<HealthClient> {
        let mut config = ClientConfig::new(self.url)?;
        for option in self.options {
            option.apply(&mut config).await?;
        }
        Ok(HealthClient::from_config(config))
    }
}

/// Remote `grpc.health.v1.Health` client
///
/// Immutable once built; clones share the call chain.
#[derive(Clone)]
pub struct HealthClient {
    url: Arc<str>,
    protocol: Protocol,
    codec: Codec,
    timeout: Option<Duration>,
    interceptor_names: Arc<[String]>,
    service: CheckService,
}

impl HealthClient {
    pub fn builder(url: impl Into<String>) -> HealthClientBuilder {
        HealthClientBuilder {
            url: url.into(),
            options: Vec::new(),
        }
    }

    /// Build a client from `url` and an ordered option list
    pub async fn connect(
        url: impl Into<String>,
        options: impl IntoIterator<Item = ClientOption>,
    ) -> Result<Self> {
        Self::builder(url).options(options).build().await
    }

    /// Build a client from the `[client]` configuration section
    pub async fn from_settings(settings: &ClientSettings) -> Result<Self> {
        let mut builder = Self::builder(settings.url.clone())
            .option(settings.protocol)
            .option(settings.codec);
        if let Some(ms) = settings.timeout_ms {
            builder = builder.option(Duration::from_millis(ms));
        }
        if settings.authorization {
            builder = builder.option(ClientOption::authorization());
        }
        builder.build().await
    }

    fn from_config(config: ClientConfig) -> Self {
        let url: Arc<str> = Arc::from(config.url);

        let caller = UnaryCaller {
            transport: config.transport,
            url: url.clone(),
            protocol: config.protocol,
            codec: config.codec,
            timeout: config.timeout,
        };
        let mut service: CheckService = BoxCloneSyncService::new(caller);

        // Wrap from the inside out so the first supplied interceptor is outermost
        for interceptor in config.interceptors.iter().rev() {
            service = interceptor.wrap(service);
        }
        let builtin = [tracing_interceptor(), logging_interceptor()];
        for interceptor in builtin.iter().rev() {
            service = interceptor.wrap(service);
        }

        let interceptor_names = builtin
            .iter()
            .chain(config.interceptors.iter())
            .map(|i| i.name().to_string())
            .collect();

        Self {
            url,
            protocol: config.protocol,
            codec: config.codec,
            timeout: config.timeout,
            interceptor_names,
            service,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Interceptor names, outermost first
    pub fn interceptor_names(&self) -> Vec<&str> {
        self.interceptor_names.iter().map(String::as_str).collect()
    }

    /// `Check` with request metadata, returning response metadata
    pub async fn call(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> std::result::Result<Response<HealthCheckResponse>, Status> {
        self.service.clone().oneshot(request).await
    }
}

#[async_trait]
impl HealthService for HealthClient {
    async fn check(
        &self,
        request: HealthCheckRequest,
    ) -> std::result::Result<HealthCheckResponse, Status> {
        self.call(Request::new(request)).await.map(Response::into_inner)
    }
}

impl fmt::Debug for HealthClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthClient")
            .field("url", &self.url)
            .field("protocol", &self.protocol)
            .field("codec", &self.codec)
            .field("timeout", &self.timeout)
            .field("interceptors", &self.interceptor_names)
            .finish()
    }
}
