//! Client construction options
//!
//! Options are plain values applied to a [`ClientConfig`] one after another,
//! so a later option overrides an earlier one touching the same setting.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::auth::{Authenticator, AuthorizedTransport, MetadataIdTokenAuthenticator};
use super::transport::{HttpTransport, Transport};
use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::interceptors::Interceptor;
use crate::protocol::Protocol;

/// Builder state consumed by
/// [`HealthClientBuilder::build`](super::HealthClientBuilder::build)
#[derive(Clone)]
pub struct ClientConfig {
    pub url: String,
    pub transport: Arc<dyn Transport>,
    pub protocol: Protocol,
    pub codec: Codec,
    /// User interceptors, outermost first
    pub interceptors: Vec<Interceptor>,
    pub timeout: Option<Duration>,
}

impl ClientConfig {
    /// Defaults: Connect, binary protobuf, reqwest transport, no deadline
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            url: url.into(),
            transport: Arc::new(HttpTransport::new()?),
            protocol: Protocol::default(),
            codec: Codec::default(),
            interceptors: Vec::new(),
            timeout: None,
        })
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("protocol", &self.protocol)
            .field("codec", &self.codec)
            .field("interceptors", &self.interceptors)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// A single client option
#[derive(Clone)]
pub enum ClientOption {
    Protocol(Protocol),
    Codec(Codec),
    /// Replace the HTTP transport
    Transport(Arc<dyn Transport>),
    /// Attach bearer tokens for the client URL
    Authorization(Arc<dyn Authenticator>),
    /// Append a user interceptor
    Interceptor(Interceptor),
    /// Per-call deadline
    Timeout(Duration),
}

impl ClientOption {
    /// Identity tokens from the GCE metadata server
    pub fn authorization() -> Self {
        Self::Authorization(Arc::new(MetadataIdTokenAuthenticator::new()))
    }

    pub fn authenticator(authenticator: impl Authenticator + 'static) -> Self {
        Self::Authorization(Arc::new(authenticator))
    }

    /// Protocol by name: `connect`, `grpc`, `grpc+web` or `grpc-web`
    pub fn protocol(name: &str) -> Result<Self> {
        name.parse().map(Self::Protocol)
    }

    pub fn transport(transport: impl Transport + 'static) -> Self {
        Self::Transport(Arc::new(transport))
    }

    /// Use a caller-configured reqwest client
    ///
    /// Native gRPC over `http://` keeps using a prior-knowledge HTTP/2 client
    /// of its own.
    pub fn http_client(client: reqwest::Client) -> Result<Self> {
        HttpTransport::from_client(client).map(Self::transport)
    }

    pub fn interceptor(interceptor: Interceptor) -> Self {
        Self::Interceptor(interceptor)
    }

    pub(crate) async fn apply(self, config: &mut ClientConfig) -> Result<()> {
        match self {
            ClientOption::Protocol(protocol) => config.protocol = protocol,
            ClientOption::Codec(codec) => config.codec = codec,
            ClientOption::Transport(transport) => config.transport = transport,
            ClientOption::Interceptor(interceptor) => config.interceptors.push(interceptor),
            ClientOption::Timeout(timeout) => config.timeout = Some(timeout),
            ClientOption::Authorization(authenticator) => {
                let source = authenticator
                    .token_source(&config.url, config.transport.clone())
                    .await
                    .map_err(construction)?;
                // Fail construction rather than the first call
                source.token().await.map_err(construction)?;
                config.transport =
                    Arc::new(AuthorizedTransport::new(config.transport.clone(), source));
                tracing::debug!(
                    audience = %config.url,
                    "Authorization enabled for health client"
                );
            }
        }
        Ok(())
    }
}

fn construction(err: Error) -> Error {
    match err {
        err @ Error::Construction(_) => err,
        other => Error::Construction(format!("failed to set up authorization: {other}")),
    }
}

impl fmt::Debug for ClientOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientOption::Protocol(p) => f.debug_tuple("Protocol").field(p).finish(),
            ClientOption::Codec(c) => f.debug_tuple("Codec").field(c).finish(),
            ClientOption::Transport(_) => f.write_str("Transport(..)"),
            ClientOption::Authorization(_) => f.write_str("Authorization(..)"),
            ClientOption::Interceptor(i) => {
                f.debug_tuple("Interceptor").field(&i.name()).finish()
            }
            ClientOption::Timeout(t) => f.debug_tuple("Timeout").field(t).finish(),
        }
    }
}

impl From<Protocol> for ClientOption {
    fn from(protocol: Protocol) -> Self {
        Self::Protocol(protocol)
    }
}

impl From<Codec> for ClientOption {
    fn from(codec: Codec) -> Self {
        Self::Codec(codec)
    }
}

impl From<Interceptor> for ClientOption {
    fn from(interceptor: Interceptor) -> Self {
        Self::Interceptor(interceptor)
    }
}

impl From<Duration> for ClientOption {
    fn from(timeout: Duration) -> Self {
        Self::Timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::auth::{StaticTokenAuthenticator, TokenSource};
    use async_trait::async_trait;

    #[tokio::test]
    async fn test_later_option_wins() {
        let mut config = ClientConfig::new("http://localhost:8080").unwrap();
        for option in [
            ClientOption::Codec(Codec::Json),
            ClientOption::Codec(Codec::Proto),
        ] {
            option.apply(&mut config).await.unwrap();
        }
        assert_eq!(config.codec, Codec::Proto);

        for option in [
            ClientOption::Codec(Codec::Proto),
            ClientOption::Codec(Codec::Json),
        ] {
            option.apply(&mut config).await.unwrap();
        }
        assert_eq!(config.codec, Codec::Json);
    }

    #[test]
    fn test_named_protocols() {
        assert!(matches!(
            ClientOption::protocol("grpc-web").unwrap(),
            ClientOption::Protocol(Protocol::GrpcWeb)
        ));
        assert!(matches!(
            ClientOption::protocol("grpc").unwrap(),
            ClientOption::Protocol(Protocol::Grpc)
        ));
        assert!(matches!(
            ClientOption::protocol("carrier-pigeon"),
            Err(Error::InvalidOption(_))
        ));
    }

    struct BrokenAuthenticator;

    #[async_trait]
    impl Authenticator for BrokenAuthenticator {
        async fn token_source(
            &self,
            _audience: &str,
            _transport: Arc<dyn Transport>,
        ) -> Result<Arc<dyn TokenSource>> {
            Err(Error::Transport("metadata server unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_authorization_failure_is_construction_error() {
        let mut config = ClientConfig::new("http://localhost:8080").unwrap();
        let err = ClientOption::authenticator(BrokenAuthenticator)
            .apply(&mut config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Construction(_)));
        assert!(err.to_string().contains("metadata server unreachable"));
    }

    #[tokio::test]
    async fn test_empty_static_token_fails_construction() {
        let mut config = ClientConfig::new("http://localhost:8080").unwrap();
        let err = ClientOption::authenticator(StaticTokenAuthenticator::new(""))
            .apply(&mut config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Construction(_)));
    }

    #[tokio::test]
    async fn test_interceptors_keep_supplied_order() {
        let mut config = ClientConfig::new("http://localhost:8080").unwrap();
        for name in ["first", "second"] {
            ClientOption::interceptor(Interceptor::from_fn(name, Ok))
                .apply(&mut config)
                .await
                .unwrap();
        }
        let names: Vec<&str> = config.interceptors.iter().map(Interceptor::name).collect();
        assert_eq!(names, vec!["first", "second"]);
    }
}
