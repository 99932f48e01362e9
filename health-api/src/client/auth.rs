//! Outbound authentication
//!
//! The authorization option asks an [`Authenticator`] for a [`TokenSource`]
//! bound to the client URL, mints a first token straight away and then wraps
//! the transport so every call carries `authorization: Bearer <token>`.
//!
//! The default authenticator fetches OIDC identity tokens from the GCE
//! metadata server, with the target URL as audience.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderValue, StatusCode};
use tokio::sync::Mutex;
use tonic::Status;

use super::transport::{HttpReply, Transport};
use crate::error::{Error, Result};

/// Environment variable overriding the metadata server host
pub const METADATA_HOST_ENV: &str = "GCE_METADATA_HOST";

const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
const IDENTITY_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/identity";

// Identity tokens live for one hour; refresh ahead of expiry.
const TOKEN_TTL: Duration = Duration::from_secs(55 * 60);

/// Produces bearer tokens
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// Builds a token source for an audience
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `transport` is the client's transport at the point the option is
    /// applied; implementations may use it to reach their token endpoint.
    async fn token_source(
        &self,
        audience: &str,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<dyn TokenSource>>;
}

/// Identity tokens from the GCE metadata server
#[derive(Debug, Clone)]
pub struct MetadataIdTokenAuthenticator {
    host: String,
}

impl MetadataIdTokenAuthenticator {
    /// Host from `GCE_METADATA_HOST`, else `metadata.google.internal`
    pub fn new() -> Self {
        let host = std::env::var(METADATA_HOST_ENV)
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_METADATA_HOST.to_string());
        Self::with_host(host)
    }

    pub fn with_host(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    fn identity_url(&self, audience: &str) -> Result<url::Url> {
        let base = format!("http://{}{}", self.host, IDENTITY_PATH);
        url::Url::parse_with_params(&base, &[("audience", audience), ("format", "full")])
            .map_err(|e| {
                Error::Construction(format!("invalid metadata server URL {base}: {e}"))
            })
    }
}

impl Default for MetadataIdTokenAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Authenticator for MetadataIdTokenAuthenticator {
    async fn token_source(
        &self,
        audience: &str,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<dyn TokenSource>> {
        if audience.is_empty() {
            return Err(Error::Construction(
                "an audience is required for identity tokens".to_string(),
            ));
        }
        Ok(Arc::new(MetadataIdTokenSource {
            url: self.identity_url(audience)?.to_string(),
            transport,
            cached: Mutex::new(None),
        }))
    }
}

struct CachedToken {
    value: String,
    fetched_at: Instant,
}

struct MetadataIdTokenSource {
    url: String,
    transport: Arc<dyn Transport>,
    cached: Mutex<Option<CachedToken>>,
}

impl MetadataIdTokenSource {
    async fn fetch(&self) -> Result<String> {
        let request = http::Request::get(self.url.as_str())
            .header("metadata-flavor", "Google")
            .body(Bytes::new())
            .map_err(|e| {
                Error::Construction(format!("invalid identity token request: {e}"))
            })?;

        let HttpReply { status, body, .. } = self
            .transport
            .send(request)
            .await
            .map_err(|s| Error::Transport(s.message().to_string()))?;

        if status != StatusCode::OK {
            return Err(Error::Construction(format!(
                "metadata server returned {status}: {}",
                String::from_utf8_lossy(&body).trim()
            )));
        }

        let token = String::from_utf8(body.to_vec())
            .map_err(|_| Error::Construction("identity token is not UTF-8".to_string()))?
            .trim()
            .to_string();
        if token.is_empty() {
            return Err(Error::Construction(
                "metadata server returned an empty token".to_string(),
            ));
        }
        Ok(token)
    }
}

#[async_trait]
impl TokenSource for MetadataIdTokenSource {
    async fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.fetched_at.elapsed() < TOKEN_TTL {
                return Ok(token.value.clone());
            }
        }

        tracing::debug!("Fetching identity token from metadata server");
        let value = self.fetch().await?;
        *cached = Some(CachedToken {
            value: value.clone(),
            fetched_at: Instant::now(),
        });
        Ok(value)
    }
}

/// Authenticator handing out a fixed, pre-shared token
#[derive(Clone)]
pub struct StaticTokenAuthenticator {
    token: Arc<str>,
}

impl StaticTokenAuthenticator {
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for StaticTokenAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenAuthenticator")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

struct StaticTokenSource(Arc<str>);

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<String> {
        Ok(self.0.to_string())
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn token_source(
        &self,
        _audience: &str,
        _transport: Arc<dyn Transport>,
    ) -> Result<Arc<dyn TokenSource>> {
        if self.token.is_empty() {
            return Err(Error::Construction("static token is empty".to_string()));
        }
        Ok(Arc::new(StaticTokenSource(self.token.clone())))
    }
}

/// Transport adding a bearer token to every request
pub(crate) struct AuthorizedTransport {
    inner: Arc<dyn Transport>,
    source: Arc<dyn TokenSource>,
}

impl AuthorizedTransport {
    pub(crate) fn new(inner: Arc<dyn Transport>, source: Arc<dyn TokenSource>) -> Self {
        Self { inner, source }
    }
}

#[async_trait]
impl Transport for AuthorizedTransport {
    async fn send(
        &self,
        mut request: http::Request<Bytes>,
    ) -> std::result::Result<HttpReply, Status> {
        let token = self
            .source
            .token()
            .await
            .map_err(|e| Status::unauthenticated(e.to_string()))?;
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| Status::unauthenticated("token is not a valid header value"))?;
        request.headers_mut().insert(header::AUTHORIZATION, value);
        self.inner.send(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fake metadata server answering identity requests
    struct FakeMetadata {
        status: StatusCode,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for FakeMetadata {
        async fn send(
            &self,
            request: http::Request<Bytes>,
        ) -> std::result::Result<HttpReply, Status> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(request.headers()["metadata-flavor"], "Google");
            let query = request.uri().query().unwrap_or_default().to_string();
            Ok(HttpReply {
                status: self.status,
                body: Bytes::from(format!("token-for:{query}")),
                ..Default::default()
            })
        }
    }

    fn fake(status: StatusCode) -> Arc<FakeMetadata> {
        Arc::new(FakeMetadata {
            status,
            calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_identity_url_encodes_audience() {
        let auth = MetadataIdTokenAuthenticator::with_host("169.254.169.254");
        let url = auth.identity_url("https://api.example.com/health?x=1").unwrap();
        assert_eq!(url.host_str(), Some("169.254.169.254"));
        assert_eq!(url.path(), IDENTITY_PATH);
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("audience".to_string(), "https://api.example.com/health?x=1".to_string()),
                ("format".to_string(), "full".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_token_is_cached() {
        let metadata = fake(StatusCode::OK);
        let source = MetadataIdTokenAuthenticator::with_host("metadata")
            .token_source("https://svc", metadata.clone())
            .await
            .unwrap();

        let first = source.token().await.unwrap();
        let second = source.token().await.unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("token-for:audience="));
        assert_eq!(metadata.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_metadata_error_is_construction_error() {
        let source = MetadataIdTokenAuthenticator::with_host("metadata")
            .token_source("https://svc", fake(StatusCode::NOT_FOUND))
            .await
            .unwrap();
        let err = source.token().await.unwrap_err();
        assert!(matches!(err, Error::Construction(_)));
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_empty_audience_rejected() {
        let err = MetadataIdTokenAuthenticator::with_host("metadata")
            .token_source("", fake(StatusCode::OK))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Construction(_)));
    }

    #[tokio::test]
    async fn test_authorized_transport_sets_bearer() {
        struct Inspect;

        #[async_trait]
        impl Transport for Inspect {
            async fn send(
                &self,
                request: http::Request<Bytes>,
            ) -> std::result::Result<HttpReply, Status> {
                let auth = request.headers()[header::AUTHORIZATION].to_str().unwrap().to_string();
                Ok(HttpReply {
                    body: Bytes::from(auth),
                    ..Default::default()
                })
            }
        }

        let source = StaticTokenAuthenticator::new("s3cr3t")
            .token_source("https://svc", Arc::new(Inspect))
            .await
            .unwrap();
        let transport = AuthorizedTransport::new(Arc::new(Inspect), source);
        let reply = transport
            .send(http::Request::post("http://svc/x").body(Bytes::new()).unwrap())
            .await
            .unwrap();
        assert_eq!(&reply.body[..], b"Bearer s3cr3t");
    }
}
