//! Outbound HTTP transport
//!
//! The client never talks to the network directly; it hands a fully formed
//! `http::Request` to a [`Transport`]. The default is [`HttpTransport`]
//! (reqwest). Authentication and tests swap in their own implementations.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use http_body_util::BodyExt;
use tonic::Status;

use crate::error::{Error, Result};

/// A buffered HTTP response, trailers included
#[derive(Debug, Clone, Default)]
pub struct HttpReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub trailers: HeaderMap,
}

/// Sends one HTTP request and buffers the reply
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: http::Request<Bytes>)
        -> std::result::Result<HttpReply, Status>;
}

/// reqwest-backed transport
///
/// Requests marked `HTTP/2` over plain `http://` go through a prior-knowledge
/// (h2c) client, since native gRPC cannot fall back to HTTP/1.1.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    h2c: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with default clients
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Self::from_client(client)
    }

    /// Use a caller-configured client for Connect, gRPC-Web and TLS
    ///
    /// A plain reqwest client cannot speak HTTP/2 without TLS, so native gRPC
    /// to `http://` URLs still goes through a prior-knowledge client built
    /// here.
    pub fn from_client(client: reqwest::Client) -> Result<Self> {
        let h2c = reqwest::Client::builder()
            .http2_prior_knowledge()
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP/2 client: {e}")))?;
        Ok(Self::with_clients(client, h2c))
    }

    /// Supply both clients; `h2c` must speak HTTP/2 with prior knowledge
    pub fn with_clients(client: reqwest::Client, h2c: reqwest::Client) -> Self {
        Self { client, h2c }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: http::Request<Bytes>,
    ) -> std::result::Result<HttpReply, Status> {
        let (parts, body) = request.into_parts();

        let cleartext_h2 =
            parts.version == Version::HTTP_2 && parts.uri.scheme_str() == Some("http");
        let client = if cleartext_h2 { &self.h2c } else { &self.client };

        let response = client
            .request(parts.method, parts.uri.to_string())
            .version(parts.version)
            .headers(parts.headers)
            .body(body)
            .send()
            .await
            .map_err(status_from_reqwest)?;

        let status = response.status();
        let headers = response.headers().clone();

        let collected = http::Response::<reqwest::Body>::from(response)
            .into_body()
            .collect()
            .await
            .map_err(status_from_reqwest)?;
        let trailers = collected.trailers().cloned().unwrap_or_default();
        let body = collected.to_bytes();

        Ok(HttpReply {
            status,
            headers,
            body,
            trailers,
        })
    }
}

/// Map a reqwest failure onto the closest status code
pub(crate) fn status_from_reqwest(err: reqwest::Error) -> Status {
    if err.is_timeout() {
        Status::deadline_exceeded(err.to_string())
    } else if err.is_builder() {
        Status::invalid_argument(err.to_string())
    } else if err.is_connect() || err.is_request() {
        Status::unavailable(err.to_string())
    } else {
        Status::unknown(err.to_string())
    }
}
