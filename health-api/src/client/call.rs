//! Sending a unary call and decoding the reply
//!
//! [`UnaryCaller`] is the innermost service of every client chain. Native
//! gRPC and gRPC-Web go through `tonic::client::Grpc` over a [`WireService`]
//! that hands each HTTP request to the configured [`Transport`]. Connect has
//! no tonic counterpart and is encoded here directly.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::uri::PathAndQuery;
use http::{header, HeaderMap, HeaderValue, StatusCode, Uri, Version};
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};
use tonic_prost::ProstCodec;
use tower::Service;

use super::transport::{HttpReply, Transport};
use crate::codec::{decode_envelopes, Codec, JsonCodec};
use crate::proto::{HealthCheckRequest, HealthCheckResponse, CHECK_PATH};
use crate::protocol::{
    code_from_http_status, decode_web_trailers, ConnectError, Protocol,
    CONNECT_PROTOCOL_VERSION, CONNECT_TIMEOUT, GRPC_WEB,
};

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, Status>> + Send>>;

/// Terminal service sending `Check` over the transport
#[derive(Clone)]
pub(crate) struct UnaryCaller {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) url: Arc<str>,
    pub(crate) protocol: Protocol,
    pub(crate) codec: Codec,
    pub(crate) timeout: Option<Duration>,
}

impl Service<Request<HealthCheckRequest>> for UnaryCaller {
    type Response = Response<HealthCheckResponse>;
    type Error = Status;
    type Future = BoxFuture<Self::Response>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<HealthCheckRequest>) -> Self::Future {
        let caller = self.clone();
        Box::pin(async move {
            match caller.timeout {
                Some(timeout) => tokio::time::timeout(timeout, caller.unary(request))
                    .await
                    .map_err(|_| {
                        Status::deadline_exceeded(format!(
                            "call exceeded {} ms deadline",
                            timeout.as_millis()
                        ))
                    })?,
                None => caller.unary(request).await,
            }
        })
    }
}

impl UnaryCaller {
    async fn unary(
        self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        match self.protocol {
            Protocol::Connect => self.connect_unary(request).await,
            Protocol::Grpc | Protocol::GrpcWeb => self.grpc_unary(request).await,
        }
    }

    async fn grpc_unary(
        &self,
        mut request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        if let Some(timeout) = self.timeout {
            request.set_timeout(timeout);
        }

        let wire = WireService {
            transport: self.transport.clone(),
            protocol: self.protocol,
            codec: self.codec,
        };
        let mut grpc = tonic::client::Grpc::with_origin(wire, self.origin()?);
        grpc.ready().await?;

        let path = PathAndQuery::from_static(CHECK_PATH);
        match self.codec {
            Codec::Proto => {
                let codec = ProstCodec::<HealthCheckRequest, HealthCheckResponse>::default();
                grpc.unary(request, path, codec).await
            }
            Codec::Json => {
                let codec = JsonCodec::<HealthCheckRequest, HealthCheckResponse>::default();
                grpc.unary(request, path, codec).await
            }
        }
    }

    /// Base URL as a tonic origin; scheme and host are required
    fn origin(&self) -> Result<Uri, Status> {
        let origin: Uri = self
            .url
            .trim_end_matches('/')
            .parse()
            .map_err(|e| Status::invalid_argument(format!("invalid URL {}: {e}", self.url)))?;
        if origin.scheme().is_none() || origin.authority().is_none() {
            return Err(Status::invalid_argument(format!(
                "URL {} needs a scheme and a host",
                self.url
            )));
        }
        Ok(origin)
    }

    async fn connect_unary(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let http_request = self.connect_request(request)?;
        let reply = self.transport.send(http_request).await?;
        let (headers, message) = decode_connect_reply(self.codec, reply)?;
        let mut response = Response::new(message);
        *response.metadata_mut() = MetadataMap::from_headers(headers);
        Ok(response)
    }

    fn connect_request(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<http::Request<Bytes>, Status> {
        let mut headers = request.metadata().clone().into_headers();
        let body = self.codec.encode(request.get_ref())?;

        headers.insert(header::CONTENT_TYPE, content_type(self.protocol, self.codec)?);
        headers.insert(CONNECT_PROTOCOL_VERSION, HeaderValue::from_static("1"));
        if let Some(timeout) = self.timeout {
            let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            headers.insert(CONNECT_TIMEOUT, HeaderValue::from(millis));
        }

        let target = format!("{}{}", self.url.trim_end_matches('/'), CHECK_PATH);
        let mut builder = http::Request::post(target.as_str()).version(Version::HTTP_11);
        if let Some(h) = builder.headers_mut() {
            h.extend(headers);
        }
        builder
            .body(body)
            .map_err(|e| Status::invalid_argument(format!("invalid target URL {target}: {e}")))
    }
}

fn content_type(protocol: Protocol, codec: Codec) -> Result<HeaderValue, Status> {
    HeaderValue::from_str(&protocol.content_type(codec, false))
        .map_err(|_| Status::internal("invalid content type"))
}

/// Map a buffered Connect unary reply to headers and the response message
pub(crate) fn decode_connect_reply(
    codec: Codec,
    reply: HttpReply,
) -> Result<(HeaderMap, HealthCheckResponse), Status> {
    if reply.status != StatusCode::OK {
        return Err(connect_error(&reply));
    }
    let message = codec.decode(&reply.body)?;
    Ok((reply.headers, message))
}

fn connect_error(reply: &HttpReply) -> Status {
    match serde_json::from_slice::<ConnectError>(&reply.body) {
        Ok(err) => err.into_status(),
        Err(_) => Status::new(
            code_from_http_status(reply.status),
            format!("unexpected HTTP status {}", reply.status),
        ),
    }
}

/// Bridges `tonic::client::Grpc` onto a [`Transport`]
///
/// Fixes the content type for the configured codec. For gRPC-Web it also
/// downgrades to HTTP/1.1 and lifts the trailer frame out of the body.
#[derive(Clone)]
struct WireService {
    transport: Arc<dyn Transport>,
    protocol: Protocol,
    codec: Codec,
}

impl Service<http::Request<tonic::body::Body>> for WireService {
    type Response = http::Response<tonic::body::Body>;
    type Error = Status;
    type Future = BoxFuture<Self::Response>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<tonic::body::Body>) -> Self::Future {
        let wire = self.clone();
        Box::pin(async move { wire.exchange(request).await })
    }
}

impl WireService {
    async fn exchange(
        self,
        request: http::Request<tonic::body::Body>,
    ) -> Result<http::Response<tonic::body::Body>, Status> {
        let (mut parts, body) = request.into_parts();
        let body = body.collect().await?.to_bytes();

        parts
            .headers
            .insert(header::CONTENT_TYPE, content_type(self.protocol, self.codec)?);
        if self.protocol == Protocol::GrpcWeb {
            parts.headers.remove(header::TE);
            parts.headers.insert(GRPC_WEB, HeaderValue::from_static("1"));
            parts.version = Version::HTTP_11;
        }

        let reply = self
            .transport
            .send(http::Request::from_parts(parts, body))
            .await?;

        let (body, trailers) = match self.protocol {
            Protocol::GrpcWeb => split_web_trailers(reply.body, reply.trailers)?,
            _ => (reply.body, reply.trailers),
        };

        let mut frames = vec![Ok::<_, Status>(Frame::data(body))];
        if !trailers.is_empty() {
            frames.push(Ok(Frame::trailers(trailers)));
        }
        let body = StreamBody::new(futures::stream::iter(frames));

        let mut response = http::Response::new(tonic::body::Body::new(body));
        *response.status_mut() = reply.status;
        *response.headers_mut() = reply.headers;
        Ok(response)
    }
}

/// Separate gRPC-Web message envelopes from the trailer envelope
fn split_web_trailers(
    body: Bytes,
    mut trailers: HeaderMap,
) -> Result<(Bytes, HeaderMap), Status> {
    let mut messages = BytesMut::with_capacity(body.len());
    for envelope in decode_envelopes(body)? {
        if envelope.is_trailers() {
            trailers.extend(decode_web_trailers(&envelope.data)?);
        } else {
            messages.extend_from_slice(&envelope.encode()?);
        }
    }
    Ok((messages.freeze(), trailers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Envelope, FLAG_TRAILERS};
    use crate::proto::ServingStatus;
    use crate::protocol::encode_web_trailers;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tonic::Code;

    /// Answers every request with a fixed reply and keeps the last request
    struct CannedTransport {
        reply: HttpReply,
        seen: Mutex<Option<http::Request<Bytes>>>,
    }

    impl CannedTransport {
        fn new(reply: HttpReply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                seen: Mutex::new(None),
            })
        }

        fn seen(&self) -> http::Request<Bytes> {
            self.seen.lock().unwrap().take().expect("no request was sent")
        }
    }

    #[async_trait]
    impl Transport for CannedTransport {
        async fn send(
            &self,
            request: http::Request<Bytes>,
        ) -> std::result::Result<HttpReply, Status> {
            *self.seen.lock().unwrap() = Some(request);
            Ok(self.reply.clone())
        }
    }

    fn caller(
        transport: Arc<CannedTransport>,
        protocol: Protocol,
        codec: Codec,
    ) -> UnaryCaller {
        UnaryCaller {
            transport,
            url: Arc::from("http://localhost:8080/"),
            protocol,
            codec,
            timeout: Some(Duration::from_secs(2)),
        }
    }

    fn enveloped(parts: &[Envelope]) -> Bytes {
        let mut buf = BytesMut::new();
        for p in parts {
            buf.extend_from_slice(&p.encode().unwrap());
        }
        buf.freeze()
    }

    fn serving(codec: Codec) -> Bytes {
        codec
            .encode(&HealthCheckResponse::with_status(ServingStatus::Serving))
            .unwrap()
    }

    fn status_trailers(status: Status) -> HeaderMap {
        let mut headers = HeaderMap::new();
        status.add_header(&mut headers).unwrap();
        headers
    }

    async fn check(caller: UnaryCaller, service: &str) -> Result<HealthCheckResponse, Status> {
        let mut caller = caller;
        caller
            .call(Request::new(HealthCheckRequest::for_service(service)))
            .await
            .map(Response::into_inner)
    }

    #[test]
    fn test_encode_connect_request() {
        let transport = CannedTransport::new(HttpReply::default());
        let caller = caller(transport, Protocol::Connect, Codec::Json);
        let req = caller
            .connect_request(Request::new(HealthCheckRequest::for_service("db")))
            .unwrap();
        assert_eq!(req.uri(), "http://localhost:8080/grpc.health.v1.Health/Check");
        assert_eq!(req.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(req.headers()[CONNECT_TIMEOUT], "2000");
        assert_eq!(&req.body()[..], br#"{"service":"db"}"#);
    }

    #[test]
    fn test_decode_connect_error_body() {
        let reply = HttpReply {
            status: StatusCode::NOT_FOUND,
            body: Bytes::from_static(br#"{"code":"not_found","message":"no payments"}"#),
            ..Default::default()
        };
        let err = decode_connect_reply(Codec::Json, reply).unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(err.message(), "no payments");
    }

    #[test]
    fn test_decode_connect_error_without_body_uses_http_status() {
        let reply = HttpReply {
            status: StatusCode::SERVICE_UNAVAILABLE,
            ..Default::default()
        };
        let err = decode_connect_reply(Codec::Proto, reply).unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn test_grpc_json_message_and_trailers() {
        let transport = CannedTransport::new(HttpReply {
            status: StatusCode::OK,
            body: enveloped(&[Envelope::message(serving(Codec::Json))]),
            trailers: status_trailers(Status::new(Code::Ok, "")),
            ..Default::default()
        });
        let reply = check(caller(transport.clone(), Protocol::Grpc, Codec::Json), "db")
            .await
            .unwrap();
        assert_eq!(reply.status(), ServingStatus::Serving);

        let sent = transport.seen();
        assert_eq!(sent.uri(), "http://localhost:8080/grpc.health.v1.Health/Check");
        assert_eq!(sent.version(), Version::HTTP_2);
        assert_eq!(sent.headers()[header::CONTENT_TYPE], "application/grpc+json");
        assert_eq!(sent.headers()[header::TE], "trailers");
        assert_eq!(sent.headers()["grpc-timeout"], "2000000u");

        let envelopes = decode_envelopes(sent.into_body()).unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(&envelopes[0].data[..], br#"{"service":"db"}"#);
    }

    #[tokio::test]
    async fn test_grpc_trailers_only_error() {
        let transport = CannedTransport::new(HttpReply {
            status: StatusCode::OK,
            headers: status_trailers(Status::not_found("gone")),
            ..Default::default()
        });
        let err = check(caller(transport, Protocol::Grpc, Codec::Proto), "ghost")
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(err.message(), "gone");
    }

    #[tokio::test]
    async fn test_grpc_web_trailer_frame() {
        let trailers = encode_web_trailers(&status_trailers(Status::new(Code::Ok, "")));
        let transport = CannedTransport::new(HttpReply {
            status: StatusCode::OK,
            body: enveloped(&[
                Envelope::message(serving(Codec::Proto)),
                Envelope::new(FLAG_TRAILERS, trailers),
            ]),
            ..Default::default()
        });
        let reply = check(caller(transport.clone(), Protocol::GrpcWeb, Codec::Proto), "")
            .await
            .unwrap();
        assert_eq!(reply.status(), ServingStatus::Serving);

        let sent = transport.seen();
        assert_eq!(sent.version(), Version::HTTP_11);
        assert_eq!(sent.headers()[header::CONTENT_TYPE], "application/grpc-web+proto");
        assert_eq!(sent.headers()[GRPC_WEB], "1");
        assert!(!sent.headers().contains_key(header::TE));
    }

    #[tokio::test]
    async fn test_grpc_web_error_trailer() {
        let trailers = encode_web_trailers(&status_trailers(Status::unavailable("draining")));
        let transport = CannedTransport::new(HttpReply {
            status: StatusCode::OK,
            body: enveloped(&[Envelope::new(FLAG_TRAILERS, trailers)]),
            ..Default::default()
        });
        let err = check(caller(transport, Protocol::GrpcWeb, Codec::Proto), "")
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
        assert_eq!(err.message(), "draining");
    }

    #[tokio::test]
    async fn test_url_without_scheme_is_invalid_argument() {
        let transport = CannedTransport::new(HttpReply::default());
        let mut caller = caller(transport, Protocol::Grpc, Codec::Proto);
        caller.url = Arc::from("localhost:8080");
        let err = check(caller, "").await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }
}
