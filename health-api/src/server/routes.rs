//! HTTP glue for the endpoint
//!
//! Handlers negotiate protocol and codec from `content-type`. gRPC and
//! gRPC-Web requests are served by `tonic::server::Grpc` over the endpoint's
//! layered services; Connect is decoded and encoded here.

use std::convert::Infallible;
use std::future::{ready, Ready};
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use http::{header, HeaderMap, HeaderValue, StatusCode};
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};
use tonic::metadata::MetadataMap;
use tonic::Status;
use tonic_prost::ProstCodec;
use tower::{Service, ServiceExt};

use super::watch::{outcomes, WatchOutcomes, WatchService};
use crate::codec::{decode_single_message, Codec, Envelope, JsonCodec};
use crate::codec::{FLAG_END_STREAM, FLAG_TRAILERS};
use crate::interceptors::CheckService;
use crate::proto::{HealthCheckRequest, HealthCheckResponse};
use crate::protocol::{
    connect_http_status, encode_web_trailers, ConnectError, EndOfStream, Negotiated, Protocol,
};

/// Largest Connect request body accepted
const MAX_REQUEST_BYTES: usize = 4 * 1024 * 1024;

/// Router state shared by both procedures
#[derive(Clone)]
pub(crate) struct Endpoint {
    pub(crate) check: CheckService,
    pub(crate) watch: WatchService,
}

/// `POST /grpc.health.v1.Health/Check`
pub(crate) async fn check(State(endpoint): State<Endpoint>, request: Request) -> Response {
    let Some(negotiated) = negotiate(request.headers(), false) else {
        return unsupported_media_type(request.headers());
    };

    let check = match endpoint.check.ready_oneshot().await {
        Ok(check) => check,
        Err(status) => return error_response(negotiated, status),
    };

    if negotiated.protocol != Protocol::Connect {
        let response = match negotiated.codec {
            Codec::Proto => {
                let mut grpc = tonic::server::Grpc::new(ProstCodec::default());
                grpc.unary(check, request).await
            }
            Codec::Json => {
                let mut grpc = tonic::server::Grpc::new(JsonCodec::default());
                grpc.unary(check, request).await
            }
        };
        return grpc_response(negotiated, response);
    }

    let request = match connect_request(negotiated, request).await {
        Ok(request) => request,
        Err(status) => return error_response(negotiated, status),
    };
    match check.oneshot(request).await {
        Ok(response) => connect_unary_response(negotiated, response),
        Err(status) => error_response(negotiated, status),
    }
}

/// `POST /grpc.health.v1.Health/Watch`
pub(crate) async fn watch(State(endpoint): State<Endpoint>, request: Request) -> Response {
    let Some(negotiated) = negotiate(request.headers(), true) else {
        return unsupported_media_type(request.headers());
    };

    if negotiated.protocol != Protocol::Connect {
        let streaming = WatchStreaming(endpoint.watch);
        let response = match negotiated.codec {
            Codec::Proto => {
                let mut grpc = tonic::server::Grpc::new(ProstCodec::default());
                grpc.server_streaming(streaming, request).await
            }
            Codec::Json => {
                let mut grpc = tonic::server::Grpc::new(JsonCodec::default());
                grpc.server_streaming(streaming, request).await
            }
        };
        return grpc_response(negotiated, response);
    }

    let request = match connect_request(negotiated, request).await {
        Ok(request) => request,
        Err(status) => return error_response(negotiated, status),
    };
    let frames = connect_watch_frames(negotiated, outcomes(endpoint.watch, request));
    respond(
        StatusCode::OK,
        response_headers(negotiated, HeaderMap::new()),
        Body::new(StreamBody::new(frames)),
    )
}

/// Connect distinguishes unary from streaming content types; the gRPC
/// dialects use one content type for both.
fn negotiate(headers: &HeaderMap, streaming_procedure: bool) -> Option<Negotiated> {
    let content_type = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    let negotiated = Negotiated::from_content_type(content_type)?;
    if negotiated.protocol == Protocol::Connect && negotiated.streaming != streaming_procedure {
        return None;
    }
    Some(negotiated)
}

fn unsupported_media_type(headers: &HeaderMap) -> Response {
    tracing::debug!(
        content_type = ?headers.get(header::CONTENT_TYPE),
        "Unsupported content type for health endpoint"
    );
    StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response()
}

/// `Watch` as tonic's server-streaming service
#[derive(Clone)]
struct WatchStreaming(WatchService);

impl Service<tonic::Request<HealthCheckRequest>> for WatchStreaming {
    type Response = tonic::Response<WatchOutcomes>;
    type Error = Status;
    type Future = Ready<Result<Self::Response, Status>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Status>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: tonic::Request<HealthCheckRequest>) -> Self::Future {
        ready(Ok(tonic::Response::new(outcomes(self.0.clone(), request))))
    }
}

/// Adapt tonic's response to the negotiated dialect
///
/// gRPC-Web carries the trailers as a final body frame.
fn grpc_response(
    negotiated: Negotiated,
    response: http::Response<tonic::body::Body>,
) -> Response {
    let (mut parts, body) = response.into_parts();
    parts.headers = response_headers(negotiated, parts.headers);

    let body = match negotiated.protocol {
        Protocol::GrpcWeb => Body::new(body.map_frame(|frame| match frame.into_trailers() {
            Ok(trailers) => Frame::data(web_trailers_frame(&trailers)),
            Err(frame) => frame,
        })),
        _ => Body::new(body),
    };
    Response::from_parts(parts, body)
}

async fn connect_request(
    negotiated: Negotiated,
    request: Request,
) -> Result<tonic::Request<HealthCheckRequest>, Status> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_REQUEST_BYTES)
        .await
        .map_err(|e| Status::invalid_argument(format!("failed to read request body: {e}")))?;

    let payload = if negotiated.protocol.is_enveloped(negotiated.streaming) {
        decode_single_message(body)?
    } else {
        body
    };
    let message = negotiated.codec.decode::<HealthCheckRequest>(&payload)?;

    let mut request = tonic::Request::new(message);
    *request.metadata_mut() = MetadataMap::from_headers(parts.headers);
    Ok(request)
}

fn respond(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn response_headers(negotiated: Negotiated, mut headers: HeaderMap) -> HeaderMap {
    if let Ok(value) = HeaderValue::from_str(&negotiated.content_type()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers
}

fn connect_unary_response(
    negotiated: Negotiated,
    response: tonic::Response<HealthCheckResponse>,
) -> Response {
    let (metadata, message, _) = response.into_parts();
    match negotiated.codec.encode(&message) {
        Ok(payload) => respond(
            StatusCode::OK,
            response_headers(negotiated, metadata.into_headers()),
            Body::from(payload),
        ),
        Err(status) => error_response(negotiated, status),
    }
}

/// Failure before any message was written
fn error_response(negotiated: Negotiated, status: Status) -> Response {
    match negotiated.protocol {
        Protocol::Connect if !negotiated.streaming => {
            let mut headers = status.metadata().clone().into_headers();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            let body = serde_json::to_vec(&ConnectError::from(&status)).unwrap_or_default();
            respond(connect_http_status(status.code()), headers, Body::from(body))
        }
        Protocol::Connect => respond(
            StatusCode::OK,
            response_headers(negotiated, status.metadata().clone().into_headers()),
            Body::from(end_stream_frame(Some(&status))),
        ),
        // Trailers-only
        Protocol::Grpc | Protocol::GrpcWeb => grpc_response(negotiated, status.into_http()),
    }
}

// Control frames are a few bytes long and always fit an envelope.
fn control_envelope(flags: u8, data: Bytes) -> Bytes {
    Envelope::new(flags, data).encode().unwrap_or_default()
}

fn end_stream_frame(error: Option<&Status>) -> Bytes {
    let end = EndOfStream {
        error: error.map(ConnectError::from),
    };
    let json = serde_json::to_vec(&end)
        .map(Bytes::from)
        .unwrap_or_else(|_| Bytes::from_static(br#"{"error":{"code":"internal"}}"#));
    control_envelope(FLAG_END_STREAM, json)
}

fn web_trailers_frame(trailers: &HeaderMap) -> Bytes {
    control_envelope(FLAG_TRAILERS, encode_web_trailers(trailers))
}

/// Connect body frames for a watch: each message, then the end-of-stream
/// frame once the handler has returned
fn connect_watch_frames(
    negotiated: Negotiated,
    outcomes: WatchOutcomes,
) -> impl Stream<Item = Result<Frame<Bytes>, Infallible>> + Send {
    stream::unfold(Some(outcomes), move |state| async move {
        let Some(mut outcomes) = state else {
            return None;
        };
        let frame = match outcomes.next().await {
            Some(Ok(message)) => match message_frame(negotiated.codec, &message) {
                Ok(frame) => return Some((Ok::<_, Infallible>(frame), Some(outcomes))),
                Err(status) => end_stream_frame(Some(&status)),
            },
            Some(Err(status)) => end_stream_frame(Some(&status)),
            None => end_stream_frame(None),
        };
        Some((Ok(Frame::data(frame)), None))
    })
}

fn message_frame(codec: Codec, message: &HealthCheckResponse) -> Result<Frame<Bytes>, Status> {
    let payload = codec.encode(message)?;
    Ok(Frame::data(Envelope::message(payload).encode()?))
}
