//! Wire protocol variants
//!
//! Three dialects carry the same procedures:
//!
//! - **Connect**: plain HTTP POST. Unary bodies are bare messages, errors are
//!   JSON with an HTTP status. Streaming calls use envelopes and finish with
//!   an end-of-stream envelope.
//! - **gRPC**: enveloped messages over HTTP/2, status in trailers. Framing
//!   and status handling are tonic's.
//! - **gRPC-Web**: gRPC framing usable over HTTP/1.1, trailers encoded as a
//!   final body frame. Carried on tonic with the trailers translated at the
//!   edge.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use tonic::{Code, Status};

use crate::codec::Codec;

pub const CONNECT_PROTOCOL_VERSION: &str = "connect-protocol-version";
pub const CONNECT_TIMEOUT: &str = "connect-timeout-ms";
pub const GRPC_WEB: &str = "x-grpc-web";

/// Transport framing dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Protocol {
    /// Connect protocol (default)
    #[default]
    #[serde(rename = "connect")]
    Connect,
    /// Native gRPC over HTTP/2
    #[serde(rename = "grpc")]
    Grpc,
    /// gRPC-Web, HTTP/1.1 compatible
    #[serde(rename = "grpc+web", alias = "grpc-web")]
    GrpcWeb,
}

impl Protocol {
    pub fn name(self) -> &'static str {
        match self {
            Protocol::Connect => "connect",
            Protocol::Grpc => "grpc",
            Protocol::GrpcWeb => "grpc+web",
        }
    }

    /// Content type for a call. `streaming` only matters for Connect.
    pub fn content_type(self, codec: Codec, streaming: bool) -> String {
        match (self, streaming) {
            (Protocol::Connect, false) => format!("application/{}", codec.name()),
            (Protocol::Connect, true) => format!("application/connect+{}", codec.name()),
            (Protocol::Grpc, _) => format!("application/grpc+{}", codec.name()),
            (Protocol::GrpcWeb, _) => format!("application/grpc-web+{}", codec.name()),
        }
    }

    /// Whether messages are wrapped in envelopes
    pub fn is_enveloped(self, streaming: bool) -> bool {
        !matches!((self, streaming), (Protocol::Connect, false))
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Protocol {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connect" | "" => Ok(Protocol::Connect),
            "grpc" => Ok(Protocol::Grpc),
            "grpc+web" | "grpc-web" => Ok(Protocol::GrpcWeb),
            other => Err(crate::error::Error::InvalidOption(format!(
                "unknown protocol `{other}`"
            ))),
        }
    }
}

/// What a server learned from an inbound `content-type`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub protocol: Protocol,
    pub codec: Codec,
    /// Connect streaming framing (`application/connect+*`)
    pub streaming: bool,
}

impl Negotiated {
    /// Classify a content type. Parameters after `;` are ignored.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let sub = mime.strip_prefix("application/")?;

        let (protocol, streaming, codec) = if let Some(rest) = sub.strip_prefix("grpc-web") {
            (Protocol::GrpcWeb, true, suffix_codec(rest)?)
        } else if let Some(rest) = sub.strip_prefix("grpc") {
            (Protocol::Grpc, true, suffix_codec(rest)?)
        } else if let Some(rest) = sub.strip_prefix("connect+") {
            (Protocol::Connect, true, Codec::from_name(rest)?)
        } else {
            (Protocol::Connect, false, Codec::from_name(sub)?)
        };

        Some(Self {
            protocol,
            codec,
            streaming,
        })
    }

    /// Response content type echoing the negotiated dialect
    pub fn content_type(&self) -> String {
        self.protocol.content_type(self.codec, self.streaming)
    }
}

fn suffix_codec(rest: &str) -> Option<Codec> {
    match rest {
        "" => Some(Codec::Proto),
        _ => Codec::from_name(rest.strip_prefix('+')?),
    }
}

/// Connect's snake_case name for a status code
pub fn connect_code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "ok",
        Code::Cancelled => "canceled",
        Code::Unknown => "unknown",
        Code::InvalidArgument => "invalid_argument",
        Code::DeadlineExceeded => "deadline_exceeded",
        Code::NotFound => "not_found",
        Code::AlreadyExists => "already_exists",
        Code::PermissionDenied => "permission_denied",
        Code::ResourceExhausted => "resource_exhausted",
        Code::FailedPrecondition => "failed_precondition",
        Code::Aborted => "aborted",
        Code::OutOfRange => "out_of_range",
        Code::Unimplemented => "unimplemented",
        Code::Internal => "internal",
        Code::Unavailable => "unavailable",
        Code::DataLoss => "data_loss",
        Code::Unauthenticated => "unauthenticated",
    }
}

/// Inverse of [`connect_code_name`]
pub fn connect_code_from_name(name: &str) -> Option<Code> {
    let code = match name {
        "ok" => Code::Ok,
        "canceled" | "cancelled" => Code::Cancelled,
        "unknown" => Code::Unknown,
        "invalid_argument" => Code::InvalidArgument,
        "deadline_exceeded" => Code::DeadlineExceeded,
        "not_found" => Code::NotFound,
        "already_exists" => Code::AlreadyExists,
        "permission_denied" => Code::PermissionDenied,
        "resource_exhausted" => Code::ResourceExhausted,
        "failed_precondition" => Code::FailedPrecondition,
        "aborted" => Code::Aborted,
        "out_of_range" => Code::OutOfRange,
        "unimplemented" => Code::Unimplemented,
        "internal" => Code::Internal,
        "unavailable" => Code::Unavailable,
        "data_loss" => Code::DataLoss,
        "unauthenticated" => Code::Unauthenticated,
        _ => return None,
    };
    Some(code)
}

/// HTTP status a Connect unary error is sent with
pub fn connect_http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
            StatusCode::BAD_REQUEST
        }
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::Unknown | Code::Internal | Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Code implied by an HTTP status when the body carries none
pub fn code_from_http_status(status: StatusCode) -> Code {
    match status.as_u16() {
        400 => Code::Internal,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::Unimplemented,
        429 | 502 | 503 | 504 => Code::Unavailable,
        _ => Code::Unknown,
    }
}

/// Connect error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectError {
    pub code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl From<&Status> for ConnectError {
    fn from(status: &Status) -> Self {
        Self {
            code: connect_code_name(status.code()).to_string(),
            message: status.message().to_string(),
        }
    }
}

impl ConnectError {
    pub fn into_status(self) -> Status {
        let code = connect_code_from_name(&self.code).unwrap_or(Code::Unknown);
        Status::new(code, self.message)
    }
}

/// Connect end-of-stream message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndOfStream {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ConnectError>,
}

/// Serialize trailers as the body of a gRPC-Web trailers frame
pub fn encode_web_trailers(trailers: &HeaderMap) -> Bytes {
    let mut out = String::new();
    for (name, value) in trailers {
        if let Ok(value) = value.to_str() {
            out.push_str(name.as_str());
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
    }
    Bytes::from(out)
}

/// Parse the body of a gRPC-Web trailers frame
pub fn decode_web_trailers(data: &[u8]) -> Result<HeaderMap, Status> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Status::internal("protocol error: trailers are not UTF-8"))?;
    let mut trailers = HeaderMap::new();
    for line in text.split("\r\n").filter(|l| !l.is_empty()) {
        let (name, value) = line.split_once(':').ok_or_else(|| {
            Status::internal(format!("protocol error: invalid trailer `{line}`"))
        })?;
        let name =
            HeaderName::from_bytes(name.trim().to_ascii_lowercase().as_bytes()).map_err(|_| {
                Status::internal(format!("protocol error: invalid trailer name `{name}`"))
            })?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| Status::internal("protocol error: invalid trailer value"))?;
        trailers.append(name, value);
    }
    Ok(trailers)
}
