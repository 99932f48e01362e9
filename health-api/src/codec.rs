//! Message codecs and envelope framing
//!
//! A [`Codec`] names the serialization a call uses. gRPC and gRPC-Web calls
//! hand it to tonic as [`tonic_prost::ProstCodec`] or [`JsonCodec`];
//! Connect calls encode through [`Codec::encode`] and [`Codec::decode`].
//!
//! Connect streaming and the gRPC-Web trailers frame use the same five-byte
//! envelope as gRPC: one flag byte followed by a big-endian `u32` length.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tonic::codec::{DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

/// Envelope flag: payload is compressed
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Envelope flag: Connect end-of-stream message
pub const FLAG_END_STREAM: u8 = 0b0000_0010;

/// Envelope flag: gRPC-Web trailers frame
pub const FLAG_TRAILERS: u8 = 0b1000_0000;

const HEADER_LEN: usize = 5;

/// Message serialization format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Binary protobuf
    #[default]
    #[serde(alias = "binary")]
    Proto,
    /// proto3 JSON mapping
    Json,
}

impl Codec {
    /// Codec name as it appears in content types
    pub fn name(self) -> &'static str {
        match self {
            Codec::Proto => "proto",
            Codec::Json => "json",
        }
    }

    /// Parse a content-type suffix
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "proto" | "binary" => Some(Codec::Proto),
            "json" => Some(Codec::Json),
            _ => None,
        }
    }

    /// Serialize a message
    pub fn encode<M>(self, message: &M) -> Result<Bytes, Status>
    where
        M: prost::Message + Serialize,
    {
        match self {
            Codec::Proto => Ok(Bytes::from(message.encode_to_vec())),
            Codec::Json => serde_json::to_vec(message)
                .map(Bytes::from)
                .map_err(|e| Status::internal(format!("failed to marshal JSON: {e}"))),
        }
    }

    /// Deserialize a message
    ///
    /// An empty protobuf buffer is the default message; an empty JSON
    /// buffer is not a JSON document and is rejected.
    pub fn decode<M>(self, buf: &[u8]) -> Result<M, Status>
    where
        M: prost::Message + Default + DeserializeOwned,
    {
        match self {
            Codec::Proto => M::decode(buf).map_err(|e| {
                Status::invalid_argument(format!("failed to unmarshal protobuf: {e}"))
            }),
            Codec::Json => json_from_slice(buf),
        }
    }
}

fn json_from_slice<M: DeserializeOwned>(buf: &[u8]) -> Result<M, Status> {
    if buf.is_empty() {
        return Err(Status::invalid_argument("failed to unmarshal JSON: empty message"));
    }
    serde_json::from_slice(buf)
        .map_err(|e| Status::invalid_argument(format!("failed to unmarshal JSON: {e}")))
}

/// proto3 JSON codec for tonic
///
/// `T` is the message this side sends, `U` the one it receives.
#[derive(Debug)]
pub struct JsonCodec<T, U> {
    _marker: PhantomData<(T, U)>,
}

impl<T, U> Default for JsonCodec<T, U> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T, U> tonic::codec::Codec for JsonCodec<T, U>
where
    T: Serialize + Send + 'static,
    U: DeserializeOwned + Send + 'static,
{
    type Encode = T;
    type Decode = U;
    type Encoder = JsonEncoder<T>;
    type Decoder = JsonDecoder<U>;

    fn encoder(&mut self) -> Self::Encoder {
        JsonEncoder(PhantomData)
    }

    fn decoder(&mut self) -> Self::Decoder {
        JsonDecoder(PhantomData)
    }
}

#[derive(Debug)]
pub struct JsonEncoder<T>(PhantomData<T>);

impl<T: Serialize> Encoder for JsonEncoder<T> {
    type Item = T;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        serde_json::to_writer(dst.writer(), &item)
            .map_err(|e| Status::internal(format!("failed to marshal JSON: {e}")))
    }
}

#[derive(Debug)]
pub struct JsonDecoder<U>(PhantomData<U>);

impl<U: DeserializeOwned> Decoder for JsonDecoder<U> {
    type Item = U;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let buf = src.copy_to_bytes(src.remaining());
        json_from_slice(&buf).map(Some)
    }
}

/// One framed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub flags: u8,
    pub data: Bytes,
}

impl Envelope {
    /// Frame `data` with `flags`
    pub fn new(flags: u8, data: impl Into<Bytes>) -> Self {
        Self {
            flags,
            data: data.into(),
        }
    }

    /// Plain message frame
    pub fn message(data: impl Into<Bytes>) -> Self {
        Self::new(0, data)
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }

    pub fn is_trailers(&self) -> bool {
        self.flags & FLAG_TRAILERS != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// Wire form: flags, big-endian length, payload
    pub fn encode(&self) -> Result<Bytes, Status> {
        let len = u32::try_from(self.data.len())
            .map_err(|_| Status::resource_exhausted("message exceeds 4 GiB envelope limit"))?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.data.len());
        buf.put_u8(self.flags);
        buf.put_u32(len);
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }
}

/// Split a buffered body into envelopes
pub fn decode_envelopes(mut buf: Bytes) -> Result<Vec<Envelope>, Status> {
    let mut envelopes = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < HEADER_LEN {
            return Err(Status::invalid_argument(format!(
                "protocol error: incomplete envelope header ({} bytes)",
                buf.remaining()
            )));
        }
        let flags = buf.get_u8();
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(Status::invalid_argument(format!(
                "protocol error: promised {len} bytes in enveloped message, got {} bytes",
                buf.remaining()
            )));
        }
        envelopes.push(Envelope {
            flags,
            data: buf.split_to(len),
        });
    }
    Ok(envelopes)
}

/// Decode exactly one uncompressed message envelope
pub fn decode_single_message(buf: Bytes) -> Result<Bytes, Status> {
    let mut envelopes = decode_envelopes(buf)?.into_iter();
    let envelope = envelopes
        .next()
        .ok_or_else(|| Status::invalid_argument("protocol error: missing request message"))?;
    if envelopes.next().is_some() {
        return Err(Status::invalid_argument(
            "protocol error: unary request has multiple messages",
        ));
    }
    if envelope.is_compressed() {
        return Err(Status::unimplemented(
            "compressed messages are not supported",
        ));
    }
    Ok(envelope.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{HealthCheckRequest, HealthCheckResponse, ServingStatus};

    #[test]
    fn test_codec_names() {
        assert_eq!(Codec::default(), Codec::Proto);
        assert_eq!(Codec::from_name("json"), Some(Codec::Json));
        assert_eq!(Codec::from_name("binary"), Some(Codec::Proto));
        assert_eq!(Codec::from_name("xml"), None);
    }

    #[test]
    fn test_json_codec_matches_proto3_mapping() {
        let bytes = Codec::Json
            .encode(&HealthCheckResponse::with_status(ServingStatus::Serving))
            .unwrap();
        assert_eq!(&bytes[..], br#"{"status":"SERVING"}"#);

        let req: HealthCheckRequest = Codec::Json
            .decode(br#"{"service":"payments"}"#)
            .unwrap();
        assert_eq!(req.service, "payments");
    }

    #[test]
    fn test_empty_buffer_is_default_only_for_proto() {
        let req: HealthCheckRequest = Codec::Proto.decode(b"").unwrap();
        assert_eq!(req, HealthCheckRequest::default());

        let err = Codec::Json.decode::<HealthCheckRequest>(b"").unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        // An empty JSON object is still the default message
        let req: HealthCheckRequest = Codec::Json.decode(b"{}").unwrap();
        assert_eq!(req, HealthCheckRequest::default());
    }

    #[test]
    fn test_malformed_payload_is_invalid_argument() {
        let err = Codec::Json.decode::<HealthCheckRequest>(b"{not json").unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        let err = Codec::Proto
            .decode::<HealthCheckRequest>(&[0x0a, 0x05, b'a'])
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn test_envelope_layout() {
        let encoded = Envelope::new(FLAG_END_STREAM, &b"{}"[..]).encode().unwrap();
        assert_eq!(&encoded[..], &[0x02, 0, 0, 0, 2, b'{', b'}']);
    }

    #[test]
    fn test_decode_multiple_envelopes() {
        let mut body = BytesMut::new();
        body.extend_from_slice(&Envelope::message(&b"ab"[..]).encode().unwrap());
        body.extend_from_slice(
            &Envelope::new(FLAG_TRAILERS, &b"grpc-status: 0\r\n"[..])
                .encode()
                .unwrap(),
        );

        let envelopes = decode_envelopes(body.freeze()).unwrap();
        assert_eq!(envelopes.len(), 2);
        assert_eq!(&envelopes[0].data[..], b"ab");
        assert!(envelopes[1].is_trailers());
    }

    #[test]
    fn test_truncated_envelope_is_rejected() {
        let err = decode_envelopes(Bytes::from_static(&[0, 0, 0, 0, 9, 1, 2])).unwrap_err();
        assert!(err.message().contains("promised 9 bytes"));
        assert!(decode_envelopes(Bytes::from_static(&[0, 0])).is_err());
    }

    #[test]
    fn test_single_message_rules() {
        let one = Envelope::message(&b"x"[..]).encode().unwrap();
        assert_eq!(&decode_single_message(one.clone()).unwrap()[..], b"x");

        let mut two = BytesMut::new();
        two.extend_from_slice(&one);
        two.extend_from_slice(&one);
        assert!(decode_single_message(two.freeze()).is_err());

        let compressed = Envelope::new(FLAG_COMPRESSED, &b"x"[..]).encode().unwrap();
        assert_eq!(
            decode_single_message(compressed).unwrap_err().code(),
            tonic::Code::Unimplemented
        );
    }
}
