//! Protocol envelopes and the wire codec.
//!
//! An envelope is one framed wire message: either a [`Request`] or a
//! [`Response`]. Two self-identifying layouts exist:
//!
//! - **Binary** ([`frame`]): a magic-guarded fixed header plus
//!   length-delimited tail, used on raw stream transports.
//! - **Text**: the envelope serialized as one JSON object, the fallback for
//!   transports that already delimit messages (HTTP, datagrams).
//!
//! [`WireCodec`] couples a layout with the payload codec that encodes the
//! binary layout's metadata section, and enforces the configured maximum
//! message size in both directions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::codec::PayloadCodec;
use crate::error::{Code, Error, Result};

pub mod frame;

/// Default cap on a single encoded envelope (10 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// An RPC request envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Routing key in the form `"Service.Method"`.
    pub service_method: String,
    /// Sequence number assigned by the client, echoed by the server.
    pub seq: u64,
    /// Optional key/value metadata travelling with the request.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// The codec-encoded argument.
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// An RPC response envelope.
///
/// A non-empty `error` means the call failed and `payload` carries nothing
/// meaningful.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Echo of the request's routing key.
    pub service_method: String,
    /// Echo of the request's sequence number.
    pub seq: u64,
    /// Optional key/value metadata travelling with the response.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Error message; empty on success.
    #[serde(default)]
    pub error: String,
    /// The codec-encoded reply, present iff `error` is empty.
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Response {
    /// A failure response echoing `seq`, with no payload.
    pub fn failure(seq: u64, service_method: impl Into<String>, error: impl Into<String>) -> Self {
        Response {
            service_method: service_method.into(),
            seq,
            metadata: HashMap::new(),
            error: error.into(),
            payload: Vec::new(),
        }
    }
}

/// Splits a `"Service.Method"` routing key at its first dot.
///
/// Both halves must be non-empty; anything else is ill-formed. A key with
/// several dots splits after the first one, so `"A.B.C"` routes to service
/// `"A"`, method `"B.C"`.
///
/// ```
/// use bolt_core::protocol::parse_service_method;
///
/// assert_eq!(parse_service_method("Greeter.SayHello"), Some(("Greeter", "SayHello")));
/// assert_eq!(parse_service_method("A.B.C"), Some(("A", "B.C")));
/// assert_eq!(parse_service_method("NoDot"), None);
/// ```
pub fn parse_service_method(service_method: &str) -> Option<(&str, &str)> {
    let (service, method) = service_method.split_once('.')?;
    if service.is_empty() || method.is_empty() {
        return None;
    }
    Some((service, method))
}

/// Which envelope layout a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// Magic-guarded binary framing, for raw stream transports.
    #[default]
    Binary,
    /// One JSON object per envelope, for message-delimited transports.
    Text,
}

/// Envelope encoder/decoder for a chosen layout and payload codec.
#[derive(Debug, Clone, Copy)]
pub struct WireCodec {
    format: WireFormat,
    payload: PayloadCodec,
    max_message_size: usize,
}

impl WireCodec {
    /// Creates a wire codec with the default maximum message size.
    pub fn new(format: WireFormat, payload: PayloadCodec) -> Self {
        WireCodec {
            format,
            payload,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Overrides the maximum accepted envelope size.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// The layout this codec speaks.
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// The payload codec used for the binary layout's metadata section.
    pub fn payload_codec(&self) -> PayloadCodec {
        self.payload
    }

    /// The configured maximum envelope size.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Encodes a request envelope.
    pub fn encode_request(&self, request: &Request) -> Result<Vec<u8>> {
        match self.format {
            WireFormat::Binary => {
                frame::encode_request(request, self.payload, self.max_message_size)
            }
            WireFormat::Text => self.encode_text(request),
        }
    }

    /// Decodes a request envelope, rejecting anything else.
    pub fn decode_request(&self, data: &[u8]) -> Result<Request> {
        match self.format {
            WireFormat::Binary => {
                match frame::decode(data, self.payload, self.max_message_size)? {
                    frame::Frame::Request(request) => Ok(request),
                    frame::Frame::Response(_) => Err(Error::new(
                        Code::InvalidArgument,
                        "expected a request envelope, got a response",
                    )),
                }
            }
            WireFormat::Text => self.decode_text(data),
        }
    }

    /// Encodes a response envelope.
    pub fn encode_response(&self, response: &Response) -> Result<Vec<u8>> {
        match self.format {
            WireFormat::Binary => {
                frame::encode_response(response, self.payload, self.max_message_size)
            }
            WireFormat::Text => self.encode_text(response),
        }
    }

    /// Decodes a response envelope, rejecting anything else.
    pub fn decode_response(&self, data: &[u8]) -> Result<Response> {
        match self.format {
            WireFormat::Binary => {
                match frame::decode(data, self.payload, self.max_message_size)? {
                    frame::Frame::Response(response) => Ok(response),
                    frame::Frame::Request(_) => Err(Error::new(
                        Code::InvalidArgument,
                        "expected a response envelope, got a request",
                    )),
                }
            }
            WireFormat::Text => self.decode_text(data),
        }
    }

    /// Best-effort recovery of the sequence number from a frame that failed
    /// full decoding, for error responses. Returns 0 when unrecoverable.
    pub fn recover_seq(&self, data: &[u8]) -> u64 {
        match self.format {
            WireFormat::Binary => frame::peek_seq(data).unwrap_or(0),
            WireFormat::Text => {
                #[derive(Deserialize)]
                struct SeqOnly {
                    #[serde(default)]
                    seq: u64,
                }
                serde_json::from_slice::<SeqOnly>(data)
                    .map(|s| s.seq)
                    .unwrap_or(0)
            }
        }
    }

    fn encode_text<T: Serialize>(&self, envelope: &T) -> Result<Vec<u8>> {
        let data = serde_json::to_vec(envelope)
            .map_err(|e| Error::wrap(Code::Unknown, e, "encode text envelope"))?;
        if data.len() > self.max_message_size {
            return Err(Error::new(
                Code::InvalidArgument,
                format!(
                    "envelope of {} bytes exceeds maximum message size {}",
                    data.len(),
                    self.max_message_size
                ),
            ));
        }
        Ok(data)
    }

    fn decode_text<T: serde::de::DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        if data.len() > self.max_message_size {
            return Err(Error::new(
                Code::InvalidArgument,
                format!(
                    "envelope of {} bytes exceeds maximum message size {}",
                    data.len(),
                    self.max_message_size
                ),
            ));
        }
        serde_json::from_slice(data)
            .map_err(|e| Error::wrap(Code::InvalidArgument, e, "decode text envelope"))
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        WireCodec::new(WireFormat::default(), PayloadCodec::default())
    }
}
