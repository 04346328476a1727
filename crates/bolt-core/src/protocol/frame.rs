//! Binary envelope framing.
//!
//! Header (13 bytes, all integers big-endian):
//!
//! ```text
//! +--------+--------+--------+--------+--------+--------......--------+
//! |     magic       | ver    | type   | flags  |       sequence      |
//! |    2 bytes      | 1 byte | 1 byte | 1 byte |       8 bytes       |
//! +--------+--------+--------+--------+--------+--------......--------+
//! ```
//!
//! The flags byte carries the payload-encoding id in its low nibble and a
//! reserved compression id in the high nibble. The variable tail follows:
//! service-method (1-byte length), metadata (4-byte length, encoded by the
//! payload codec), for responses an error string (2-byte length), and the
//! payload (4-byte length).
//!
//! On stream transports the whole frame is additionally preceded by a 4-byte
//! length prefix; that prefix belongs to the transport, not to this codec.
//!
//! Every declared length is validated against the configured maximum before
//! any allocation happens, so a hostile frame cannot make the decoder
//! reserve gigabytes off a 20-byte datagram.

use std::collections::HashMap;

use bytes::BufMut;
use thiserror::Error as ThisError;

use crate::codec::PayloadCodec;
use crate::error::{Code, Error, Result};
use crate::protocol::{Request, Response};

/// Frame magic, `0x8274`.
pub const MAGIC: u16 = 0x8274;
/// Current protocol version.
pub const VERSION: u8 = 0x01;
/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 13;

const TYPE_REQUEST: u8 = 0x01;
const TYPE_RESPONSE: u8 = 0x02;

/// Structural failures of the binary layout.
#[derive(Debug, ThisError)]
pub enum FrameError {
    /// Any structural violation: bad magic, truncation, bad lengths.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// A declared length exceeds the configured maximum message size.
    #[error("declared length {len} exceeds maximum message size {max}")]
    TooLarge { len: usize, max: usize },
    /// The version byte names a protocol revision we do not speak.
    #[error("unsupported protocol version {0:#04x}")]
    UnsupportedVersion(u8),
}

impl From<FrameError> for Error {
    fn from(err: FrameError) -> Self {
        let message = match &err {
            FrameError::Malformed(_) => "malformed envelope",
            FrameError::TooLarge { .. } => "envelope too large",
            FrameError::UnsupportedVersion(_) => "unsupported envelope version",
        };
        Error::wrap(Code::InvalidArgument, err, message)
    }
}

/// A decoded binary envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

/// Encodes a request envelope.
pub fn encode_request(request: &Request, payload: PayloadCodec, max: usize) -> Result<Vec<u8>> {
    encode(
        TYPE_REQUEST,
        request.seq,
        &request.service_method,
        &request.metadata,
        None,
        &request.payload,
        payload,
        max,
    )
}

/// Encodes a response envelope.
pub fn encode_response(response: &Response, payload: PayloadCodec, max: usize) -> Result<Vec<u8>> {
    encode(
        TYPE_RESPONSE,
        response.seq,
        &response.service_method,
        &response.metadata,
        Some(&response.error),
        &response.payload,
        payload,
        max,
    )
}

#[allow(clippy::too_many_arguments)]
fn encode(
    msg_type: u8,
    seq: u64,
    service_method: &str,
    metadata: &HashMap<String, String>,
    error: Option<&str>,
    payload: &[u8],
    codec: PayloadCodec,
    max: usize,
) -> Result<Vec<u8>> {
    if service_method.len() > u8::MAX as usize {
        return Err(FrameError::Malformed(format!(
            "service method of {} bytes exceeds 255",
            service_method.len()
        ))
        .into());
    }
    let metadata_bytes = if metadata.is_empty() {
        Vec::new()
    } else {
        codec.encode(metadata)?
    };
    check_len(metadata_bytes.len(), max)?;
    check_len(payload.len(), max)?;
    let error = error.unwrap_or_default();
    if error.len() > u16::MAX as usize {
        return Err(FrameError::Malformed(format!(
            "error string of {} bytes exceeds 65535",
            error.len()
        ))
        .into());
    }

    let mut buf = Vec::with_capacity(
        HEADER_LEN + 1 + service_method.len() + 4 + metadata_bytes.len() + 2 + error.len() + 4
            + payload.len(),
    );
    buf.put_u16(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(msg_type);
    // Low nibble: payload encoding id. High nibble: compression, reserved 0.
    buf.put_u8(codec.wire_id() & 0x0F);
    buf.put_u64(seq);
    buf.put_u8(service_method.len() as u8);
    buf.put_slice(service_method.as_bytes());
    buf.put_u32(metadata_bytes.len() as u32);
    buf.put_slice(&metadata_bytes);
    if msg_type == TYPE_RESPONSE {
        buf.put_u16(error.len() as u16);
        buf.put_slice(error.as_bytes());
    }
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    check_len(buf.len(), max)?;
    Ok(buf)
}

/// Decodes one binary envelope, request or response.
pub fn decode(data: &[u8], codec: PayloadCodec, max: usize) -> Result<Frame> {
    let mut cursor = Cursor::new(data);

    let magic = cursor.u16()?;
    if magic != MAGIC {
        return Err(FrameError::Malformed(format!("bad magic {magic:#06x}")).into());
    }
    let version = cursor.u8()?;
    if version != VERSION {
        return Err(FrameError::UnsupportedVersion(version).into());
    }
    let msg_type = cursor.u8()?;
    if msg_type != TYPE_REQUEST && msg_type != TYPE_RESPONSE {
        return Err(FrameError::Malformed(format!("unknown message type {msg_type:#04x}")).into());
    }
    // Encoding id is advisory; the codec pairing is a deployment choice, so
    // a mismatch with the local codec is not rejected here.
    let _flags = cursor.u8()?;
    let seq = cursor.u64()?;

    let method_len = cursor.u8()? as usize;
    // Requests route by the service method, so an empty one is malformed.
    // Responses may legitimately carry none: the best-effort reply to an
    // undecodable request has no routing key to echo.
    if method_len == 0 && msg_type == TYPE_REQUEST {
        return Err(FrameError::Malformed("empty service method".to_string()).into());
    }
    let service_method = std::str::from_utf8(cursor.take(method_len)?)
        .map_err(|_| FrameError::Malformed("service method is not utf-8".to_string()))?
        .to_string();

    let metadata_len = cursor.u32()? as usize;
    check_len(metadata_len, max)?;
    let metadata_bytes = cursor.take(metadata_len)?;
    let metadata: HashMap<String, String> = if metadata_len == 0 {
        HashMap::new()
    } else {
        codec.decode(metadata_bytes)?
    };

    let error = if msg_type == TYPE_RESPONSE {
        let error_len = cursor.u16()? as usize;
        check_len(error_len, max)?;
        String::from_utf8(cursor.take(error_len)?.to_vec())
            .map_err(|_| FrameError::Malformed("error string is not utf-8".to_string()))?
    } else {
        String::new()
    };

    let payload_len = cursor.u32()? as usize;
    check_len(payload_len, max)?;
    let payload = cursor.take(payload_len)?.to_vec();

    if cursor.remaining() != 0 {
        return Err(FrameError::Malformed(format!(
            "{} trailing bytes after payload",
            cursor.remaining()
        ))
        .into());
    }

    match msg_type {
        TYPE_REQUEST => Ok(Frame::Request(Request {
            service_method,
            seq,
            metadata,
            payload,
        })),
        _ => Ok(Frame::Response(Response {
            service_method,
            seq,
            metadata,
            error,
            payload,
        })),
    }
}

/// Reads the sequence number out of a frame whose header is intact, even if
/// the tail later failed to decode. `None` when the header itself is bad.
pub fn peek_seq(data: &[u8]) -> Option<u64> {
    if data.len() < HEADER_LEN {
        return None;
    }
    if u16::from_be_bytes([data[0], data[1]]) != MAGIC || data[2] != VERSION {
        return None;
    }
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&data[5..13]);
    Some(u64::from_be_bytes(seq))
}

fn check_len(len: usize, max: usize) -> std::result::Result<(), FrameError> {
    if len > max {
        return Err(FrameError::TooLarge { len, max });
    }
    Ok(())
}

/// Bounds-checked reader over a byte slice.
struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], FrameError> {
        if self.buf.len() < n {
            return Err(FrameError::Malformed(format!(
                "truncated frame: need {n} bytes, have {}",
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> std::result::Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> std::result::Result<u16, FrameError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> std::result::Result<u32, FrameError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> std::result::Result<u64, FrameError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }
}
