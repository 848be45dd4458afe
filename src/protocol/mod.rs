//! Control-plane wire protocol
//!
//! Length-framed binary messages, little-endian throughout:
//!
//! ```text
//! ┌──────────────────┬─────────────────┬──────────┬────────────────────────┬────────────────────────┐
//! │ u16 total_length │ u16 request_id  │  u8 tag  │ u16 len + target bytes │ u16 len + content bytes│
//! └──────────────────┴─────────────────┴──────────┴────────────────────────┴────────────────────────┘
//! ```
//!
//! `tag` carries the request type on requests and a return code on
//! responses. Bounds are enforced on both directions: encoding a message
//! that would exceed any bound fails closed with nothing written, and a
//! decoded message violating a bound is a framing error that makes the
//! connection unusable.

use std::fmt;

use crate::error::{Error, Result};
use crate::net::Stream;

/// Size of the outer message-length prefix
pub const LENGTH_PREFIX_SIZE: usize = 2;
/// Ceiling on the serialized message excluding the length prefix
pub const MAX_MESSAGE_SIZE: usize = 4096 - LENGTH_PREFIX_SIZE;
/// Targets must be strictly shorter than this
pub const MAX_TARGET_SIZE: usize = 255;
/// Fixed per-message overhead: request_id + tag + two string length prefixes
pub const STATIC_MESSAGE_SIZE: usize = 7;
/// Contents must be strictly shorter than this
pub const MAX_CONTENT_SIZE: usize = MAX_MESSAGE_SIZE - MAX_TARGET_SIZE - STATIC_MESSAGE_SIZE;

/// Request type carried in the tag byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestKind {
    Daemon = 0,
    Status = 1,
    Start = 2,
    Stop = 3,
    Enable = 4,
    Disable = 5,
}

impl RequestKind {
    pub fn from_u8(value: u8) -> Option<RequestKind> {
        match value {
            0 => Some(RequestKind::Daemon),
            1 => Some(RequestKind::Status),
            2 => Some(RequestKind::Start),
            3 => Some(RequestKind::Stop),
            4 => Some(RequestKind::Enable),
            5 => Some(RequestKind::Disable),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Return code carried in the tag byte of responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    Ok = 0,
    NoService = 1,
    Error = 2,
}

impl ReturnCode {
    pub fn from_u8(value: u8) -> Option<ReturnCode> {
        match value {
            0 => Some(ReturnCode::Ok),
            1 => Some(ReturnCode::NoService),
            2 => Some(ReturnCode::Error),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReturnCode::Ok => "OK",
            ReturnCode::NoService => "NOSERVICE",
            ReturnCode::Error => "ERROR",
        }
    }
}

/// A management request from a client
///
/// `kind` stays a raw byte so unknown tags survive decoding; the
/// dispatcher decides what to do with them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub request_id: u16,
    pub kind: u8,
    pub target: String,
    pub content: String,
}

impl Request {
    pub fn new(
        request_id: u16,
        kind: RequestKind,
        target: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            kind: kind.as_u8(),
            target: target.into(),
            content: content.into(),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Request ID: {}", self.request_id)?;
        writeln!(f, "Type: {}", self.kind)?;
        writeln!(f, "Target: {}", self.target)?;
        write!(f, "Content: {}", self.content)
    }
}

/// A daemon reply, correlated to its request by `request_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub request_id: u16,
    pub code: u8,
    pub target: String,
    pub content: String,
}

impl Response {
    pub fn new(
        request_id: u16,
        code: ReturnCode,
        target: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            code: code.as_u8(),
            target: target.into(),
            content: content.into(),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = ReturnCode::from_u8(self.code)
            .map(ReturnCode::as_str)
            .unwrap_or("UNKNOWN");
        writeln!(f, "Request ID: {}", self.request_id)?;
        writeln!(f, "ReturnCode: {code}")?;
        writeln!(f, "Target: {}", self.target)?;
        write!(f, "Content: {}", self.content)
    }
}

fn encode_frame(request_id: u16, tag: u8, target: &str, content: &str) -> Result<Vec<u8>> {
    let target_len = target.len();
    let content_len = content.len();
    if target_len >= MAX_TARGET_SIZE {
        return Err(Error::Framing("target too long"));
    }
    if content_len >= MAX_CONTENT_SIZE {
        return Err(Error::Framing("content too long"));
    }
    let payload_len = STATIC_MESSAGE_SIZE + target_len + content_len;
    if payload_len >= MAX_MESSAGE_SIZE {
        return Err(Error::Framing("message too long"));
    }

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload_len);
    buf.extend_from_slice(&(payload_len as u16).to_le_bytes());
    buf.extend_from_slice(&request_id.to_le_bytes());
    buf.push(tag);
    buf.extend_from_slice(&(target_len as u16).to_le_bytes());
    buf.extend_from_slice(target.as_bytes());
    buf.extend_from_slice(&(content_len as u16).to_le_bytes());
    buf.extend_from_slice(content.as_bytes());
    Ok(buf)
}

/// Serialize a request; fails closed with nothing produced if any bound
/// would be exceeded
pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
    encode_frame(
        request.request_id,
        request.kind,
        &request.target,
        &request.content,
    )
}

/// Serialize a response with the same bounds as requests
pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
    encode_frame(
        response.request_id,
        response.code,
        &response.target,
        &response.content,
    )
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

/// Decoded frame fields plus the total number of bytes consumed
type Frame = (u16, u8, String, String, usize);

fn decode_frame(buf: &[u8]) -> Result<Option<Frame>> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }
    let payload_len = read_u16(buf, 0) as usize;
    if payload_len >= MAX_MESSAGE_SIZE || payload_len < STATIC_MESSAGE_SIZE {
        return Err(Error::Framing("invalid message length"));
    }
    let total = LENGTH_PREFIX_SIZE + payload_len;
    if buf.len() < total {
        // Not yet available; retry on the next readiness notification
        return Ok(None);
    }

    let mut cursor = LENGTH_PREFIX_SIZE;
    let request_id = read_u16(buf, cursor);
    cursor += 2;
    let tag = buf[cursor];
    cursor += 1;

    let target_len = read_u16(buf, cursor) as usize;
    cursor += 2;
    if target_len >= MAX_TARGET_SIZE {
        return Err(Error::Framing("target too long"));
    }
    if cursor + target_len + 2 > total {
        return Err(Error::Framing("target overruns message"));
    }
    let target = std::str::from_utf8(&buf[cursor..cursor + target_len])
        .map_err(|_| Error::Framing("target is not valid UTF-8"))?
        .to_owned();
    cursor += target_len;

    let content_len = read_u16(buf, cursor) as usize;
    cursor += 2;
    if content_len >= MAX_CONTENT_SIZE {
        return Err(Error::Framing("content too long"));
    }
    if cursor + content_len != total {
        return Err(Error::Framing("message length mismatch"));
    }
    let content = std::str::from_utf8(&buf[cursor..cursor + content_len])
        .map_err(|_| Error::Framing("content is not valid UTF-8"))?
        .to_owned();

    Ok(Some((request_id, tag, target, content, total)))
}

/// Decode one request from buffered bytes
///
/// `Ok(None)` means the frame is incomplete, not an error. On success the
/// returned usize is the exact byte count the caller must consume.
pub fn decode_request(buf: &[u8]) -> Result<Option<(Request, usize)>> {
    Ok(decode_frame(buf)?.map(|(request_id, kind, target, content, used)| {
        (
            Request {
                request_id,
                kind,
                target,
                content,
            },
            used,
        )
    }))
}

/// Decode one response from buffered bytes; same contract as
/// [`decode_request`]
pub fn decode_response(buf: &[u8]) -> Result<Option<(Response, usize)>> {
    Ok(decode_frame(buf)?.map(|(request_id, code, target, content, used)| {
        (
            Response {
                request_id,
                code,
                target,
                content,
            },
            used,
        )
    }))
}

/// Encode a request onto a stream's write buffer
pub fn write_request(stream: &Stream, request: &Request) -> Result<()> {
    stream.write(encode_request(request)?);
    Ok(())
}

/// Encode a response onto a stream's write buffer
pub fn write_response(stream: &Stream, response: &Response) -> Result<()> {
    stream.write(encode_response(response)?);
    Ok(())
}

/// Try to decode one request from a stream's buffered bytes, consuming
/// exactly the parsed bytes on success
pub fn read_request(stream: &Stream) -> Result<Option<Request>> {
    let parsed = {
        let Some(view) = stream.read(LENGTH_PREFIX_SIZE) else {
            return Ok(None);
        };
        decode_request(&view)?
    };
    match parsed {
        Some((request, used)) => {
            stream.consume(used);
            Ok(Some(request))
        }
        None => Ok(None),
    }
}

/// Try to decode one response from a stream's buffered bytes
pub fn read_response(stream: &Stream) -> Result<Option<Response>> {
    let parsed = {
        let Some(view) = stream.read(LENGTH_PREFIX_SIZE) else {
            return Ok(None);
        };
        decode_response(&view)?
    };
    match parsed {
        Some((response, used)) => {
            stream.consume(used);
            Ok(Some(response))
        }
        None => Ok(None),
    }
}
