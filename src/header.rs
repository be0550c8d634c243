//! # Wire Header Codec
//!
//! Every CMSG frame starts with a fixed 16-byte header followed by an
//! optional TLV block and the packed protobuf body. All multi-byte fields
//! are big-endian.
//!
//! ```text
//! offset  size  field
//! 0       4     msg_type
//! 4       4     header_length   (bytes from header start to body start)
//! 8       4     message_length  (packed body bytes after the header)
//! 12      4     status_code     (only meaningful on replies)
//! 16      ?     TLV block, total bytes = header_length - 16
//! ```
//!
//! A single TLV is defined, `METHOD`, carrying the NUL-terminated method
//! name of a request. Unknown TLV types are skipped so that newer peers can
//! extend the header without breaking older ones.

use thiserror::Error;

use crate::service::ServiceDescriptor;

/// Size of the fixed portion of the wire header.
pub const HEADER_LEN: usize = 16;

/// TLV type value for the method-name TLV.
pub const TLV_TYPE_METHOD: u32 = 1;

/// Sentinel method index meaning "name did not resolve against the
/// service descriptor".
pub const METHOD_UNDEFINED: u32 = u32::MAX;

/// Message types carried in the header.
///
/// `EchoReq`/`EchoReply` implement a liveness ping; `ConnOpen` is accepted
/// for compatibility but is a no-op on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    /// Request to the server to invoke a method
    MethodReq = 0,
    /// Reply from the server in response to a method request
    MethodReply = 1,
    /// Request to the server for a liveness reply
    EchoReq = 2,
    /// Reply from the server that it is running
    EchoReply = 3,
    /// Connection-open indication, no response expected
    ConnOpen = 4,
}

impl MsgType {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(MsgType::MethodReq),
            1 => Some(MsgType::MethodReply),
            2 => Some(MsgType::EchoReq),
            3 => Some(MsgType::EchoReply),
            4 => Some(MsgType::ConnOpen),
            _ => None,
        }
    }
}

/// Status codes carried on reply headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum StatusCode {
    /// Not a reply, or status not filled in
    Unset = 0,
    /// Reply body is valid (and may be empty)
    Success = 1,
    /// The implementation reported a failure; no body follows
    ServiceFailed = 2,
    /// Rate-limit reject
    TooManyPending = 3,
    /// The server enqueued the request; empty reply
    ServiceQueued = 4,
    /// The server dropped the request by filter; empty reply
    ServiceDropped = 5,
    /// The peer reset the connection
    ServerConnReset = 6,
    /// The TLV method name is not in the service descriptor
    ServerMethodNotFound = 7,
    /// The peer shut the connection down in an orderly fashion
    ConnectionClosed = 8,
}

impl StatusCode {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(StatusCode::Unset),
            1 => Some(StatusCode::Success),
            2 => Some(StatusCode::ServiceFailed),
            3 => Some(StatusCode::TooManyPending),
            4 => Some(StatusCode::ServiceQueued),
            5 => Some(StatusCode::ServiceDropped),
            6 => Some(StatusCode::ServerConnReset),
            7 => Some(StatusCode::ServerMethodNotFound),
            8 => Some(StatusCode::ConnectionClosed),
            _ => None,
        }
    }
}

/// Parsed fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_type: MsgType,
    pub header_length: u32,
    pub message_length: u32,
    pub status_code: StatusCode,
}

impl Header {
    /// Bytes of TLV data between the fixed header and the body.
    pub fn extra_header_len(&self) -> usize {
        self.header_length as usize - HEADER_LEN
    }

    /// Total frame size: fixed header, TLVs and body.
    pub fn frame_len(&self) -> usize {
        self.header_length as usize + self.message_length as usize
    }
}

/// Errors surfaced while parsing a received header.
#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("header truncated: {0} bytes")]
    Truncated(usize),
    #[error("unknown msg_type {0}")]
    BadMsgType(u32),
    #[error("unknown status_code {0}")]
    BadStatusCode(u32),
    #[error("header_length {0} smaller than fixed header")]
    BadHeaderLength(u32),
    #[error("TLV block malformed")]
    BadTlv,
}

/// Outcome of resolving the METHOD TLV against a service descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodResolution {
    /// Method name exactly as received (without the trailing NUL).
    pub name: String,
    /// Index into the descriptor's method table, or [`METHOD_UNDEFINED`].
    pub index: u32,
}

impl MethodResolution {
    pub fn is_undefined(&self) -> bool {
        self.index == METHOD_UNDEFINED
    }
}

fn tlv_size(method: &str) -> usize {
    // type + length words, then the name including its NUL
    8 + method.len() + 1
}

/// Build a complete frame: fixed header, METHOD TLV when a method name is
/// given, then the packed body.
pub fn pack(
    msg_type: MsgType,
    status_code: StatusCode,
    method: Option<&str>,
    body: &[u8],
) -> Vec<u8> {
    let extra = method.map(tlv_size).unwrap_or(0);
    let header_length = (HEADER_LEN + extra) as u32;
    let mut buf = Vec::with_capacity(HEADER_LEN + extra + body.len());

    buf.extend_from_slice(&(msg_type as u32).to_be_bytes());
    buf.extend_from_slice(&header_length.to_be_bytes());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&(status_code as u32).to_be_bytes());

    if let Some(name) = method {
        buf.extend_from_slice(&TLV_TYPE_METHOD.to_be_bytes());
        buf.extend_from_slice(&((name.len() + 1) as u32).to_be_bytes());
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
    }

    buf.extend_from_slice(body);
    buf
}

/// Parse the fixed 16-byte header.
pub fn parse(buf: &[u8]) -> Result<Header, HeaderError> {
    if buf.len() < HEADER_LEN {
        return Err(HeaderError::Truncated(buf.len()));
    }

    let word = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);

    let raw_type = word(0);
    let header_length = word(4);
    let message_length = word(8);
    let raw_status = word(12);

    let msg_type = MsgType::from_u32(raw_type).ok_or(HeaderError::BadMsgType(raw_type))?;
    let status_code =
        StatusCode::from_u32(raw_status).ok_or(HeaderError::BadStatusCode(raw_status))?;

    if (header_length as usize) < HEADER_LEN {
        return Err(HeaderError::BadHeaderLength(header_length));
    }

    Ok(Header {
        msg_type,
        header_length,
        message_length,
        status_code,
    })
}

/// Walk the TLV block that follows the fixed header and resolve the METHOD
/// TLV, if any, against `descriptor`.
///
/// Unknown TLV types are skipped. A METHOD TLV whose name is not in the
/// descriptor resolves to [`METHOD_UNDEFINED`]; the server replies with
/// `ServerMethodNotFound` in that case rather than dropping the connection.
pub fn parse_tlv(
    extra: &[u8],
    descriptor: &ServiceDescriptor,
) -> Result<Option<MethodResolution>, HeaderError> {
    let mut offset = 0usize;
    let mut resolution = None;

    while offset + 8 <= extra.len() {
        let tlv_type = u32::from_be_bytes([
            extra[offset],
            extra[offset + 1],
            extra[offset + 2],
            extra[offset + 3],
        ]);
        let tlv_len = u32::from_be_bytes([
            extra[offset + 4],
            extra[offset + 5],
            extra[offset + 6],
            extra[offset + 7],
        ]) as usize;
        offset += 8;

        if offset + tlv_len > extra.len() {
            return Err(HeaderError::BadTlv);
        }

        if tlv_type == TLV_TYPE_METHOD {
            let value = &extra[offset..offset + tlv_len];
            // The NUL terminator is required and counted in the length.
            if value.is_empty() || value[value.len() - 1] != 0 {
                return Err(HeaderError::BadTlv);
            }
            let name = std::str::from_utf8(&value[..value.len() - 1])
                .map_err(|_| HeaderError::BadTlv)?
                .to_string();
            let index = descriptor
                .method_index(&name)
                .unwrap_or(METHOD_UNDEFINED);
            resolution = Some(MethodResolution { name, index });
        }

        offset += tlv_len;
    }

    if offset != extra.len() {
        return Err(HeaderError::BadTlv);
    }

    Ok(resolution)
}
