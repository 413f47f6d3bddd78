//! CoAP framing for the device wire protocol.
//!
//! The cipher pipe delivers whole datagrams; this module turns them into
//! [`Message`] values and back. Only the subset of RFC 7252 the device
//! protocol uses is implemented: CON/NON/ACK/RST types, 16-bit message
//! ids, 0-8 byte tokens (the protocol uses 1), Uri-Path, Uri-Query and
//! Max-Age options, and an opaque payload.
//!
//! # Wire Format
//!
//! ```text
//! 0                   1                   2                   3
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Options (if any) ...        | 0xFF | Payload (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+------+-------------------------
//! ```

mod packet;

pub use packet::{encode, parse};

use std::time::SystemTime;

/// CoAP protocol version carried in every header
pub const VERSION: u8 = 1;

/// Option number for Uri-Path
pub const OPT_URI_PATH: u16 = 11;
/// Option number for Max-Age
pub const OPT_MAX_AGE: u16 = 14;
/// Option number for Uri-Query
pub const OPT_URI_QUERY: u16 = 15;

/// CoAP message type (2 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    /// Requires an acknowledgement reusing the message id
    Confirmable = 0,
    /// Fire-and-forget
    NonConfirmable = 1,
    /// Acknowledgement, possibly carrying a piggybacked response
    Acknowledgement = 2,
    /// Reset; the peer could not process the message
    Reset = 3,
}

impl MsgType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MsgType::Confirmable,
            1 => MsgType::NonConfirmable,
            2 => MsgType::Acknowledgement,
            _ => MsgType::Reset,
        }
    }

    pub fn as_bits(&self) -> u8 {
        *self as u8
    }
}

/// CoAP code: 3-bit class, 5-bit detail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    /// 0.00, used by pings and bare acks
    Empty,
    /// 0.01
    Get,
    /// 0.02
    Post,
    /// 0.03
    Put,
    /// 0.04
    Delete,
    /// 2.01
    Created,
    /// 2.04
    Changed,
    /// 2.05
    Content,
    /// 4.00
    BadRequest,
    /// 4.04
    NotFound,
    /// 5.00
    InternalServerError,
    /// Anything else, kept verbatim
    Other(u8),
}

impl Code {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => Code::Empty,
            0x01 => Code::Get,
            0x02 => Code::Post,
            0x03 => Code::Put,
            0x04 => Code::Delete,
            0x41 => Code::Created,
            0x44 => Code::Changed,
            0x45 => Code::Content,
            0x80 => Code::BadRequest,
            0x84 => Code::NotFound,
            0xA0 => Code::InternalServerError,
            other => Code::Other(other),
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            Code::Empty => 0x00,
            Code::Get => 0x01,
            Code::Post => 0x02,
            Code::Put => 0x03,
            Code::Delete => 0x04,
            Code::Created => 0x41,
            Code::Changed => 0x44,
            Code::Content => 0x45,
            Code::BadRequest => 0x80,
            Code::NotFound => 0x84,
            Code::InternalServerError => 0xA0,
            Code::Other(b) => *b,
        }
    }

    /// Class bits (0 for requests, 2/4/5 for responses)
    pub fn class(&self) -> u8 {
        self.as_byte() >> 5
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Code::Empty)
    }

    pub fn is_request(&self) -> bool {
        self.class() == 0 && !self.is_empty()
    }

    pub fn is_response(&self) -> bool {
        matches!(self.class(), 2 | 4 | 5)
    }
}

/// A parsed CoAP datagram.
///
/// One of these exists per inbound/outbound frame; the session routes it
/// by code, type, token and URI.
#[derive(Debug, Clone)]
pub struct Message {
    /// Message type (CON/NON/ACK/RST)
    pub kind: MsgType,
    /// Code (method or response class.detail)
    pub code: Code,
    /// 16-bit message id
    pub message_id: u16,
    /// Token, 0-8 bytes
    pub token: Vec<u8>,
    /// Uri-Path segments joined with '/'
    pub uri_path: String,
    /// Uri-Query, if any
    pub uri_query: Option<String>,
    /// Max-Age option, if any
    pub max_age: Option<u32>,
    /// Payload bytes (empty if none)
    pub payload: Vec<u8>,
    /// When this frame was parsed off the wire
    pub timestamp: SystemTime,
}

impl Message {
    /// A minimal message with the given type, code and id.
    pub fn new(kind: MsgType, code: Code, message_id: u16) -> Self {
        Self {
            kind,
            code,
            message_id,
            token: Vec::new(),
            uri_path: String::new(),
            uri_query: None,
            max_age: None,
            payload: Vec::new(),
            timestamp: SystemTime::now(),
        }
    }

    /// The single-byte token this protocol uses, if present.
    pub fn token_byte(&self) -> Option<u8> {
        self.token.first().copied()
    }

    /// Two-hex-digit lowercase token key, for logs.
    pub fn token_key(&self) -> Option<String> {
        self.token_byte().map(|t| format!("{t:02x}"))
    }

    /// Whether this is an empty confirmable message (a keepalive ping).
    pub fn is_empty_confirmable(&self) -> bool {
        self.code.is_empty() && self.kind == MsgType::Confirmable
    }
}
