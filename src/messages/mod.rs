//! The message table: the declarative registry mapping logical message
//! names to their CoAP shape.
//!
//! Every message the broker or a device can put on the wire has an entry
//! here: its code and type, URI template, whether it carries a fresh
//! token, and the response name a token-bearing request resolves to.
//! [`wrap`] builds wire bytes from an entry, [`unwrap`] parses inbound
//! bytes, and [`classify`] decides how the session routes a frame.

mod payload;

pub use payload::{
    build_arguments, from_binary, to_binary, translate_int_types, ArgSpec, DeviceValue,
    VariableType,
};

use std::fmt;

use crate::coap::{self, Code, Message, MsgType};
use crate::error::{CoreError, Result};

/// Logical message names.
///
/// Inbound frames are classified to one of these; outbound frames are
/// built from one. The name doubles as the session event name a waiting
/// verb listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageName {
    Hello,
    Describe,
    DescribeReturn,
    GetTime,
    GetTimeReturn,
    VariableRequest,
    VariableValue,
    FunctionCall,
    FunctionReturn,
    SignalStart,
    SignalStartReturn,
    UpdateBegin,
    UpdateReady,
    Chunk,
    ChunkReceived,
    ChunkMissed,
    ChunkMissedAck,
    UpdateDone,
    UpdateDoneAck,
    PublicEvent,
    PrivateEvent,
    Subscribe,
    SubscribeAck,
    SubscribeFail,
    EventAck,
    PingAck,
    Ignored,
}

impl MessageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageName::Hello => "Hello",
            MessageName::Describe => "Describe",
            MessageName::DescribeReturn => "DescribeReturn",
            MessageName::GetTime => "GetTime",
            MessageName::GetTimeReturn => "GetTimeReturn",
            MessageName::VariableRequest => "VariableRequest",
            MessageName::VariableValue => "VariableValue",
            MessageName::FunctionCall => "FunctionCall",
            MessageName::FunctionReturn => "FunctionReturn",
            MessageName::SignalStart => "SignalStart",
            MessageName::SignalStartReturn => "SignalStartReturn",
            MessageName::UpdateBegin => "UpdateBegin",
            MessageName::UpdateReady => "UpdateReady",
            MessageName::Chunk => "Chunk",
            MessageName::ChunkReceived => "ChunkReceived",
            MessageName::ChunkMissed => "ChunkMissed",
            MessageName::ChunkMissedAck => "ChunkMissedAck",
            MessageName::UpdateDone => "UpdateDone",
            MessageName::UpdateDoneAck => "UpdateDoneAck",
            MessageName::PublicEvent => "PublicEvent",
            MessageName::PrivateEvent => "PrivateEvent",
            MessageName::Subscribe => "Subscribe",
            MessageName::SubscribeAck => "SubscribeAck",
            MessageName::SubscribeFail => "SubscribeFail",
            MessageName::EventAck => "EventAck",
            MessageName::PingAck => "PingAck",
            MessageName::Ignored => "Ignored",
        }
    }
}

impl fmt::Display for MessageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the message table.
#[derive(Debug, Clone, Copy)]
pub struct MessageSpec {
    /// Message type on the wire
    pub kind: MsgType,
    /// CoAP code
    pub code: Code,
    /// URI template; `{x}` placeholders fill from wrap params
    pub uri: &'static str,
    /// URI-query template, if the message carries one
    pub query: Option<&'static str>,
    /// Whether a fresh token is attached when sending
    pub token: bool,
    /// Response name a token-bearing request resolves to
    pub response: Option<MessageName>,
}

/// Look up the table entry for a message name.
pub fn spec(name: MessageName) -> MessageSpec {
    use MessageName::*;
    match name {
        Hello => MessageSpec {
            kind: MsgType::Confirmable,
            code: Code::Post,
            uri: "h",
            query: None,
            token: false,
            response: None,
        },
        Describe => MessageSpec {
            kind: MsgType::Confirmable,
            code: Code::Get,
            uri: "d",
            query: None,
            token: true,
            response: Some(DescribeReturn),
        },
        DescribeReturn => response_spec(),
        GetTime => MessageSpec {
            kind: MsgType::Confirmable,
            code: Code::Get,
            uri: "t",
            query: None,
            token: true,
            response: Some(GetTimeReturn),
        },
        GetTimeReturn => response_spec(),
        VariableRequest => MessageSpec {
            kind: MsgType::Confirmable,
            code: Code::Get,
            uri: "v/{name}",
            query: None,
            token: true,
            response: Some(VariableValue),
        },
        VariableValue => response_spec(),
        FunctionCall => MessageSpec {
            kind: MsgType::Confirmable,
            code: Code::Post,
            uri: "f/{name}",
            query: Some("{args}"),
            token: true,
            response: Some(FunctionReturn),
        },
        FunctionReturn => response_spec(),
        SignalStart => MessageSpec {
            kind: MsgType::Confirmable,
            code: Code::Put,
            uri: "s/{signal}",
            query: None,
            token: true,
            response: Some(SignalStartReturn),
        },
        SignalStartReturn => response_spec(),
        UpdateBegin => MessageSpec {
            kind: MsgType::Confirmable,
            code: Code::Post,
            uri: "u",
            query: None,
            token: true,
            response: Some(UpdateReady),
        },
        UpdateReady => response_spec(),
        Chunk => MessageSpec {
            kind: MsgType::Confirmable,
            code: Code::Post,
            uri: "c",
            query: Some("{crc}"),
            token: true,
            response: Some(ChunkReceived),
        },
        ChunkReceived => response_spec(),
        ChunkMissed => MessageSpec {
            kind: MsgType::Confirmable,
            code: Code::Get,
            uri: "c",
            query: None,
            token: true,
            response: Some(ChunkMissedAck),
        },
        ChunkMissedAck => response_spec(),
        UpdateDone => MessageSpec {
            kind: MsgType::Confirmable,
            code: Code::Put,
            uri: "u",
            query: None,
            token: true,
            response: Some(UpdateDoneAck),
        },
        UpdateDoneAck => response_spec(),
        PublicEvent => MessageSpec {
            kind: MsgType::NonConfirmable,
            code: Code::Post,
            uri: "e/{name}",
            query: None,
            token: false,
            response: None,
        },
        PrivateEvent => MessageSpec {
            kind: MsgType::NonConfirmable,
            code: Code::Post,
            uri: "E/{name}",
            query: None,
            token: false,
            response: None,
        },
        Subscribe => MessageSpec {
            kind: MsgType::Confirmable,
            code: Code::Get,
            uri: "e/{name}",
            query: None,
            token: false,
            response: None,
        },
        SubscribeAck => MessageSpec {
            kind: MsgType::Acknowledgement,
            code: Code::Changed,
            uri: "",
            query: None,
            token: false,
            response: None,
        },
        SubscribeFail => MessageSpec {
            kind: MsgType::Acknowledgement,
            code: Code::BadRequest,
            uri: "",
            query: None,
            token: false,
            response: None,
        },
        EventAck => MessageSpec {
            kind: MsgType::Acknowledgement,
            code: Code::Changed,
            uri: "",
            query: None,
            token: false,
            response: None,
        },
        PingAck => MessageSpec {
            kind: MsgType::Acknowledgement,
            code: Code::Empty,
            uri: "",
            query: None,
            token: false,
            response: None,
        },
        Ignored => MessageSpec {
            kind: MsgType::Reset,
            code: Code::Empty,
            uri: "",
            query: None,
            token: false,
            response: None,
        },
    }
}

/// Device-to-broker responses share one shape: a piggybacked ACK with
/// content, routed by token. The broker never wraps these itself.
fn response_spec() -> MessageSpec {
    MessageSpec {
        kind: MsgType::Acknowledgement,
        code: Code::Content,
        uri: "",
        query: None,
        token: true,
        response: None,
    }
}

/// The response-type name for a request, per the table.
pub fn response_for(name: MessageName) -> Option<MessageName> {
    spec(name).response
}

/// Template parameters for [`wrap`].
#[derive(Debug, Clone, Default)]
pub struct Params {
    fields: Vec<(&'static str, String)>,
    max_age: Option<u32>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a `{placeholder}` value for the URI/query templates.
    pub fn with_field(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.fields.push((key, value.into()));
        self
    }

    /// Attach a Max-Age option to the built frame.
    pub fn with_max_age(mut self, seconds: u32) -> Self {
        self.max_age = Some(seconds);
        self
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Build the wire bytes for an outbound message.
///
/// Fails on a template placeholder with no matching parameter; unknown
/// names cannot occur because `name` is the enum itself.
pub fn wrap(
    name: MessageName,
    message_id: u16,
    params: &Params,
    payload: &[u8],
    token: Option<u8>,
) -> Result<Vec<u8>> {
    let spec = spec(name);

    let mut message = Message::new(spec.kind, spec.code, message_id);
    message.uri_path = fill_template(name, spec.uri, params)?;
    if let Some(query_template) = spec.query {
        let query = fill_template(name, query_template, params)?;
        if !query.is_empty() {
            message.uri_query = Some(query);
        }
    }
    message.max_age = params.max_age;
    if let Some(token) = token {
        message.token = vec![token];
    }
    message.payload = payload.to_vec();

    coap::encode(&message)
}

/// Parse inbound bytes; `None` on malformed input (the frame is dropped).
pub fn unwrap(bytes: &[u8]) -> Option<Message> {
    match coap::parse(bytes) {
        Ok(message) => Some(message),
        Err(err) => {
            tracing::debug!("Dropping malformed frame: {err}");
            None
        }
    }
}

/// How the session should route an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
    Ack,
    EmptyPing,
}

/// Classification result: routing kind plus the event name to emit.
#[derive(Debug, Clone, Copy)]
pub struct Classification {
    pub kind: FrameKind,
    pub name: MessageName,
}

/// Classify an inbound frame.
///
/// `resolve` looks a token byte up in the session's pending-token table
/// and yields the originating request's name; responses and acks derive
/// their event name from it.
pub fn classify(
    message: &Message,
    resolve: impl Fn(u8) -> Option<MessageName>,
) -> Classification {
    let resolved_response = || {
        message
            .token_byte()
            .and_then(&resolve)
            .and_then(response_for)
    };

    if message.kind == MsgType::Acknowledgement {
        return Classification {
            kind: FrameKind::Ack,
            name: resolved_response().unwrap_or(MessageName::PingAck),
        };
    }

    if message.kind == MsgType::Reset {
        return Classification {
            kind: FrameKind::Request,
            name: MessageName::Ignored,
        };
    }

    if message.is_empty_confirmable() {
        return Classification {
            kind: FrameKind::EmptyPing,
            name: MessageName::PingAck,
        };
    }

    if message.code.is_response() {
        return Classification {
            kind: FrameKind::Response,
            name: resolved_response().unwrap_or(MessageName::PingAck),
        };
    }

    // Request: named by method + leading URI segment, falling back to the
    // token table for anything unrecognized.
    let name = request_name(message)
        .or_else(resolved_response)
        .unwrap_or(MessageName::Ignored);

    Classification {
        kind: FrameKind::Request,
        name,
    }
}

/// Map a device-originated request to its table name.
fn request_name(message: &Message) -> Option<MessageName> {
    let first_segment = message.uri_path.split('/').next().unwrap_or("");
    match (first_segment, message.code) {
        ("h", Code::Post) => Some(MessageName::Hello),
        ("t", Code::Get) => Some(MessageName::GetTime),
        ("c", Code::Get) => Some(MessageName::ChunkMissed),
        ("e", Code::Get) => Some(MessageName::Subscribe),
        ("e", Code::Post) => Some(MessageName::PublicEvent),
        ("E", Code::Post) => Some(MessageName::PrivateEvent),
        ("d", Code::Get) => Some(MessageName::Describe),
        _ => None,
    }
}

/// Expand `{placeholder}` segments from params.
fn fill_template(name: MessageName, template: &str, params: &Params) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| {
            CoreError::MessageParams(format!("Unclosed placeholder in {name} template"))
        })?;
        let key = &after[..end];
        let value = params.get(key).ok_or_else(|| {
            CoreError::MessageParams(format!("{name} requires parameter '{key}'"))
        })?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
