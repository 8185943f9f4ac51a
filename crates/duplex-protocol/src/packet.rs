//! Packet kinds and packet bodies.
//!
//! Bodies are JSON arrays whose length selects the form:
//!
//! | packet | bodies |
//! |---|---|
//! | publish | `[event]`, `[event, args]`, `[event, typeinfo, args]` |
//! | call | `[id, method]`, `[id, method, args]`, `[id, method, typeinfo, args]` |
//! | response | `id`, `[id, args]`, `[id, typeinfo, args]` |
//! | not found | `id`, `[id, method]` |
//!
//! Call id `0` means the caller wants no response.

use serde::Serialize;

use crate::codec::Codec;
use crate::error::{CodecError, FrameError};
use crate::framer::{PacketKind, UnknownKindPolicy, LINE_FEED, PROTOCOL_VERSION};
use crate::typeinfo::Tag;
use crate::value::{Value, MAX_SAFE_INTEGER};

/// Pub/sub kind namespace.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PubSubKind {
    /// Body carries typeinfo.
    Pub = 0x00,
    PubNoSer = 0x01,
}

impl PacketKind for PubSubKind {
    const UNKNOWN_POLICY: UnknownKindPolicy = UnknownKindPolicy::SkipLine;

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Pub),
            0x01 => Some(Self::PubNoSer),
            _ => None,
        }
    }

    fn as_byte(self) -> u8 {
        self as u8
    }
}

/// RPC kind namespace.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcKind {
    Call = 0x02,
    CallNoSer = 0x03,
    Resp = 0x04,
    RespNoSer = 0x05,
    ErrNotFound = 0x06,
}

impl PacketKind for RpcKind {
    const UNKNOWN_POLICY: UnknownKindPolicy = UnknownKindPolicy::Fatal;

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x02 => Some(Self::Call),
            0x03 => Some(Self::CallNoSer),
            0x04 => Some(Self::Resp),
            0x05 => Some(Self::RespNoSer),
            0x06 => Some(Self::ErrNotFound),
            _ => None,
        }
    }

    fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Frame a body: version byte, kind byte, JSON, line feed.
pub fn encode_packet<K: PacketKind, B: Serialize + ?Sized>(
    kind: K,
    body: &B,
) -> Result<Vec<u8>, CodecError> {
    let mut bytes = vec![PROTOCOL_VERSION, kind.as_byte()];
    serde_json::to_writer(&mut bytes, body).map_err(|e| CodecError::Encode(e.to_string()))?;
    bytes.push(LINE_FEED);
    Ok(bytes)
}

/// Run the codec over `args` if one is given. Returns typeinfo only when at
/// least one value needed encoding.
pub fn encode_args(codec: Option<&Codec>, args: &mut [Value]) -> Result<Option<Vec<Tag>>, CodecError> {
    match codec {
        Some(codec) if !args.is_empty() => {
            let typeinfo = codec.serialize(args)?;
            Ok((!typeinfo.is_empty()).then_some(typeinfo))
        }
        _ => Ok(None),
    }
}

pub fn encode_publish(
    event: &str,
    mut args: Vec<Value>,
    codec: Option<&Codec>,
) -> Result<Vec<u8>, CodecError> {
    match encode_args(codec, &mut args)? {
        Some(typeinfo) => encode_packet(PubSubKind::Pub, &(event, typeinfo, args)),
        None if args.is_empty() => encode_packet(PubSubKind::PubNoSer, &(event,)),
        None => encode_packet(PubSubKind::PubNoSer, &(event, args)),
    }
}

pub fn encode_call(
    id: u64,
    method: &str,
    mut args: Vec<Value>,
    codec: Option<&Codec>,
) -> Result<Vec<u8>, CodecError> {
    match encode_args(codec, &mut args)? {
        Some(typeinfo) => encode_packet(RpcKind::Call, &(id, method, typeinfo, args)),
        None if args.is_empty() => encode_packet(RpcKind::CallNoSer, &(id, method)),
        None => encode_packet(RpcKind::CallNoSer, &(id, method, args)),
    }
}

pub fn encode_response(
    id: u64,
    mut args: Vec<Value>,
    codec: Option<&Codec>,
) -> Result<Vec<u8>, CodecError> {
    match encode_args(codec, &mut args)? {
        Some(typeinfo) => encode_packet(RpcKind::Resp, &(id, typeinfo, args)),
        None if args.is_empty() => encode_packet(RpcKind::RespNoSer, &id),
        None => encode_packet(RpcKind::RespNoSer, &(id, args)),
    }
}

/// Not-found reply: bare id when a response was wanted, `[id, method]`
/// otherwise.
pub fn encode_not_found(id: u64, method: &str) -> Result<Vec<u8>, CodecError> {
    if id > 0 {
        encode_packet(RpcKind::ErrNotFound, &id)
    } else {
        encode_packet(RpcKind::ErrNotFound, &(id, method))
    }
}

/// Arguments exactly as they came off the wire, with their typeinfo.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WireArgs {
    pub typeinfo: Option<Vec<Tag>>,
    pub args: Vec<Value>,
}

impl WireArgs {
    /// Decode the arguments. Typeinfo is only honoured for serialized kinds.
    pub fn decode(self, codec: Option<&Codec>, serialized: bool) -> Vec<Value> {
        let mut args = self.args;
        if let (Some(codec), Some(typeinfo), true) = (codec, &self.typeinfo, serialized) {
            if !args.is_empty() {
                codec.deserialize(typeinfo, &mut args);
            }
        }
        args
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishBody {
    pub event: String,
    pub args: WireArgs,
}

impl PublishBody {
    pub fn parse(body: serde_json::Value) -> Result<Self, FrameError> {
        let mut items = into_array(body, "publish")?.into_iter();
        let event = match items.next() {
            Some(serde_json::Value::String(event)) => event,
            _ => return Err(malformed("publish body must start with an event name")),
        };
        let args = parse_args(items.collect(), "publish")?;
        Ok(Self { event, args })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallBody {
    pub id: u64,
    pub method: String,
    pub args: WireArgs,
}

impl CallBody {
    pub fn parse(body: serde_json::Value) -> Result<Self, FrameError> {
        let mut items = into_array(body, "call")?.into_iter();
        let id = items
            .next()
            .as_ref()
            .and_then(parse_id)
            .ok_or_else(|| malformed("call body must start with a call id"))?;
        let method = match items.next() {
            Some(serde_json::Value::String(method)) => method,
            _ => return Err(malformed("call body is missing the method name")),
        };
        let args = parse_args(items.collect(), "call")?;
        Ok(Self { id, method, args })
    }

    pub fn wants_response(&self) -> bool {
        self.id > 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseBody {
    pub id: u64,
    pub args: WireArgs,
}

impl ResponseBody {
    pub fn parse(body: serde_json::Value) -> Result<Self, FrameError> {
        if let Some(id) = parse_id(&body) {
            return Ok(Self {
                id,
                args: WireArgs::default(),
            });
        }
        let mut items = into_array(body, "response")?.into_iter();
        let id = items
            .next()
            .as_ref()
            .and_then(parse_id)
            .ok_or_else(|| malformed("response body must start with a call id"))?;
        let args = parse_args(items.collect(), "response")?;
        Ok(Self { id, args })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotFoundBody {
    /// The call that failed expected a response.
    Pending(u64),
    /// A call without response expectation named an unknown method.
    Notification { id: u64, method: String },
    Malformed,
}

impl NotFoundBody {
    pub fn parse(body: &serde_json::Value) -> Self {
        if let Some(id) = parse_id(body) {
            return Self::Pending(id);
        }
        match body.as_array().map(Vec::as_slice) {
            Some([id, serde_json::Value::String(method)]) => match parse_id(id) {
                Some(id) => Self::Notification {
                    id,
                    method: method.clone(),
                },
                None => Self::Malformed,
            },
            _ => Self::Malformed,
        }
    }
}

fn parse_id(value: &serde_json::Value) -> Option<u64> {
    let id = value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|n| *n >= 0.0 && n.fract() == 0.0 && *n <= MAX_SAFE_INTEGER)
            .map(|n| n as u64)
    })?;
    (id as f64 <= MAX_SAFE_INTEGER).then_some(id)
}

fn into_array(body: serde_json::Value, what: &str) -> Result<Vec<serde_json::Value>, FrameError> {
    match body {
        serde_json::Value::Array(items) => Ok(items),
        other => Err(malformed(&format!("{} body must be an array, got {}", what, other))),
    }
}

/// Interpret the tail after the leading fields: nothing, `[args]` or
/// `[typeinfo, args]`.
fn parse_args(tail: Vec<serde_json::Value>, what: &str) -> Result<WireArgs, FrameError> {
    let mut tail = tail.into_iter();
    match (tail.next(), tail.next(), tail.next()) {
        (None, _, _) => Ok(WireArgs::default()),
        (Some(args), None, _) => Ok(WireArgs {
            typeinfo: None,
            args: args_list(args, what)?,
        }),
        (Some(typeinfo), Some(args), None) => {
            let typeinfo = crate::typeinfo::tags_from_value(&Value::from(typeinfo))
                .ok_or_else(|| malformed(&format!("{} typeinfo must be an array", what)))?;
            Ok(WireArgs {
                typeinfo: Some(typeinfo),
                args: args_list(args, what)?,
            })
        }
        _ => Err(malformed(&format!("{} body has too many fields", what))),
    }
}

fn args_list(args: serde_json::Value, what: &str) -> Result<Vec<Value>, FrameError> {
    match Value::from(args) {
        Value::Array(items) => Ok(items),
        _ => Err(malformed(&format!("{} args must be an array", what))),
    }
}

fn malformed(reason: &str) -> FrameError {
    FrameError::MalformedBody(reason.to_string())
}
