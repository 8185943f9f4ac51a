//! Wire layer for the duplex transport.
//!
//! This crate provides:
//! - The value model and type-preserving codec
//! - Typeinfo tags
//! - An incremental packet framer
//! - Packet kinds and body encoders/parsers
//!
//! Nothing in here performs I/O.

mod codec;
mod error;
mod framer;
mod packet;
mod typeinfo;
mod value;

pub use codec::{Codec, FunctionPolicy};
pub use error::{CodecError, FrameError};
pub use framer::{
    Feed, FrameEvent, Framer, FramerState, Packet, PacketKind, UnknownKindPolicy,
    DEFAULT_MAX_LINE_BYTES, LINE_FEED, PROTOCOL_VERSION,
};
pub use packet::{
    encode_args, encode_call, encode_not_found, encode_packet, encode_publish, encode_response,
    CallBody, NotFoundBody, PublishBody, PubSubKind, ResponseBody, RpcKind, WireArgs,
};
pub use typeinfo::{tags_from_value, tags_to_value, Tag, TypeKind};
pub use value::{
    format_date, parse_date, ErrorKind, ErrorValue, FunctionSource, RegExp, Value,
    MAX_SAFE_INTEGER,
};
