//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding arguments for the wire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Function-valued argument while the codec rejects function source.
    #[error("function-valued arguments are not accepted (function policy is reject)")]
    FunctionRejected,

    /// JSON encoding of a packet body failed.
    #[error("failed to encode packet body: {0}")]
    Encode(String),
}

/// Errors raised while parsing the inbound byte stream.
///
/// Everything except `MalformedBody` faults the stream it came from; a body
/// with the wrong shape only costs that one packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Unsupported packet version: {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid packet type: {0}")]
    UnsupportedKind(u8),

    #[error("packet line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("malformed packet JSON: {0}")]
    MalformedJson(String),

    /// Raised by the body parsers, not the framer.
    #[error("malformed packet body: {0}")]
    MalformedBody(String),
}
