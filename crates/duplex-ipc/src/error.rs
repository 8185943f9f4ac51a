//! IPC error types.

use duplex_protocol::{CodecError, FrameError};
use thiserror::Error;

/// IPC error type.
#[derive(Error, Debug)]
pub enum IpcError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The inbound stream faulted
    #[error("Protocol error: {0}")]
    Frame(#[from] FrameError),

    /// Arguments could not be encoded
    #[error("Encode error: {0}")]
    Codec(#[from] CodecError),

    /// A call completed with an error
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Bad input at the call site (empty event or method name)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Socket error
    #[error("Socket error: {0}")]
    Socket(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias using IpcError.
pub type IpcResult<T> = Result<T, IpcError>;

/// Error handed to a call's response callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The peer has no method with this name.
    #[error("Invalid remote method: {0}")]
    InvalidRemoteMethod(String),

    /// The engine ended before a response arrived.
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Local error event raised by an engine.
///
/// Delivered through the engine's `errors()` channel; nothing is sent to the
/// peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocalError {
    /// The stream faulted; no further packets are processed.
    #[error("{0}")]
    Fault(FrameError),

    /// A packet had a body of the wrong shape and was dropped.
    #[error("Dropped packet: {0}")]
    DroppedPacket(FrameError),

    /// A fire-and-forget call named a method the peer does not have.
    #[error("Invalid remote method: {method}")]
    RemoteMethodNotFound { method: String },

    /// A not-found packet that is neither an id nor `[id, method]`.
    #[error("Malformed not-found packet: {0}")]
    MalformedNotFound(String),

    /// Pub/sub packet with a kind byte it does not know. The line is skipped.
    #[error("Invalid packet type: {0}")]
    UnknownPacketKind(u8),

    /// A response could not be encoded.
    #[error("Failed to encode response: {0}")]
    Codec(#[from] CodecError),
}

impl LocalError {
    /// True when the error ended packet processing on its stream.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fault(_))
    }
}
