//! Pub/sub and bidirectional RPC over any ordered byte stream.
//!
//! This crate provides:
//! - [`RpcEngine`]: method registry, outgoing calls, response correlation
//! - [`PubSub`]: network publish and local listener dispatch
//! - [`Outbound`]/[`OutboundQueue`]: non-blocking outbound packet queue
//! - [`serve`]: drive an engine over a tokio stream
//! - [`IpcServer`]/[`connect`]: Unix domain socket helpers
//!
//! Engines never read on their own; the transport feeds them through
//! `write` and tells them when it is gone through `end`.

mod connection;
mod error;
mod outbound;
mod pubsub;
mod rpc;
mod server;

pub use connection::{serve, PacketSink};
pub use error::{IpcError, IpcResult, LocalError, RpcError};
pub use outbound::{Outbound, OutboundQueue};
pub use pubsub::{Listener, ListenerId, PubSub, WildcardListener};
pub use rpc::{
    Callback, MethodHandler, RemoteMethod, Responder, RpcEngine, RpcMethod, MAX_CALL_ID,
};
pub use server::{connect, IpcServer};

pub use duplex_config::EngineOptions;
pub use duplex_protocol::{FunctionPolicy, Value};
