//! Pub/sub engine.
//!
//! [`PubSub::emit`] publishes to the peer only; inbound events are
//! dispatched to local listeners through [`PubSub::dispatch_local`]. The two
//! never call each other.
//!
//! Wildcard listeners see every inbound event together with its name. While
//! none are attached, dispatch skips the wildcard path entirely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use duplex_config::EngineOptions;
use duplex_protocol::{
    encode_publish, Codec, FrameError, FrameEvent, Framer, PubSubKind, PublishBody, Value,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::connection::PacketSink;
use crate::outbound::{Outbound, OutboundQueue};
use crate::{IpcError, IpcResult, LocalError};

const ERROR_CHANNEL_CAPACITY: usize = 64;

pub type Listener = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Receives the event name and its arguments.
///
/// The name is its own parameter rather than the first element of the
/// argument list, so listeners never need to split it back off.
pub type WildcardListener = Arc<dyn Fn(&str, &[Value]) + Send + Sync>;

/// Identifies one attached listener, for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    by_event: HashMap<String, Vec<(ListenerId, Listener)>>,
    wildcard: Vec<(ListenerId, WildcardListener)>,
}

struct Inner {
    options: EngineOptions,
    codec: Option<Codec>,
    outbound: Outbound,
    framer: Mutex<Framer<PubSubKind>>,
    listeners: RwLock<Listeners>,
    /// Mirrors `listeners.wildcard.len()`; only written under the write lock.
    wildcard_count: AtomicUsize,
    next_listener: AtomicU64,
    errors: broadcast::Sender<LocalError>,
    ended: AtomicBool,
}

/// Pub/sub engine handle. Clones share the same connection state.
#[derive(Clone)]
pub struct PubSub {
    inner: Arc<Inner>,
}

impl PubSub {
    pub fn new(options: EngineOptions) -> (Self, OutboundQueue) {
        let (outbound, queue) = Outbound::channel(options.high_water_mark);
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        let inner = Inner {
            codec: options.codec(),
            framer: Mutex::new(Framer::new(options.max_line_bytes)),
            options,
            outbound,
            listeners: RwLock::new(Listeners::default()),
            wildcard_count: AtomicUsize::new(0),
            next_listener: AtomicU64::new(1),
            errors,
            ended: AtomicBool::new(false),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            queue,
        )
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    /// Subscribe to local error events.
    pub fn errors(&self) -> broadcast::Receiver<LocalError> {
        self.inner.errors.subscribe()
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    /// Publish `event` to the peer. Local listeners are not called.
    /// Returns the outbound backpressure signal.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> IpcResult<bool> {
        if event.is_empty() {
            return Err(IpcError::InvalidArgument("event name is required".to_string()));
        }
        if self.is_ended() {
            return Err(IpcError::ConnectionClosed);
        }
        if self.inner.options.debug {
            debug!(event, args = ?args, "pubsub send");
        }
        let packet = encode_publish(event, args, self.inner.codec.as_ref())?;
        Ok(self.inner.outbound.push(packet))
    }

    /// Call local listeners for `event`, then wildcard listeners if any are
    /// attached. Returns true if at least one listener ran.
    pub fn dispatch_local(&self, event: &str, args: &[Value]) -> bool {
        let (direct, wildcard) = {
            let listeners = self.inner.listeners.read();
            let direct: Vec<Listener> = listeners
                .by_event
                .get(event)
                .map(|list| list.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default();
            let wildcard: Vec<WildcardListener> = if self.wildcard_count() > 0 {
                listeners.wildcard.iter().map(|(_, l)| l.clone()).collect()
            } else {
                Vec::new()
            };
            (direct, wildcard)
        };

        for listener in &direct {
            listener(args);
        }
        for listener in &wildcard {
            listener(event, args);
        }
        !direct.is_empty() || !wildcard.is_empty()
    }

    pub fn on<F>(&self, event: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner
            .listeners
            .write()
            .by_event
            .entry(event.into())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let Some(list) = listeners.by_event.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(listener_id, _)| *listener_id != id);
        let removed = list.len() < before;
        if list.is_empty() {
            listeners.by_event.remove(event);
        }
        removed
    }

    /// Remove every listener for `event`.
    pub fn off_all(&self, event: &str) -> usize {
        self.inner
            .listeners
            .write()
            .by_event
            .remove(event)
            .map_or(0, |list| list.len())
    }

    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str, &[Value]) + Send + Sync + 'static,
    {
        let id = self.next_id();
        let mut listeners = self.inner.listeners.write();
        listeners.wildcard.push((id, Arc::new(listener)));
        self.inner
            .wildcard_count
            .store(listeners.wildcard.len(), Ordering::Release);
        id
    }

    pub fn off_any(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.wildcard.len();
        listeners.wildcard.retain(|(listener_id, _)| *listener_id != id);
        self.inner
            .wildcard_count
            .store(listeners.wildcard.len(), Ordering::Release);
        listeners.wildcard.len() < before
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner
            .listeners
            .read()
            .by_event
            .get(event)
            .map_or(0, Vec::len)
    }

    pub fn wildcard_count(&self) -> usize {
        self.inner.wildcard_count.load(Ordering::Acquire)
    }

    /// Feed bytes from the transport. An error means the stream is faulted.
    pub fn write(&self, chunk: &[u8]) -> Result<(), FrameError> {
        let feed = self.inner.framer.lock().feed(chunk);

        for event in feed.events {
            match event {
                FrameEvent::Packet(packet) => self.handle_packet(packet.kind, packet.body),
                FrameEvent::SkippedKind(byte) => {
                    debug!(kind = byte, "Skipping packet with unknown kind");
                    self.report(LocalError::UnknownPacketKind(byte));
                }
            }
        }

        match feed.fault {
            Some(fault) => {
                warn!(error = %fault, "Pub/sub stream faulted");
                self.report(LocalError::Fault(fault.clone()));
                Err(fault)
            }
            None => Ok(()),
        }
    }

    /// Stop parsing and close the outbound queue. Listeners stay attached.
    pub fn end(&self) {
        if self.inner.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.framer.lock().close();
        self.inner.outbound.close();
        debug!("Pub/sub engine ended");
    }

    fn handle_packet(&self, kind: PubSubKind, body: serde_json::Value) {
        let publish = match PublishBody::parse(body) {
            Ok(publish) => publish,
            Err(e) => return self.report(LocalError::DroppedPacket(e)),
        };
        let args = publish
            .args
            .decode(self.inner.codec.as_ref(), kind == PubSubKind::Pub);
        if self.inner.options.debug {
            debug!(event = %publish.event, kind = ?kind, args = ?args, "pubsub recv");
        }
        self.dispatch_local(&publish.event, &args);
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed))
    }

    fn report(&self, error: LocalError) {
        debug!(error = %error, "Local error");
        let _ = self.inner.errors.send(error);
    }
}

impl PacketSink for PubSub {
    fn write(&self, chunk: &[u8]) -> Result<(), FrameError> {
        PubSub::write(self, chunk)
    }

    fn end(&self) {
        PubSub::end(self)
    }
}
