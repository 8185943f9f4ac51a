//! Bidirectional RPC engine.
//!
//! Either side may register methods and call the other side's methods over
//! the same stream. Calls that want a response get a nonzero call id and a
//! pending-table entry; the matching `RESP` or `ERR_NOTFOUND` packet removes
//! the entry and runs the callback. Call id `0` is fire-and-forget.
//!
//! ## Call ids
//!
//! Ids start at 1 and wrap back to 1 when they reach 2^53, so they stay
//! exact for peers that store numbers as doubles. Reservation skips any id
//! that is still pending. There are no call timeouts: a call stays pending
//! until it is answered or the engine ends.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use duplex_config::EngineOptions;
use duplex_protocol::{
    encode_call, encode_not_found, encode_response, CallBody, Codec, CodecError, FrameError,
    FrameEvent, Framer, NotFoundBody, ResponseBody, RpcKind, Value,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use crate::connection::PacketSink;
use crate::outbound::{Outbound, OutboundQueue};
use crate::{IpcError, IpcResult, LocalError, RpcError};

/// Exclusive upper bound for call ids.
pub const MAX_CALL_ID: u64 = 1 << 53;

const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Response callback for a call.
pub type Callback = Box<dyn FnOnce(Result<Vec<Value>, RpcError>) + Send>;

/// A registered method. Receives the invocation context, the decoded
/// arguments and, when the caller wants one, a [`Responder`].
pub type MethodHandler<C> = Arc<dyn Fn(&C, Vec<Value>, Option<Responder>) + Send + Sync>;

/// A method paired with the name it is registered under.
pub struct RpcMethod<C> {
    pub name: String,
    pub handler: MethodHandler<C>,
}

impl<C> RpcMethod<C> {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&C, Vec<Value>, Option<Responder>) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
        }
    }
}

impl<C> Clone for RpcMethod<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            handler: self.handler.clone(),
        }
    }
}

/// Sends the response for one inbound call.
///
/// Nothing stops a handler from responding twice; each call to
/// [`Responder::respond`] writes another packet.
#[derive(Clone)]
pub struct Responder {
    id: u64,
    outbound: Outbound,
    codec: Option<Codec>,
    debug: bool,
    errors: broadcast::Sender<LocalError>,
}

impl Responder {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send `results` back to the caller. Returns the backpressure signal.
    pub fn respond(&self, results: Vec<Value>) -> Result<bool, CodecError> {
        if self.debug {
            debug!(id = self.id, args = ?results, "rpc send response");
        }
        let packet = encode_response(self.id, results, self.codec.as_ref())?;
        Ok(self.outbound.push(packet))
    }

    /// Like [`Responder::respond`], reporting an encode failure as a local
    /// error event instead of returning it.
    pub fn respond_or_report(&self, results: Vec<Value>) {
        if let Err(e) = self.respond(results) {
            warn!(id = self.id, error = %e, "Failed to send response");
            let _ = self.errors.send(LocalError::Codec(e));
        }
    }
}

struct PendingCall {
    method: String,
    callback: Callback,
}

struct CallState {
    next_id: u64,
    pending: HashMap<u64, PendingCall>,
}

impl CallState {
    fn reserve(&mut self) -> u64 {
        loop {
            let id = self.next_id;
            self.next_id = if id + 1 >= MAX_CALL_ID { 1 } else { id + 1 };
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }
}

struct Inner<C> {
    options: EngineOptions,
    codec: Option<Codec>,
    context: C,
    outbound: Outbound,
    framer: Mutex<Framer<RpcKind>>,
    calls: Mutex<CallState>,
    methods: RwLock<HashMap<String, MethodHandler<C>>>,
    errors: broadcast::Sender<LocalError>,
    ended: AtomicBool,
}

/// RPC engine handle. Clones share the same connection state.
pub struct RpcEngine<C = ()> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for RpcEngine<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl RpcEngine<()> {
    pub fn new(options: EngineOptions) -> (Self, OutboundQueue) {
        Self::with_context(options, ())
    }
}

impl<C: Send + Sync + 'static> RpcEngine<C> {
    /// Create an engine whose methods are invoked with `context`.
    pub fn with_context(options: EngineOptions, context: C) -> (Self, OutboundQueue) {
        let (outbound, queue) = Outbound::channel(options.high_water_mark);
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        let inner = Inner {
            codec: options.codec(),
            framer: Mutex::new(Framer::new(options.max_line_bytes)),
            options,
            context,
            outbound,
            calls: Mutex::new(CallState {
                next_id: 1,
                pending: HashMap::new(),
            }),
            methods: RwLock::new(HashMap::new()),
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

    pub fn context(&self) -> &C {
        &self.inner.context
    }

    /// Subscribe to local error events.
    pub fn errors(&self) -> broadcast::Receiver<LocalError> {
        self.inner.errors.subscribe()
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.calls.lock().pending.len()
    }

    // ------------------------------------------------------------------
    // Outgoing calls
    // ------------------------------------------------------------------

    /// Call `method` on the peer. With a callback the call gets an id and
    /// the callback runs once with the result; without one it is sent with
    /// id `0` and nothing comes back.
    ///
    /// Returns the outbound backpressure signal.
    pub fn send(
        &self,
        method: &str,
        args: Vec<Value>,
        callback: Option<Callback>,
    ) -> IpcResult<bool> {
        if method.is_empty() {
            return Err(IpcError::InvalidArgument("method name is required".to_string()));
        }
        if self.is_ended() {
            return Err(IpcError::ConnectionClosed);
        }

        let id = match callback {
            Some(callback) => {
                let mut calls = self.inner.calls.lock();
                // end() drains under this lock after setting the flag.
                if self.is_ended() {
                    return Err(IpcError::ConnectionClosed);
                }
                let id = calls.reserve();
                calls.pending.insert(
                    id,
                    PendingCall {
                        method: method.to_string(),
                        callback,
                    },
                );
                id
            }
            None => 0,
        };

        if self.inner.options.debug {
            debug!(id, method, args = ?args, "rpc send call");
        }

        let packet = match encode_call(id, method, args, self.inner.codec.as_ref()) {
            Ok(packet) => packet,
            Err(e) => {
                if id > 0 {
                    self.inner.calls.lock().pending.remove(&id);
                }
                return Err(e.into());
            }
        };
        Ok(self.inner.outbound.push(packet))
    }

    /// Fire-and-forget call.
    pub fn notify(&self, method: &str, args: Vec<Value>) -> IpcResult<bool> {
        self.send(method, args, None)
    }

    /// Call `method` and wait for its result.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> IpcResult<Vec<Value>> {
        let (tx, rx) = oneshot::channel();
        self.send(
            method,
            args,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        )?;
        match rx.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(IpcError::ConnectionClosed),
        }
    }

    /// Handle for calling one remote method by name.
    pub fn invoke(&self, method: impl Into<String>) -> RemoteMethod<C> {
        RemoteMethod {
            engine: self.clone(),
            method: method.into(),
        }
    }

    // ------------------------------------------------------------------
    // Method registry
    // ------------------------------------------------------------------

    /// Register `handler` under `name`. A later registration under the same
    /// name replaces it. Returns the stored handler so it can be removed by
    /// identity later.
    pub fn register<F>(&self, name: impl Into<String>, handler: F) -> IpcResult<MethodHandler<C>>
    where
        F: Fn(&C, Vec<Value>, Option<Responder>) + Send + Sync + 'static,
    {
        let handler: MethodHandler<C> = Arc::new(handler);
        self.register_handler(name, handler.clone())?;
        Ok(handler)
    }

    pub fn register_handler(
        &self,
        name: impl Into<String>,
        handler: MethodHandler<C>,
    ) -> IpcResult<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(IpcError::InvalidArgument(
                "cannot register an anonymous method".to_string(),
            ));
        }
        debug!(method = %name, "Registering method");
        self.inner.methods.write().insert(name, handler);
        Ok(())
    }

    pub fn register_method(&self, method: RpcMethod<C>) -> IpcResult<()> {
        self.register_handler(method.name, method.handler)
    }

    /// Register several methods under their own names. Nothing is registered
    /// if any name is empty.
    pub fn register_methods(&self, methods: impl IntoIterator<Item = RpcMethod<C>>) -> IpcResult<()> {
        let methods: Vec<_> = methods.into_iter().collect();
        if methods.iter().any(|m| m.name.is_empty()) {
            return Err(IpcError::InvalidArgument(
                "cannot register an anonymous method".to_string(),
            ));
        }
        let mut registry = self.inner.methods.write();
        for method in methods {
            registry.insert(method.name, method.handler);
        }
        Ok(())
    }

    /// Register a name to handler mapping.
    pub fn register_map<N>(
        &self,
        methods: impl IntoIterator<Item = (N, MethodHandler<C>)>,
    ) -> IpcResult<()>
    where
        N: Into<String>,
    {
        self.register_methods(
            methods
                .into_iter()
                .map(|(name, handler)| RpcMethod {
                    name: name.into(),
                    handler,
                }),
        )
    }

    /// Register a synchronous method whose return value is the response.
    pub fn register_fn<F>(&self, name: impl Into<String>, f: F) -> IpcResult<MethodHandler<C>>
    where
        F: Fn(&C, Vec<Value>) -> Vec<Value> + Send + Sync + 'static,
    {
        self.register(name, move |ctx, args, responder| {
            let results = f(ctx, args);
            if let Some(responder) = responder {
                responder.respond_or_report(results);
            }
        })
    }

    /// Register a method that runs as a spawned task. Must be called from
    /// inside a tokio runtime when the method is invoked.
    pub fn register_async<F, Fut>(&self, name: impl Into<String>, f: F) -> IpcResult<MethodHandler<C>>
    where
        F: Fn(&C, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<Value>> + Send + 'static,
    {
        self.register(name, move |ctx, args, responder| {
            let fut = f(ctx, args);
            tokio::spawn(async move {
                let results = fut.await;
                if let Some(responder) = responder {
                    responder.respond_or_report(results);
                }
            });
        })
    }

    /// Remove the method registered under `name`.
    pub fn unregister(&self, name: &str) -> bool {
        self.inner.methods.write().remove(name).is_some()
    }

    /// Remove every name `handler` is registered under. Returns how many
    /// entries were removed.
    pub fn unregister_handler(&self, handler: &MethodHandler<C>) -> usize {
        let mut registry = self.inner.methods.write();
        let before = registry.len();
        registry.retain(|_, registered| !Arc::ptr_eq(registered, handler));
        before - registry.len()
    }

    /// Remove each method if it is still registered under its name.
    pub fn unregister_methods<'a>(&self, methods: impl IntoIterator<Item = &'a RpcMethod<C>>) -> usize
    where
        C: 'a,
    {
        let mut registry = self.inner.methods.write();
        let mut removed = 0;
        for method in methods {
            let matches = registry
                .get(&method.name)
                .is_some_and(|registered| Arc::ptr_eq(registered, &method.handler));
            if matches {
                registry.remove(&method.name);
                removed += 1;
            }
        }
        removed
    }

    /// Remove every name in the mapping that still maps to its handler.
    pub fn unregister_map<'a>(
        &self,
        methods: impl IntoIterator<Item = (&'a str, &'a MethodHandler<C>)>,
    ) -> usize
    where
        C: 'a,
    {
        let mut registry = self.inner.methods.write();
        let mut removed = 0;
        for (name, handler) in methods {
            let matches = registry
                .get(name)
                .is_some_and(|registered| Arc::ptr_eq(registered, handler));
            if matches {
                registry.remove(name);
                removed += 1;
            }
        }
        removed
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.inner.methods.read().contains_key(name)
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.methods.read().keys().cloned().collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Feed bytes from the transport. Packets are handled in order before
    /// this returns. An error means the stream is faulted.
    pub fn write(&self, chunk: &[u8]) -> Result<(), FrameError> {
        let feed = self.inner.framer.lock().feed(chunk);

        for event in feed.events {
            match event {
                FrameEvent::Packet(packet) => self.handle_packet(packet.kind, packet.body),
                // RPC kinds are fatal, the framer never skips them.
                FrameEvent::SkippedKind(byte) => self.report(LocalError::UnknownPacketKind(byte)),
            }
        }

        match feed.fault {
            Some(fault) => {
                warn!(error = %fault, "RPC stream faulted");
                self.report(LocalError::Fault(fault.clone()));
                Err(fault)
            }
            None => Ok(()),
        }
    }

    /// Tear down: stop parsing, close the outbound queue and fail every
    /// pending call with [`RpcError::ConnectionClosed`].
    pub fn end(&self) {
        if self.inner.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.framer.lock().close();
        self.inner.outbound.close();

        let pending: Vec<_> = self.inner.calls.lock().pending.drain().collect();
        debug!(pending = pending.len(), "RPC engine ended");
        for (_, call) in pending {
            (call.callback)(Err(RpcError::ConnectionClosed));
        }
    }

    fn handle_packet(&self, kind: RpcKind, body: serde_json::Value) {
        match kind {
            RpcKind::Call | RpcKind::CallNoSer => match CallBody::parse(body) {
                Ok(call) => self.handle_call(kind, call),
                Err(e) => self.report(LocalError::DroppedPacket(e)),
            },
            RpcKind::Resp | RpcKind::RespNoSer => match ResponseBody::parse(body) {
                Ok(response) => self.handle_response(kind, response),
                Err(e) => self.report(LocalError::DroppedPacket(e)),
            },
            RpcKind::ErrNotFound => self.handle_not_found(&body),
        }
    }

    fn handle_call(&self, kind: RpcKind, call: CallBody) {
        let CallBody { id, method, args } = call;
        let args = args.decode(self.inner.codec.as_ref(), kind == RpcKind::Call);
        if self.inner.options.debug {
            debug!(id, method = %method, kind = ?kind, args = ?args, "rpc recv");
        }

        let handler = self.inner.methods.read().get(&method).cloned();
        let Some(handler) = handler else {
            debug!(id, method = %method, "Call to unknown method");
            if !self.inner.options.ignore_invalid_call {
                self.send_not_found(id, &method);
            }
            return;
        };

        let responder = (id > 0).then(|| Responder {
            id,
            outbound: self.inner.outbound.clone(),
            codec: self.inner.codec,
            debug: self.inner.options.debug,
            errors: self.inner.errors.clone(),
        });
        handler(&self.inner.context, args, responder);
    }

    fn send_not_found(&self, id: u64, method: &str) {
        if self.inner.options.debug {
            debug!(id, method, "rpc send not-found");
        }
        match encode_not_found(id, method) {
            Ok(packet) => {
                self.inner.outbound.push(packet);
            }
            Err(e) => self.report(LocalError::Codec(e)),
        }
    }

    fn handle_response(&self, kind: RpcKind, response: ResponseBody) {
        let ResponseBody { id, args } = response;
        if id == 0 {
            debug!("Ignoring response with call id 0");
            return;
        }
        let Some(call) = self.inner.calls.lock().pending.remove(&id) else {
            debug!(id, "Dropping response for unknown call id");
            return;
        };
        let args = args.decode(self.inner.codec.as_ref(), kind == RpcKind::Resp);
        if self.inner.options.debug {
            debug!(id, method = %call.method, kind = ?kind, args = ?args, "rpc recv");
        }
        (call.callback)(Ok(args));
    }

    fn handle_not_found(&self, body: &serde_json::Value) {
        match NotFoundBody::parse(body) {
            NotFoundBody::Pending(id) => {
                let call = self.inner.calls.lock().pending.remove(&id);
                match call {
                    Some(call) => {
                        debug!(id, method = %call.method, "Remote method not found");
                        (call.callback)(Err(RpcError::InvalidRemoteMethod(call.method)));
                    }
                    None => debug!(id, "Dropping not-found for unknown call id"),
                }
            }
            NotFoundBody::Notification { method, .. } => {
                self.report(LocalError::RemoteMethodNotFound { method });
            }
            NotFoundBody::Malformed => {
                self.report(LocalError::MalformedNotFound(body.to_string()));
            }
        }
    }

    fn report(&self, error: LocalError) {
        debug!(error = %error, "Local error");
        let _ = self.inner.errors.send(error);
    }

    #[cfg(test)]
    pub(crate) fn set_next_id(&self, id: u64) {
        self.inner.calls.lock().next_id = id;
    }
}

impl<C: Send + Sync + 'static> PacketSink for RpcEngine<C> {
    fn write(&self, chunk: &[u8]) -> Result<(), FrameError> {
        RpcEngine::write(self, chunk)
    }

    fn end(&self) {
        RpcEngine::end(self)
    }
}

/// A remote method bound to an engine.
pub struct RemoteMethod<C = ()> {
    engine: RpcEngine<C>,
    method: String,
}

impl<C: Send + Sync + 'static> RemoteMethod<C> {
    pub fn name(&self) -> &str {
        &self.method
    }

    pub async fn call(&self, args: Vec<Value>) -> IpcResult<Vec<Value>> {
        self.engine.call(&self.method, args).await
    }

    pub fn call_with<F>(&self, args: Vec<Value>, callback: F) -> IpcResult<bool>
    where
        F: FnOnce(Result<Vec<Value>, RpcError>) + Send + 'static,
    {
        self.engine.send(&self.method, args, Some(Box::new(callback)))
    }

    pub fn notify(&self, args: Vec<Value>) -> IpcResult<bool> {
        self.engine.notify(&self.method, args)
    }
}
