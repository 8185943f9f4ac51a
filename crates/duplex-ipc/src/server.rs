//! Unix domain socket server and client helpers.
//!
//! Every accepted connection gets its own engine from a factory closure and
//! is driven by [`serve`] on its own task. Engines that should share methods
//! are built that way by the factory.

use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::connection::{serve, PacketSink};
use crate::outbound::OutboundQueue;
use crate::{IpcError, IpcResult};

/// Server that listens on a Unix domain socket.
pub struct IpcServer {
    socket_path: PathBuf,
    shutdown_tx: broadcast::Sender<()>,
}

impl IpcServer {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            socket_path: socket_path.into(),
            shutdown_tx,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Get a shutdown receiver.
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Get a shutdown sender (for handlers that need to trigger shutdown).
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Trigger shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the socket, replacing a stale socket file.
    pub fn bind(&self) -> IpcResult<UnixListener> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "IPC server listening");
        Ok(listener)
    }

    /// Bind and serve until shutdown.
    pub async fn run<F, P>(&self, factory: F) -> IpcResult<()>
    where
        F: Fn() -> (P, OutboundQueue) + Send + Sync + 'static,
        P: PacketSink,
    {
        let listener = self.bind()?;
        self.run_with(listener, factory).await
    }

    /// Serve connections from an already bound listener until shutdown.
    pub async fn run_with<F, P>(&self, listener: UnixListener, factory: F) -> IpcResult<()>
    where
        F: Fn() -> (P, OutboundQueue) + Send + Sync + 'static,
        P: PacketSink,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            let (sink, queue) = factory();
                            debug!("Client connected");
                            tokio::spawn(async move {
                                match serve(stream, sink, queue).await {
                                    Ok(()) => debug!("Client disconnected"),
                                    Err(e) => error!(error = %e, "Connection error"),
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Accept error");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("IPC server shutting down");
                    break;
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);

        Ok(())
    }
}

/// Connect to a server and drive `sink` over the connection on a new task.
pub async fn connect<P: PacketSink>(
    socket_path: impl AsRef<Path>,
    sink: P,
    queue: OutboundQueue,
) -> IpcResult<JoinHandle<IpcResult<()>>> {
    let stream = UnixStream::connect(socket_path.as_ref())
        .await
        .map_err(|e| IpcError::Socket(format!("Failed to connect: {}", e)))?;
    Ok(tokio::spawn(serve(stream, sink, queue)))
}
