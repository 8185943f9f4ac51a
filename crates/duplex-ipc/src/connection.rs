//! Drives an engine over an async byte stream.

use duplex_protocol::FrameError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::outbound::OutboundQueue;
use crate::IpcResult;

const READ_CHUNK_BYTES: usize = 16 * 1024;

/// The inbound half of an engine: bytes in, end of stream.
pub trait PacketSink: Send + Sync + 'static {
    /// Feed one chunk. An error means the stream faulted and no further
    /// input will be processed.
    fn write(&self, chunk: &[u8]) -> Result<(), FrameError>;

    /// The transport is gone.
    fn end(&self);
}

/// Run `sink` over `stream` until EOF, a read error or a fault.
///
/// Outbound packets are written by a separate task that drains `queue`.
/// On return the sink has been ended and the queue flushed.
pub async fn serve<S, P>(stream: S, sink: P, mut queue: OutboundQueue) -> IpcResult<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    P: PacketSink,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let writer_task = tokio::spawn(async move {
        while let Some(packet) = queue.recv().await {
            writer.write_all(&packet).await?;
            writer.flush().await?;
        }
        writer.shutdown().await
    });

    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let result = loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Peer closed the stream");
                break Ok(());
            }
            Ok(n) => {
                if let Err(e) = sink.write(&buf[..n]) {
                    break Err(e.into());
                }
            }
            Err(e) => break Err(e.into()),
        }
    };

    sink.end();

    match writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Writer stopped"),
        Err(e) => warn!(error = %e, "Writer task failed"),
    }

    result
}
