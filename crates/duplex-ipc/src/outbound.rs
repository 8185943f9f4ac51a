//! Outbound packet queue.
//!
//! Engines push encoded packets into an [`Outbound`]; whatever drives the
//! transport pulls them from the matching [`OutboundQueue`]. Pushing never
//! blocks. The return value of [`Outbound::push`] tells the caller whether
//! the queue is still below its high-water mark.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

struct Shared {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    queued: AtomicUsize,
    high_water_mark: usize,
}

/// Producer side. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct Outbound {
    shared: Arc<Shared>,
}

/// Consumer side.
pub struct OutboundQueue {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<Shared>,
}

impl Outbound {
    pub fn channel(high_water_mark: usize) -> (Outbound, OutboundQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            tx: Mutex::new(Some(tx)),
            queued: AtomicUsize::new(0),
            high_water_mark,
        });
        (
            Outbound {
                shared: shared.clone(),
            },
            OutboundQueue { rx, shared },
        )
    }

    /// Queue one packet. Returns `false` once queued bytes reach the
    /// high-water mark, or when the queue is closed.
    pub fn push(&self, packet: Vec<u8>) -> bool {
        let len = packet.len();
        let tx = self.shared.tx.lock();
        let Some(tx) = tx.as_ref() else {
            debug!(bytes = len, "Dropping packet, outbound queue closed");
            return false;
        };
        let queued = self.shared.queued.fetch_add(len, Ordering::AcqRel) + len;
        if tx.send(packet).is_err() {
            self.shared.queued.fetch_sub(len, Ordering::AcqRel);
            debug!(bytes = len, "Dropping packet, outbound consumer gone");
            return false;
        }
        queued < self.shared.high_water_mark
    }

    /// Signal end of stream. Packets already queued are still delivered.
    pub fn close(&self) {
        self.shared.tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.tx.lock().is_none()
    }

    pub fn queued_bytes(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    pub fn high_water_mark(&self) -> usize {
        self.shared.high_water_mark
    }
}

impl OutboundQueue {
    /// Next packet, or `None` once the producer side is closed and empty.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        let packet = self.rx.recv().await?;
        self.release(&packet);
        Some(packet)
    }

    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        let packet = self.rx.try_recv().ok()?;
        self.release(&packet);
        Some(packet)
    }

    /// Everything queued right now, concatenated.
    pub fn drain(&mut self) -> Vec<u8> {
        let mut bytes = Vec::new();
        while let Some(packet) = self.try_recv() {
            bytes.extend_from_slice(&packet);
        }
        bytes
    }

    pub fn queued_bytes(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    fn release(&self, packet: &[u8]) {
        self.shared.queued.fetch_sub(packet.len(), Ordering::AcqRel);
    }
}
