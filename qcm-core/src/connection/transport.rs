use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};

use crate::error::TransportError;

/// Opaque byte-stream device carrying one control frame per read.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Wait for the next inbound frame. `Err(Closed)` on end of stream.
    async fn read(&self) -> Result<Bytes, TransportError>;
}

/// In-process transport backed by two unbounded queues.
pub struct MemoryTransport {
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

/// The modem side of a [`MemoryTransport`].
pub struct MemoryPeer {
    sent: mpsc::UnboundedReceiver<Bytes>,
    inject: Option<mpsc::UnboundedSender<Bytes>>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport {
                outbound: out_tx,
                inbound: Mutex::new(in_rx),
            },
            MemoryPeer {
                sent: out_rx,
                inject: Some(in_tx),
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    async fn read(&self) -> Result<Bytes, TransportError> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }
}

impl MemoryPeer {
    /// Next frame the host wrote, or `None` once the transport is dropped.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.sent.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.sent.try_recv().ok()
    }

    /// Deliver a frame to the host. Returns false after [`MemoryPeer::close`].
    pub fn inject(&self, frame: impl Into<Bytes>) -> bool {
        match &self.inject {
            Some(tx) => tx.send(frame.into()).is_ok(),
            None => false,
        }
    }

    /// Simulate the device going away: the host sees end of stream.
    pub fn close(&mut self) {
        self.inject = None;
    }
}
