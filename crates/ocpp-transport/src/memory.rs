//! In-process transport
//!
//! [`MemoryTransport`] behaves like a connected socket whose far end is a
//! [`MemoryPeer`]. Frames sent by the charge point are queued for the peer;
//! frames injected by the peer are delivered to the registered handler
//! from a dedicated reader task, the same way the WebSocket adapter does.

use crate::{
    error::{TransportError, TransportResult},
    ConnectionState, FrameHandler, Transport,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

enum Inbound {
    Frame(String),
    Disconnect(String),
}

struct Shared {
    state: RwLock<ConnectionState>,
    handler: RwLock<Option<Arc<dyn FrameHandler>>>,
    sent: Mutex<Vec<String>>,
    outbound: mpsc::UnboundedSender<String>,
    connected_url: Mutex<Option<String>>,
}

/// Charge point side of an in-memory connection
pub struct MemoryTransport {
    shared: Arc<Shared>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Central system side of an in-memory connection
pub struct MemoryPeer {
    shared: Arc<Shared>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl MemoryTransport {
    /// Create a connected pair
    pub fn pair() -> (MemoryTransport, MemoryPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: RwLock::new(ConnectionState::Closed),
            handler: RwLock::new(None),
            sent: Mutex::new(Vec::new()),
            outbound: outbound_tx,
            connected_url: Mutex::new(None),
        });

        let transport = MemoryTransport {
            shared: shared.clone(),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            reader: Mutex::new(None),
        };
        let peer = MemoryPeer {
            shared,
            inbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
        };
        (transport, peer)
    }

    /// Every frame sent so far, oldest first
    pub fn sent_frames(&self) -> Vec<String> {
        self.shared.sent.lock().clone()
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, url: &str) -> TransportResult<()> {
        let Some(mut inbound_rx) = self.inbound_rx.lock().take() else {
            return Err(TransportError::ConnectionError {
                message: "in-memory transport cannot reconnect".to_string(),
            });
        };
        *self.shared.connected_url.lock() = Some(url.to_string());
        *self.shared.state.write() = ConnectionState::Connected;
        debug!("In-memory transport connected to {}", url);

        let shared = self.shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(inbound) = inbound_rx.recv().await {
                let handler = shared.handler.read().clone();
                match (inbound, handler) {
                    (Inbound::Frame(frame), Some(handler)) => handler.on_frame(frame).await,
                    (Inbound::Frame(_), None) => warn!("No frame handler registered, dropping frame"),
                    (Inbound::Disconnect(reason), handler) => {
                        *shared.state.write() = ConnectionState::Closed;
                        if let Some(handler) = handler {
                            handler.on_disconnect(reason).await;
                        }
                        break;
                    }
                }
            }
        });
        *self.reader.lock() = Some(reader);
        Ok(())
    }

    async fn send_frame(&self, frame: String) -> TransportResult<()> {
        let state = *self.shared.state.read();
        if state != ConnectionState::Connected {
            return Err(TransportError::NotReady { state });
        }
        self.shared.sent.lock().push(frame.clone());
        self.shared
            .outbound
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed {
                reason: "peer dropped".to_string(),
            })
    }

    fn on_frame(&self, handler: Arc<dyn FrameHandler>) {
        *self.shared.handler.write() = Some(handler);
    }

    async fn close(&self) -> TransportResult<()> {
        *self.shared.state.write() = ConnectionState::Closed;
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }
}

impl MemoryPeer {
    /// Deliver a frame to the charge point
    pub fn send(&self, frame: impl Into<String>) -> TransportResult<()> {
        self.inbound_tx
            .send(Inbound::Frame(frame.into()))
            .map_err(|_| TransportError::ConnectionClosed {
                reason: "transport dropped".to_string(),
            })
    }

    /// Next frame sent by the charge point, `None` once the transport is gone
    pub async fn recv(&self) -> Option<String> {
        self.outbound_rx.lock().await.recv().await
    }

    /// Simulate the link dropping from the far end
    pub fn disconnect(&self, reason: impl Into<String>) {
        *self.shared.state.write() = ConnectionState::Closed;
        // The reader task may already be gone; the state change is what matters then.
        let _ = self.inbound_tx.send(Inbound::Disconnect(reason.into()));
    }

    /// URL passed to `connect`, if it was called
    pub fn connected_url(&self) -> Option<String> {
        self.shared.connected_url.lock().clone()
    }
}
