//! # OCPP Transport
//!
//! Frame transport for OCPP-J. The charge point core only needs four
//! primitives from a connection: connect, send a text frame, register an
//! inbound frame handler, and close. [`Transport`] captures exactly that;
//! [`websocket::WebSocketTransport`] implements it over tokio-tungstenite
//! and [`memory::MemoryTransport`] implements it in process for tests and
//! dry runs.

pub mod error;
pub mod memory;
pub mod websocket;

pub use error::*;
pub use memory::{MemoryPeer, MemoryTransport};
pub use websocket::WebSocketTransport;

use std::sync::Arc;
use std::time::Duration;

/// OCPP 1.6J WebSocket subprotocol
pub const OCPP16_SUBPROTOCOL: &str = "ocpp1.6";

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum inbound or outbound frame size in bytes
    pub max_message_size: usize,
    /// Handshake timeout
    pub connection_timeout: Duration,
    /// WebSocket ping interval, `None` disables keepalive
    pub keep_alive_interval: Option<Duration>,
    /// Subprotocols offered during the handshake
    pub sub_protocols: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: 65536, // 64KB
            connection_timeout: Duration::from_secs(30),
            keep_alive_interval: Some(Duration::from_secs(60)),
            sub_protocols: vec![OCPP16_SUBPROTOCOL.to_string()],
        }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closing,
    Closed,
    Failed,
}

/// Receiver of inbound text frames.
///
/// Frames are delivered one at a time from the transport's reader task, in
/// arrival order.
#[async_trait::async_trait]
pub trait FrameHandler: Send + Sync {
    /// Called once per inbound text frame
    async fn on_frame(&self, frame: String);

    /// Called once when the connection ends without a local `close`
    async fn on_disconnect(&self, _reason: String) {}
}

/// Bidirectional text-frame connection to the central system
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection to `url`
    async fn connect(&self, url: &str) -> TransportResult<()>;

    /// Send one text frame
    async fn send_frame(&self, frame: String) -> TransportResult<()>;

    /// Register the inbound frame handler, replacing any previous one
    fn on_frame(&self, handler: Arc<dyn FrameHandler>);

    /// Close the connection
    async fn close(&self) -> TransportResult<()>;

    /// Current connection state
    fn state(&self) -> ConnectionState;
}

/// Utility functions
pub mod utils {
    /// Build the charge point endpoint: OCPP-J appends the charge point
    /// identity as the last path segment.
    pub fn create_websocket_url(base_url: &str, charge_point_id: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), charge_point_id)
    }

    pub fn validate_subprotocol(protocol: &str) -> bool {
        protocol == super::OCPP16_SUBPROTOCOL
    }
}
