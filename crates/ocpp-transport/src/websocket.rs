//! WebSocket transport over tokio-tungstenite
//!
//! After the handshake the stream is split. A writer task owns the sink and
//! drains an unbounded channel of outgoing messages, interleaving keepalive
//! pings. A reader task owns the stream and hands every text frame to the
//! registered [`FrameHandler`].

use crate::{
    error::{TransportError, TransportResult},
    utils, ConnectionState, FrameHandler, Transport, TransportConfig,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, Interval};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::WebSocketConfig,
        Message as WsMessage,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_GRACE: Duration = Duration::from_secs(5);

struct Shared {
    state: RwLock<ConnectionState>,
    handler: RwLock<Option<Arc<dyn FrameHandler>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    fn push(&self, message: WsMessage) -> bool {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }
}

#[derive(Default)]
struct Tasks {
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

/// Client side OCPP-J WebSocket connection
pub struct WebSocketTransport {
    config: TransportConfig,
    shared: Arc<Shared>,
    tasks: Mutex<Tasks>,
}

impl WebSocketTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Closed),
                handler: RwLock::new(None),
                outbound: Mutex::new(None),
            }),
            tasks: Mutex::new(Tasks::default()),
        }
    }

    fn websocket_config(&self) -> WebSocketConfig {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);
        ws_config.max_frame_size = Some(self.config.max_message_size);
        ws_config
    }

    fn fail(&self, err: TransportError) -> TransportError {
        self.shared.set_state(ConnectionState::Failed);
        err
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> TransportResult<()> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidUrl {
                message: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        info!("Connecting to WebSocket server: {}", url);
        self.shared.set_state(ConnectionState::Connecting);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| self.fail(e.into()))?;
        let protocols = HeaderValue::from_str(&self.config.sub_protocols.join(", ")).map_err(|e| {
            self.fail(TransportError::ConnectionError {
                message: format!("invalid subprotocol header: {e}"),
            })
        })?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", protocols);

        let (ws_stream, response) = timeout(
            self.config.connection_timeout,
            connect_async_with_config(request, Some(self.websocket_config()), false),
        )
        .await
        .map_err(|_| {
            self.fail(TransportError::Timeout {
                timeout_secs: self.config.connection_timeout.as_secs(),
            })
        })?
        .map_err(|e| self.fail(e.into()))?;

        let negotiated = response
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|value| value.to_str().ok());
        match negotiated {
            Some(protocol) if utils::validate_subprotocol(protocol) => {
                debug!("Negotiated subprotocol {}", protocol)
            }
            other => warn!("Server did not confirm ocpp1.6 subprotocol: {:?}", other),
        }

        let (sink, stream) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.outbound.lock() = Some(tx);

        let writer = tokio::spawn(write_loop(sink, rx, self.config.keep_alive_interval));
        let reader = tokio::spawn(read_loop(
            stream,
            self.shared.clone(),
            self.config.max_message_size,
        ));
        {
            let mut tasks = self.tasks.lock();
            tasks.writer = Some(writer);
            tasks.reader = Some(reader);
        }

        self.shared.set_state(ConnectionState::Connected);
        info!("WebSocket connection established");
        Ok(())
    }

    async fn send_frame(&self, frame: String) -> TransportResult<()> {
        if frame.len() > self.config.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: frame.len(),
                limit: self.config.max_message_size,
            });
        }
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(TransportError::NotReady { state });
        }

        debug!("Sending WebSocket message: {} bytes", frame.len());
        if self.shared.push(WsMessage::Text(frame)) {
            Ok(())
        } else {
            Err(TransportError::ConnectionClosed {
                reason: "writer task stopped".to_string(),
            })
        }
    }

    fn on_frame(&self, handler: Arc<dyn FrameHandler>) {
        *self.shared.handler.write() = Some(handler);
    }

    async fn close(&self) -> TransportResult<()> {
        if matches!(self.state(), ConnectionState::Closed) {
            return Ok(());
        }
        info!("Closing WebSocket connection");
        self.shared.set_state(ConnectionState::Closing);
        self.shared.push(WsMessage::Close(None));
        self.shared.outbound.lock().take();

        let (writer, reader) = {
            let mut tasks = self.tasks.lock();
            (tasks.writer.take(), tasks.reader.take())
        };
        if let Some(writer) = writer {
            if timeout(CLOSE_GRACE, writer).await.is_err() {
                warn!("Writer task did not finish within {:?}", CLOSE_GRACE);
            }
        }
        if let Some(reader) = reader {
            reader.abort();
        }

        self.shared.set_state(ConnectionState::Closed);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        for task in [tasks.writer.take(), tasks.reader.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<WsMessage>,
    keep_alive: Option<Duration>,
) {
    let mut ping = keep_alive.map(|period| tokio::time::interval_at(Instant::now() + period, period));

    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else { break };
                let closing = matches!(message, WsMessage::Close(_));
                if let Err(e) = sink.send(message).await {
                    warn!("WebSocket write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            _ = tick(&mut ping) => {
                debug!("Sending ping frame");
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new())).await {
                    warn!("Keepalive ping failed: {}", e);
                    break;
                }
            }
        }
    }

    if let Err(e) = sink.close().await {
        debug!("Sink close: {}", e);
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, shared: Arc<Shared>, limit: usize) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                if text.len() > limit {
                    warn!("Dropping {} byte frame, limit is {}", text.len(), limit);
                    continue;
                }
                debug!("Received WebSocket text message: {} bytes", text.len());
                let handler = shared.handler.read().clone();
                match handler {
                    Some(handler) => handler.on_frame(text).await,
                    None => warn!("No frame handler registered, dropping frame"),
                }
            }
            Some(Ok(WsMessage::Ping(data))) => {
                debug!("Received ping, sending pong");
                shared.push(WsMessage::Pong(data));
            }
            Some(Ok(WsMessage::Pong(_))) => debug!("Received pong"),
            Some(Ok(WsMessage::Binary(data))) => {
                warn!("Received unexpected binary message: {} bytes", data.len())
            }
            Some(Ok(WsMessage::Close(frame))) => {
                info!("Received close frame: {:?}", frame);
                break frame
                    .map(|f| f.reason.to_string())
                    .unwrap_or_else(|| "closed by peer".to_string());
            }
            Some(Ok(WsMessage::Frame(_))) => {}
            Some(Err(e)) => break e.to_string(),
            None => break "stream ended".to_string(),
        }
    };

    let closed_locally = matches!(
        *shared.state.read(),
        ConnectionState::Closing | ConnectionState::Closed
    );
    shared.outbound.lock().take();
    shared.set_state(ConnectionState::Closed);

    if !closed_locally {
        warn!("WebSocket connection lost: {}", reason);
        let handler = shared.handler.read().clone();
        if let Some(handler) = handler {
            handler.on_disconnect(reason).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_non_websocket_scheme() {
        let transport = WebSocketTransport::default();
        let err = transport.connect("http://localhost:8080/ocpp").await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl { .. }));
        assert_eq!(transport.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_rejects_unparseable_url() {
        let transport = WebSocketTransport::default();
        assert!(matches!(
            transport.connect("::not a url::").await,
            Err(TransportError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let transport = WebSocketTransport::default();
        let err = transport.send_frame("[]".to_string()).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::NotReady {
                state: ConnectionState::Closed
            }
        ));
    }

    #[tokio::test]
    async fn test_send_rejects_oversized_frame() {
        let transport = WebSocketTransport::new(TransportConfig {
            max_message_size: 8,
            ..Default::default()
        });
        let err = transport.send_frame("x".repeat(9)).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::MessageTooLarge { size: 9, limit: 8 }
        ));
    }

    #[tokio::test]
    async fn test_close_when_never_connected() {
        let transport = WebSocketTransport::default();
        assert!(transport.close().await.is_ok());
        assert_eq!(transport.state(), ConnectionState::Closed);
    }
}
