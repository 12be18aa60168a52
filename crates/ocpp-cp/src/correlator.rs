//! # Message Correlator
//!
//! Matches outgoing Calls to their CallResult or CallError by unique id.
//! A pending entry is registered before the frame leaves, so a response can
//! never arrive ahead of its entry. The caller's task is the only one that
//! waits; inbound frames are handled on the transport's reader task.

use crate::error::{ChargePointError, ChargePointResult};
use crate::router::Router;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ocpp_messages::{CallErrorMessage, CallMessage, Message, OcppAction};
use ocpp_transport::{FrameHandler, Transport};
use ocpp_types::{CallErrorCode, MessageType, OcppError};
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default wait for a CallResult or CallError
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How the central system answered
#[derive(Debug)]
enum Response {
    Result(Value),
    Error {
        code: CallErrorCode,
        description: String,
    },
}

/// Entry in the pending table, keyed by unique id
#[derive(Debug)]
struct PendingRequest {
    action: String,
    sent_at: Instant,
    sent_at_utc: DateTime<Utc>,
    reply: oneshot::Sender<Response>,
}

/// Outstanding request, for introspection
#[derive(Debug, Clone, PartialEq)]
pub struct PendingInfo {
    /// Correlation id of the Call
    pub unique_id: String,
    /// Action name, e.g. `Heartbeat`
    pub action: String,
    /// When the frame was handed to the transport
    pub sent_at: DateTime<Utc>,
}

/// Request/response correlation over one transport
pub struct Correlator {
    transport: Arc<dyn Transport>,
    router: Arc<Router>,
    pending: DashMap<String, PendingRequest>,
    request_timeout: Duration,
    cancel: CancellationToken,
    connection_lost: CancellationToken,
}

impl Correlator {
    /// Create a correlator answering inbound Calls through `router`.
    /// Call [`Correlator::attach`] to start receiving frames.
    pub fn new(transport: Arc<dyn Transport>, router: Arc<Router>, request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            transport,
            router,
            pending: DashMap::new(),
            request_timeout,
            cancel: CancellationToken::new(),
            connection_lost: CancellationToken::new(),
        })
    }

    /// Register as the transport's inbound frame handler.
    ///
    /// The transport only holds a weak reference, so dropping the session
    /// frees the correlator even while the transport lives on.
    pub fn attach(self: &Arc<Self>) {
        self.transport.on_frame(Arc::new(Inbound(Arc::downgrade(self))));
    }

    /// Transport the frames go out on
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Wait applied to every outgoing Call
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Send a typed request and decode its typed response
    pub async fn call<A: OcppAction>(&self, request: &A) -> ChargePointResult<A::Response> {
        request.validate()?;
        let payload = serde_json::to_value(request)?;
        let response = self.send(A::ACTION_NAME, payload).await?;
        serde_json::from_value(response).map_err(|e| {
            ChargePointError::protocol(format!("invalid {} response: {e}", A::ACTION_NAME))
        })
    }

    /// Send a raw Call and wait for the matching response payload
    pub async fn send(&self, action: &str, payload: Value) -> ChargePointResult<Value> {
        let call = CallMessage {
            unique_id: Uuid::new_v4().to_string(),
            action: action.to_string(),
            payload,
        };
        self.send_call(call).await
    }

    async fn send_call(&self, call: CallMessage) -> ChargePointResult<Value> {
        let action = call.action.clone();
        if self.cancel.is_cancelled() {
            return Err(ChargePointError::cancelled(action));
        }

        let unique_id = call.unique_id.clone();
        let (reply, rx) = oneshot::channel();
        match self.pending.entry(unique_id.clone()) {
            Entry::Occupied(_) => {
                return Err(ChargePointError::protocol(format!(
                    "unique id {unique_id} already pending"
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingRequest {
                    action: action.clone(),
                    sent_at: Instant::now(),
                    sent_at_utc: Utc::now(),
                    reply,
                });
            }
        }

        debug!("Sending {} ({})", action, unique_id);
        if let Err(e) = self.transport.send_frame(Message::Call(call).to_frame()).await {
            self.pending.remove(&unique_id);
            warn!("Failed to send {}: {}", action, e);
            return Err(ChargePointError::connection_lost(e.to_string()));
        }

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(ChargePointError::cancelled(&action)),
            _ = self.connection_lost.cancelled() => {
                Err(ChargePointError::connection_lost(format!("connection lost waiting for {action}")))
            }
            response = tokio::time::timeout(self.request_timeout, rx) => match response {
                Ok(Ok(Response::Result(payload))) => Ok(payload),
                Ok(Ok(Response::Error { code, description })) => {
                    Err(ChargePointError::call_error(code, description))
                }
                Ok(Err(_)) => Err(ChargePointError::cancelled(&action)),
                Err(_) => {
                    warn!("{} ({}) timed out after {:?}", action, unique_id, self.request_timeout);
                    Err(ChargePointError::timeout(
                        &action,
                        self.request_timeout.as_millis() as u64,
                    ))
                }
            },
        };

        if outcome.is_err() {
            self.pending.remove(&unique_id);
        }
        outcome
    }

    fn take_pending(&self, unique_id: &str, kind: &str) -> Option<PendingRequest> {
        match self.pending.remove(unique_id) {
            Some((_, pending)) => {
                debug!(
                    "{} for {} ({}) after {:?}",
                    kind,
                    pending.action,
                    unique_id,
                    pending.sent_at.elapsed()
                );
                Some(pending)
            }
            None => {
                warn!("Dropping {} with no pending request: {}", kind, unique_id);
                None
            }
        }
    }

    /// Resolve a pending request with a CallResult payload.
    /// Returns false when nothing was waiting for `unique_id`.
    pub fn dispatch_result(&self, unique_id: &str, payload: Value) -> bool {
        let Some(pending) = self.take_pending(unique_id, "CallResult") else {
            return false;
        };
        if pending.reply.send(Response::Result(payload)).is_err() {
            debug!("Caller for {} already gave up", unique_id);
        }
        true
    }

    /// Resolve a pending request with a CallError
    pub fn dispatch_error(&self, unique_id: &str, code: CallErrorCode, description: String) -> bool {
        let Some(pending) = self.take_pending(unique_id, "CallError") else {
            return false;
        };
        if pending.reply.send(Response::Error { code, description }).is_err() {
            debug!("Caller for {} already gave up", unique_id);
        }
        true
    }

    /// Answer an inbound Call through the router and send the reply
    pub async fn dispatch_request(&self, call: CallMessage) {
        let reply = self.router.route(call).await;
        self.reply(reply).await;
    }

    async fn reply(&self, message: Message) {
        if let Err(e) = self.transport.send_frame(message.to_frame()).await {
            warn!("Failed to answer {}: {}", message.unique_id(), e);
        }
    }

    /// Parse one inbound frame and dispatch it
    pub async fn handle_frame(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!("{}", ChargePointError::protocol(format!("dropping non-JSON frame: {e}")));
                return;
            }
        };
        let is_call =
            value.get(0).and_then(Value::as_u64) == Some(u64::from(u8::from(MessageType::Call)));

        match Message::from_value(value) {
            Ok(Message::Call(call)) => self.dispatch_request(call).await,
            Ok(Message::CallResult(result)) => {
                self.dispatch_result(&result.unique_id, result.payload);
            }
            Ok(Message::CallError(err)) => {
                self.dispatch_error(&err.unique_id, err.error_code, err.error_description);
            }
            Err(OcppError::MalformedFrame {
                message,
                unique_id: Some(unique_id),
            }) if is_call => {
                warn!("Malformed Call {}: {}", unique_id, message);
                let reply = CallErrorMessage::new(unique_id, CallErrorCode::FormationViolation, message);
                self.reply(reply.into()).await;
            }
            Err(e) => warn!("{}", ChargePointError::protocol(format!("dropping frame: {e}"))),
        }
    }

    /// Number of Calls still waiting for an answer
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Outstanding Calls, oldest first
    pub fn pending(&self) -> Vec<PendingInfo> {
        let mut pending: Vec<_> = self
            .pending
            .iter()
            .map(|entry| PendingInfo {
                unique_id: entry.key().clone(),
                action: entry.action.clone(),
                sent_at: entry.sent_at_utc,
            })
            .collect();
        pending.sort_by_key(|info| info.sent_at);
        pending
    }

    /// Resolve every outstanding and future request as cancelled
    pub fn cancel_all(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Cancelling {} pending requests", self.pending.len());
        }
        self.cancel.cancel();
    }

    /// Whether [`Correlator::cancel_all`] has run
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes once the transport reports the link gone
    pub async fn connection_lost(&self) {
        self.connection_lost.cancelled().await
    }

    /// Whether the transport has reported a disconnect
    pub fn is_connection_lost(&self) -> bool {
        self.connection_lost.is_cancelled()
    }
}

struct Inbound(Weak<Correlator>);

#[async_trait]
impl FrameHandler for Inbound {
    async fn on_frame(&self, frame: String) {
        match self.0.upgrade() {
            Some(correlator) => correlator.handle_frame(&frame).await,
            None => debug!("Session gone, dropping frame"),
        }
    }

    async fn on_disconnect(&self, reason: String) {
        error!("Connection to central system lost: {}", reason);
        if let Some(correlator) = self.0.upgrade() {
            correlator.connection_lost.cancel();
        }
    }
}
