//! In-process central system
//!
//! Answers the charge point's requests over a [`MemoryPeer`] so a session
//! can run without a server: used by `ocpp-cp run --dry-run` and by the
//! session tests.

use chrono::Utc;
use ocpp_messages::v16j::*;
use ocpp_messages::{CallErrorMessage, CallMessage, CallResultMessage, Message, OcppAction, OcppResult};
use ocpp_transport::MemoryPeer;
use ocpp_types::v16j::{AuthorizationStatus, IdTagInfo, RegistrationStatus};
use ocpp_types::CallErrorCode;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Final answer to BootNotification
    pub boot_status: RegistrationStatus,
    /// BootNotifications answered Pending before `boot_status`
    pub pending_boots: u32,
    pub heartbeat_interval: i32,
    /// Status for Authorize and StartTransaction
    pub authorization: AuthorizationStatus,
    pub first_transaction_id: i32,
    /// Actions recorded but never answered
    pub silent_actions: Vec<String>,
    /// Actions answered with an InternalError CallError
    pub failing_actions: Vec<String>,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            boot_status: RegistrationStatus::Accepted,
            pending_boots: 0,
            heartbeat_interval: 300,
            authorization: AuthorizationStatus::Accepted,
            first_transaction_id: 1,
            silent_actions: Vec::new(),
            failing_actions: Vec::new(),
        }
    }
}

pub struct LoopbackCentralSystem {
    options: LoopbackOptions,
    boots: AtomicU32,
    next_transaction_id: AtomicI32,
    received: Mutex<Vec<CallMessage>>,
    replies: Mutex<Vec<Message>>,
}

impl LoopbackCentralSystem {
    pub fn new(options: LoopbackOptions) -> Arc<Self> {
        Arc::new(Self {
            next_transaction_id: AtomicI32::new(options.first_transaction_id),
            options,
            boots: AtomicU32::new(0),
            received: Mutex::new(Vec::new()),
            replies: Mutex::new(Vec::new()),
        })
    }

    /// Serve `peer` until the charge point side goes away
    pub fn spawn(self: &Arc<Self>, peer: Arc<MemoryPeer>) -> JoinHandle<()> {
        let csms = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = peer.recv().await {
                match Message::parse(&frame) {
                    Ok(Message::Call(call)) => {
                        let silent = csms.options.silent_actions.contains(&call.action);
                        let answer = csms.answer(&call);
                        csms.received.lock().push(call);
                        if silent {
                            continue;
                        }
                        if peer.send(answer.to_frame()).is_err() {
                            break;
                        }
                    }
                    Ok(reply) => {
                        debug!("Loopback got reply {}", reply.unique_id());
                        csms.replies.lock().push(reply);
                    }
                    Err(e) => warn!("Loopback dropping frame: {}", e),
                }
            }
        })
    }

    /// Requests received so far, oldest first
    pub fn received(&self) -> Vec<CallMessage> {
        self.received.lock().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.received.lock().iter().map(|call| call.action.clone()).collect()
    }

    /// Charge point answers to requests injected through the peer
    pub fn replies(&self) -> Vec<Message> {
        self.replies.lock().clone()
    }

    pub fn answer(&self, call: &CallMessage) -> Message {
        if self.options.failing_actions.contains(&call.action) {
            return CallErrorMessage::new(
                &call.unique_id,
                CallErrorCode::InternalError,
                format!("{} failed", call.action),
            )
            .into();
        }
        let answered = match call.action.as_str() {
            "Authorize" => self.authorize(call),
            "BootNotification" => self.boot_notification(call),
            "Heartbeat" => reply::<HeartbeatRequest>(
                call,
                &HeartbeatResponse {
                    current_time: Utc::now(),
                },
            ),
            "MeterValues" => self.meter_values(call),
            "StartTransaction" => self.start_transaction(call),
            "StatusNotification" => self.status_notification(call),
            "StopTransaction" => self.stop_transaction(call),
            other => {
                return CallErrorMessage::new(
                    &call.unique_id,
                    CallErrorCode::NotImplemented,
                    format!("action '{other}' is not implemented"),
                )
                .into()
            }
        };

        answered.unwrap_or_else(|e| {
            CallErrorMessage::new(&call.unique_id, CallErrorCode::FormationViolation, e.to_string()).into()
        })
    }

    fn id_tag_info(&self) -> IdTagInfo {
        IdTagInfo {
            status: self.options.authorization,
            ..IdTagInfo::accepted()
        }
    }

    fn authorize(&self, call: &CallMessage) -> OcppResult<Message> {
        let request: AuthorizeRequest = call.payload_as()?;
        info!("Loopback authorizing {}", request.id_tag);
        reply::<AuthorizeRequest>(
            call,
            &AuthorizeResponse {
                id_tag_info: self.id_tag_info(),
            },
        )
    }

    fn boot_notification(&self, call: &CallMessage) -> OcppResult<Message> {
        let request: BootNotificationRequest = call.payload_as()?;
        let seen = self.boots.fetch_add(1, Ordering::SeqCst);
        let status = if seen < self.options.pending_boots {
            RegistrationStatus::Pending
        } else {
            self.options.boot_status
        };
        info!(
            "Loopback boot from {}/{}: {:?}",
            request.charge_point_vendor, request.charge_point_model, status
        );
        reply::<BootNotificationRequest>(
            call,
            &BootNotificationResponse {
                current_time: Utc::now(),
                interval: self.options.heartbeat_interval,
                status,
            },
        )
    }

    fn meter_values(&self, call: &CallMessage) -> OcppResult<Message> {
        let request: MeterValuesRequest = call.payload_as()?;
        debug!(
            "Loopback meter values for connector {} (tx: {:?})",
            request.connector_id, request.transaction_id
        );
        reply::<MeterValuesRequest>(call, &MeterValuesResponse {})
    }

    fn start_transaction(&self, call: &CallMessage) -> OcppResult<Message> {
        let request: StartTransactionRequest = call.payload_as()?;
        let transaction_id = self.next_transaction_id.fetch_add(1, Ordering::SeqCst);
        info!(
            "Loopback transaction {} on connector {} for {}",
            transaction_id, request.connector_id, request.id_tag
        );
        reply::<StartTransactionRequest>(
            call,
            &StartTransactionResponse {
                id_tag_info: self.id_tag_info(),
                transaction_id,
            },
        )
    }

    fn status_notification(&self, call: &CallMessage) -> OcppResult<Message> {
        let request: StatusNotificationRequest = call.payload_as()?;
        debug!(
            "Loopback status for connector {}: {}",
            request.connector_id, request.status
        );
        reply::<StatusNotificationRequest>(call, &StatusNotificationResponse {})
    }

    fn stop_transaction(&self, call: &CallMessage) -> OcppResult<Message> {
        let request: StopTransactionRequest = call.payload_as()?;
        info!(
            "Loopback stop of transaction {} at {} Wh",
            request.transaction_id, request.meter_stop
        );
        reply::<StopTransactionRequest>(
            call,
            &StopTransactionResponse {
                id_tag_info: Some(self.id_tag_info()),
            },
        )
    }
}

fn reply<A: OcppAction>(call: &CallMessage, response: &A::Response) -> OcppResult<Message> {
    Ok(CallResultMessage::new(&call.unique_id, response)?.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(action: &str, payload: serde_json::Value) -> CallMessage {
        CallMessage::new(action, &payload).unwrap()
    }

    #[test]
    fn test_pending_then_final_boot_status() {
        let csms = LoopbackCentralSystem::new(LoopbackOptions {
            pending_boots: 1,
            ..Default::default()
        });
        let boot = call(
            "BootNotification",
            json!({"chargePointVendor": "V", "chargePointModel": "M"}),
        );

        let statuses: Vec<_> = (0..2)
            .map(|_| match csms.answer(&boot) {
                Message::CallResult(result) => result.payload["status"].clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(statuses, vec![json!("Pending"), json!("Accepted")]);
    }

    #[test]
    fn test_transaction_ids_count_up() {
        let csms = LoopbackCentralSystem::new(LoopbackOptions {
            first_transaction_id: 7,
            ..Default::default()
        });
        let start = call(
            "StartTransaction",
            json!({"connectorId": 1, "idTag": "test-tag", "meterStart": 0, "timestamp": "2024-01-01T00:00:00Z"}),
        );

        for expected in [7, 8] {
            let Message::CallResult(result) = csms.answer(&start) else {
                panic!("expected CallResult");
            };
            assert_eq!(result.payload["transactionId"], json!(expected));
        }
    }

    #[test]
    fn test_failing_action_answers_call_error() {
        let csms = LoopbackCentralSystem::new(LoopbackOptions {
            failing_actions: vec!["Heartbeat".to_string()],
            ..Default::default()
        });

        let Message::CallError(error) = csms.answer(&call("Heartbeat", json!({}))) else {
            panic!("expected CallError");
        };
        assert_eq!(error.error_code, CallErrorCode::InternalError);
        assert!(matches!(
            csms.answer(&call("StatusNotification", json!({"connectorId": 1, "errorCode": "NoError", "status": "Available"}))),
            Message::CallResult(_)
        ));
    }

    #[test]
    fn test_bad_payload_and_unknown_action() {
        let csms = LoopbackCentralSystem::new(LoopbackOptions::default());

        let Message::CallError(error) = csms.answer(&call("Authorize", json!({}))) else {
            panic!("expected CallError");
        };
        assert_eq!(error.error_code, CallErrorCode::FormationViolation);

        let Message::CallError(error) = csms.answer(&call("Reset", json!({"type": "Soft"}))) else {
            panic!("expected CallError");
        };
        assert_eq!(error.error_code, CallErrorCode::NotImplemented);
    }
}
