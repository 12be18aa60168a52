//! # Central System Request Router
//!
//! Answers every Call the central system sends with exactly one CallResult
//! or CallError. Each action name maps to one [`OperationHandler`] in a
//! table fixed at construction; names missing from the table get a
//! `NotImplemented` CallError.

use crate::connector::ConnectorRegistry;
use crate::error::{ChargePointError, ChargePointResult};
use crate::transaction::TransactionManager;
use async_trait::async_trait;
use ocpp_messages::v16j::*;
use ocpp_messages::{CallErrorMessage, CallMessage, CallResultMessage, Message, OcppAction};
use ocpp_types::v16j::*;
use ocpp_types::CallErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which handler set the router is built with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterPolicy {
    /// Refuse every remote operation with a fixed response
    #[default]
    Strict,
    /// Honour ChangeAvailability and RemoteStopTransaction against local state
    Permissive,
}

/// How a route answers, for inspection
#[derive(Debug, Clone, PartialEq)]
pub enum RoutePolicy {
    /// Always the same payload
    Fixed(Value),
    /// Decided from connector and transaction state
    Stateful,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub action: &'static str,
    pub policy: RoutePolicy,
}

/// What a handler produced
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Accepted(Value),
    /// A well formed refusal, e.g. `{"status": "Rejected"}`
    Refused(Value),
}

/// Answer as a CallError instead of a CallResult
#[derive(Debug, Clone, PartialEq)]
pub struct CallFault {
    pub code: CallErrorCode,
    pub description: String,
}

impl CallFault {
    fn formation(action: &str, err: impl std::fmt::Display) -> Self {
        Self {
            code: CallErrorCode::FormationViolation,
            description: format!("invalid {action} payload: {err}"),
        }
    }

    fn constraint(err: impl std::fmt::Display) -> Self {
        Self {
            code: CallErrorCode::PropertyConstraintViolation,
            description: err.to_string(),
        }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        Self {
            code: CallErrorCode::InternalError,
            description: err.to_string(),
        }
    }
}

/// State the handlers may consult or change
pub struct RouterContext {
    pub connectors: Arc<ConnectorRegistry>,
    pub transactions: Arc<TransactionManager>,
}

#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, ctx: &RouterContext, payload: Value) -> Result<Reply, CallFault>;

    fn policy(&self) -> RoutePolicy;
}

fn decode<A: OcppAction>(payload: Value) -> Result<A, CallFault> {
    let request: A =
        serde_json::from_value(payload).map_err(|e| CallFault::formation(A::ACTION_NAME, e))?;
    request.validate().map_err(CallFault::constraint)?;
    Ok(request)
}

fn encode<T: Serialize>(response: &T) -> Result<Value, CallFault> {
    serde_json::to_value(response).map_err(CallFault::internal)
}

/// Decodes the request, then answers with a constant payload
struct Fixed<A> {
    response: Value,
    refused: bool,
    _action: PhantomData<fn() -> A>,
}

impl<A: OcppAction> Fixed<A> {
    fn route(response: A::Response) -> ChargePointResult<(&'static str, Box<dyn OperationHandler>)> {
        let response = serde_json::to_value(&response)?;
        let refused = response
            .get("status")
            .and_then(Value::as_str)
            .is_some_and(|status| status != "Accepted");
        let handler = Fixed::<A> {
            response,
            refused,
            _action: PhantomData,
        };
        Ok((A::ACTION_NAME, Box::new(handler)))
    }
}

#[async_trait]
impl<A: OcppAction> OperationHandler for Fixed<A> {
    async fn handle(&self, _ctx: &RouterContext, payload: Value) -> Result<Reply, CallFault> {
        decode::<A>(payload)?;
        let response = self.response.clone();
        Ok(if self.refused {
            Reply::Refused(response)
        } else {
            Reply::Accepted(response)
        })
    }

    fn policy(&self) -> RoutePolicy {
        RoutePolicy::Fixed(self.response.clone())
    }
}

/// What ChangeAvailability would do to one connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AvailabilityPlan {
    /// Already in the requested state
    Unchanged,
    Move(ChargePointStatus),
    /// A transaction is running, the change waits for it to end
    Scheduled,
    Rejected,
}

/// Operative maps to Available, Inoperative to Unavailable. Connector 0
/// addresses every connector, and either all of them comply or none is
/// touched.
struct ChangeAvailabilityHandler;

impl ChangeAvailabilityHandler {
    async fn plan(ctx: &RouterContext, connector_id: u32, target: ChargePointStatus) -> AvailabilityPlan {
        let Ok(state) = ctx.connectors.state(connector_id).await else {
            return AvailabilityPlan::Rejected;
        };
        if state.active_transaction.is_some() {
            return AvailabilityPlan::Scheduled;
        }
        if state.status == target {
            return AvailabilityPlan::Unchanged;
        }
        match ctx.connectors.check_transition(connector_id, target).await {
            Ok(()) => AvailabilityPlan::Move(target),
            Err(rejection) => {
                debug!("ChangeAvailability on connector {}: {}", connector_id, rejection);
                AvailabilityPlan::Rejected
            }
        }
    }

    async fn change(ctx: &RouterContext, connector_ids: &[u32], kind: AvailabilityType) -> AvailabilityStatus {
        let target = match kind {
            AvailabilityType::Operative => ChargePointStatus::Available,
            AvailabilityType::Inoperative => ChargePointStatus::Unavailable,
        };

        let mut plans = Vec::with_capacity(connector_ids.len());
        for &connector_id in connector_ids {
            plans.push((connector_id, Self::plan(ctx, connector_id, target).await));
        }
        if plans.iter().any(|(_, plan)| *plan == AvailabilityPlan::Rejected) {
            return AvailabilityStatus::Rejected;
        }

        let mut applied = Vec::new();
        for &(connector_id, plan) in &plans {
            let AvailabilityPlan::Move(target) = plan else {
                continue;
            };
            match ctx.connectors.request_transition(connector_id, target).await {
                Ok(transition) => applied.push((connector_id, transition.from_state)),
                Err(rejection) => {
                    warn!(
                        "ChangeAvailability on connector {} changed under us: {}",
                        connector_id, rejection
                    );
                    for (connector_id, previous) in applied.into_iter().rev() {
                        if let Err(e) = ctx.connectors.request_transition(connector_id, previous).await {
                            warn!("Connector {} not restored to {}: {}", connector_id, previous, e);
                        }
                    }
                    return AvailabilityStatus::Rejected;
                }
            }
        }

        if plans.iter().any(|(_, plan)| *plan == AvailabilityPlan::Scheduled) {
            AvailabilityStatus::Scheduled
        } else {
            AvailabilityStatus::Accepted
        }
    }
}

#[async_trait]
impl OperationHandler for ChangeAvailabilityHandler {
    async fn handle(&self, ctx: &RouterContext, payload: Value) -> Result<Reply, CallFault> {
        let request: ChangeAvailabilityRequest = decode(payload)?;

        let connector_ids: Vec<u32> = if request.connector_id == 0 {
            ctx.connectors.connector_ids().iter().map(|id| id.value()).collect()
        } else {
            vec![request.connector_id]
        };
        let status = Self::change(ctx, &connector_ids, request.kind).await;

        let response = encode(&ChangeAvailabilityResponse { status })?;
        Ok(match status {
            AvailabilityStatus::Rejected => Reply::Refused(response),
            _ => Reply::Accepted(response),
        })
    }

    fn policy(&self) -> RoutePolicy {
        RoutePolicy::Stateful
    }
}

/// Moves the connector to Finishing; the running charge cycle notices and
/// stops the transaction with reason Remote.
struct RemoteStopHandler;

#[async_trait]
impl OperationHandler for RemoteStopHandler {
    async fn handle(&self, ctx: &RouterContext, payload: Value) -> Result<Reply, CallFault> {
        let request: RemoteStopTransactionRequest = decode(payload)?;

        let accepted = match ctx.transactions.find_by_wire_id(request.transaction_id).await {
            Some(transaction) => {
                let connector_id = transaction.connector_id.value();
                match ctx.connectors.status(connector_id).await {
                    Ok(ChargePointStatus::Finishing) => true,
                    Ok(_) => ctx
                        .connectors
                        .request_transition(connector_id, ChargePointStatus::Finishing)
                        .await
                        .is_ok(),
                    Err(_) => false,
                }
            }
            None => false,
        };

        let status = if accepted {
            info!("Remote stop accepted for transaction {}", request.transaction_id);
            RemoteStartStopStatus::Accepted
        } else {
            RemoteStartStopStatus::Rejected
        };
        let response = encode(&RemoteStopTransactionResponse { status })?;
        Ok(if accepted {
            Reply::Accepted(response)
        } else {
            Reply::Refused(response)
        })
    }

    fn policy(&self) -> RoutePolicy {
        RoutePolicy::Stateful
    }
}

pub struct Router {
    routes: HashMap<&'static str, Box<dyn OperationHandler>>,
    ctx: RouterContext,
    refusals: AtomicUsize,
}

impl Router {
    pub fn new(
        policy: RouterPolicy,
        connectors: Arc<ConnectorRegistry>,
        transactions: Arc<TransactionManager>,
    ) -> ChargePointResult<Self> {
        let mut routes: HashMap<_, _> = default_routes()?.into_iter().collect();

        if policy == RouterPolicy::Permissive {
            routes.insert(
                ChangeAvailabilityRequest::ACTION_NAME,
                Box::new(ChangeAvailabilityHandler),
            );
            routes.insert(
                RemoteStopTransactionRequest::ACTION_NAME,
                Box::new(RemoteStopHandler),
            );
        }

        debug!("Router built with {} routes ({:?})", routes.len(), policy);
        Ok(Self {
            routes,
            ctx: RouterContext {
                connectors,
                transactions,
            },
            refusals: AtomicUsize::new(0),
        })
    }

    pub fn supports(&self, action: &str) -> bool {
        self.routes.contains_key(action)
    }

    /// Every route and how it answers, sorted by action
    pub fn policy_table(&self) -> Vec<RouteEntry> {
        let mut table: Vec<_> = self
            .routes
            .iter()
            .map(|(action, handler)| RouteEntry {
                action,
                policy: handler.policy(),
            })
            .collect();
        table.sort_by_key(|entry| entry.action);
        table
    }

    /// Number of operations refused so far
    pub fn refusals(&self) -> usize {
        self.refusals.load(Ordering::Relaxed)
    }

    /// Produce the response frame for an inbound Call
    pub async fn route(&self, call: CallMessage) -> Message {
        let Some(handler) = self.routes.get(call.action.as_str()) else {
            warn!("Unsupported action from central system: {}", call.action);
            return CallErrorMessage::new(
                call.unique_id,
                CallErrorCode::NotImplemented,
                format!("action '{}' is not implemented", call.action),
            )
            .into();
        };

        debug!("Routing {} ({})", call.action, call.unique_id);
        match handler.handle(&self.ctx, call.payload).await {
            Ok(Reply::Accepted(payload)) => CallResultMessage {
                unique_id: call.unique_id,
                payload,
            }
            .into(),
            Ok(Reply::Refused(payload)) => {
                self.refusals.fetch_add(1, Ordering::Relaxed);
                info!(
                    "{}",
                    ChargePointError::RejectedByPolicy {
                        action: call.action.clone()
                    }
                );
                CallResultMessage {
                    unique_id: call.unique_id,
                    payload,
                }
                .into()
            }
            Err(fault) => {
                warn!("{} failed: {} {}", call.action, fault.code, fault.description);
                CallErrorMessage::new(call.unique_id, fault.code, fault.description).into()
            }
        }
    }
}

fn default_routes() -> ChargePointResult<Vec<(&'static str, Box<dyn OperationHandler>)>> {
    Ok(vec![
        Fixed::<ChangeAvailabilityRequest>::route(ChangeAvailabilityResponse {
            status: AvailabilityStatus::Rejected,
        })?,
        Fixed::<ChangeConfigurationRequest>::route(ChangeConfigurationResponse {
            status: ConfigurationStatus::Rejected,
        })?,
        Fixed::<ClearCacheRequest>::route(ClearCacheResponse {
            status: ClearCacheStatus::Rejected,
        })?,
        Fixed::<DataTransferRequest>::route(DataTransferResponse {
            status: DataTransferStatus::Rejected,
            data: None,
        })?,
        Fixed::<GetConfigurationRequest>::route(GetConfigurationResponse::default())?,
        Fixed::<RemoteStartTransactionRequest>::route(RemoteStartTransactionResponse {
            status: RemoteStartStopStatus::Rejected,
        })?,
        Fixed::<RemoteStopTransactionRequest>::route(RemoteStopTransactionResponse {
            status: RemoteStartStopStatus::Rejected,
        })?,
        Fixed::<ResetRequest>::route(ResetResponse {
            status: ResetStatus::Rejected,
        })?,
        Fixed::<UnlockConnectorRequest>::route(UnlockConnectorResponse {
            status: UnlockStatus::NotSupported,
        })?,
        Fixed::<GetLocalListVersionRequest>::route(GetLocalListVersionResponse { list_version: 0 })?,
        Fixed::<SendLocalListRequest>::route(SendLocalListResponse {
            status: UpdateStatus::NotSupported,
        })?,
        Fixed::<GetDiagnosticsRequest>::route(GetDiagnosticsResponse::default())?,
        Fixed::<UpdateFirmwareRequest>::route(UpdateFirmwareResponse::default())?,
        Fixed::<TriggerMessageRequest>::route(TriggerMessageResponse {
            status: TriggerMessageStatus::NotImplemented,
        })?,
        Fixed::<ReserveNowRequest>::route(ReserveNowResponse {
            status: ReservationStatus::Rejected,
        })?,
        Fixed::<CancelReservationRequest>::route(CancelReservationResponse {
            status: CancelReservationStatus::Rejected,
        })?,
        Fixed::<SetChargingProfileRequest>::route(SetChargingProfileResponse {
            status: ChargingProfileStatus::NotSupported,
        })?,
        Fixed::<ClearChargingProfileRequest>::route(ClearChargingProfileResponse {
            status: ClearChargingProfileStatus::Unknown,
        })?,
        Fixed::<GetCompositeScheduleRequest>::route(GetCompositeScheduleResponse {
            status: GetCompositeScheduleStatus::Rejected,
            connector_id: None,
            schedule_start: None,
            charging_schedule: None,
        })?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    async fn router(policy: RouterPolicy) -> (Router, Arc<ConnectorRegistry>, Arc<TransactionManager>) {
        let (registry, _events) = ConnectorRegistry::new(2);
        let registry = Arc::new(registry);
        let transactions = Arc::new(TransactionManager::new(registry.clone()));
        let router = Router::new(policy, registry.clone(), transactions.clone()).unwrap();
        (router, registry, transactions)
    }

    fn call(action: &str, payload: Value) -> CallMessage {
        CallMessage {
            unique_id: "cs-1".to_string(),
            action: action.to_string(),
            payload,
        }
    }

    fn result_payload(message: Message) -> Value {
        match message {
            Message::CallResult(result) => result.payload,
            other => panic!("expected CallResult, got {other:?}"),
        }
    }

    fn sample_payload(action: &str) -> Value {
        let schedule = json!({
            "chargingRateUnit": "A",
            "chargingSchedulePeriod": [{"startPeriod": 0, "limit": 16.0}]
        });
        match action {
            "ChangeAvailability" => json!({"connectorId": 1, "type": "Inoperative"}),
            "ChangeConfiguration" => json!({"key": "HeartbeatInterval", "value": "60"}),
            "DataTransfer" => json!({"vendorId": "acme", "messageId": "ping"}),
            "GetConfiguration" => json!({"key": ["HeartbeatInterval"]}),
            "RemoteStartTransaction" => json!({"connectorId": 1, "idTag": "test-tag"}),
            "RemoteStopTransaction" => json!({"transactionId": 1}),
            "Reset" => json!({"type": "Soft"}),
            "UnlockConnector" => json!({"connectorId": 1}),
            "SendLocalList" => json!({"listVersion": 1, "updateType": "Full"}),
            "GetDiagnostics" => json!({"location": "ftp://diag.example/upload"}),
            "UpdateFirmware" => json!({
                "location": "https://fw.example/1.2.bin",
                "retrieveDate": "2024-01-01T00:00:00Z"
            }),
            "TriggerMessage" => json!({"requestedMessage": "Heartbeat"}),
            "ReserveNow" => json!({
                "connectorId": 1,
                "expiryDate": "2030-01-01T00:00:00Z",
                "idTag": "test-tag",
                "reservationId": 3
            }),
            "CancelReservation" => json!({"reservationId": 3}),
            "SetChargingProfile" => json!({
                "connectorId": 1,
                "csChargingProfiles": {
                    "chargingProfileId": 1,
                    "stackLevel": 0,
                    "chargingProfilePurpose": "TxDefaultProfile",
                    "chargingProfileKind": "Absolute",
                    "chargingSchedule": schedule
                }
            }),
            "GetCompositeSchedule" => json!({"connectorId": 1, "duration": 3600}),
            _ => json!({}),
        }
    }

    #[tokio::test]
    async fn test_default_table_answers() {
        let (router, _, _) = router(RouterPolicy::Strict).await;

        let expected = [
            ("ChangeAvailability", json!({"status": "Rejected"})),
            ("ChangeConfiguration", json!({"status": "Rejected"})),
            ("ClearCache", json!({"status": "Rejected"})),
            ("DataTransfer", json!({"status": "Rejected"})),
            ("GetConfiguration", json!({})),
            ("RemoteStartTransaction", json!({"status": "Rejected"})),
            ("RemoteStopTransaction", json!({"status": "Rejected"})),
            ("Reset", json!({"status": "Rejected"})),
            ("UnlockConnector", json!({"status": "NotSupported"})),
            ("GetLocalListVersion", json!({"listVersion": 0})),
            ("SendLocalList", json!({"status": "NotSupported"})),
            ("GetDiagnostics", json!({})),
            ("UpdateFirmware", json!({})),
            ("TriggerMessage", json!({"status": "NotImplemented"})),
            ("ReserveNow", json!({"status": "Rejected"})),
            ("CancelReservation", json!({"status": "Rejected"})),
            ("SetChargingProfile", json!({"status": "NotSupported"})),
            ("ClearChargingProfile", json!({"status": "Unknown"})),
            ("GetCompositeSchedule", json!({"status": "Rejected"})),
        ];

        assert_eq!(router.policy_table().len(), expected.len());
        for (action, response) in expected {
            let reply = router.route(call(action, sample_payload(action))).await;
            assert_eq!(result_payload(reply), response, "{action}");
        }
        assert!(router
            .policy_table()
            .iter()
            .all(|entry| matches!(entry.policy, RoutePolicy::Fixed(_))));
    }

    #[tokio::test]
    async fn test_unknown_action_not_implemented() {
        let (router, _, _) = router(RouterPolicy::Strict).await;

        match router.route(call("FlyToTheMoon", json!({}))).await {
            Message::CallError(err) => {
                assert_eq!(err.unique_id, "cs-1");
                assert_eq!(err.error_code, CallErrorCode::NotImplemented);
            }
            other => panic!("expected CallError, got {other:?}"),
        }
        assert!(!router.supports("FlyToTheMoon"));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_formation_violation() {
        let (router, _, _) = router(RouterPolicy::Strict).await;

        match router.route(call("Reset", json!({"type": "Sideways"}))).await {
            Message::CallError(err) => assert_eq!(err.error_code, CallErrorCode::FormationViolation),
            other => panic!("expected CallError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_table_is_total_over_connector_states() {
        use ChargePointStatus::*;

        for policy in [RouterPolicy::Strict, RouterPolicy::Permissive] {
            for status in ChargePointStatus::ALL {
                let (router, registry, transactions) = router(policy).await;
                match status {
                    Available => {}
                    Faulted => {
                        registry
                            .fault(1, ChargePointErrorCode::OtherError, None)
                            .await
                            .unwrap();
                    }
                    Reserved => {
                        registry.set_reservation(1, 1).await.unwrap();
                    }
                    Unavailable => {
                        registry.request_transition(1, Unavailable).await.unwrap();
                    }
                    Preparing | Charging | Finishing => {
                        registry.request_transition(1, Preparing).await.unwrap();
                        transactions
                            .start_transaction(1, "test-tag", 0, Utc::now())
                            .await
                            .unwrap();
                        if status != Preparing {
                            registry.request_transition(1, Charging).await.unwrap();
                        }
                        if status == Finishing {
                            registry.request_transition(1, Finishing).await.unwrap();
                        }
                    }
                }

                for entry in router.policy_table() {
                    let reply = router.route(call(entry.action, sample_payload(entry.action))).await;
                    assert_eq!(reply.unique_id(), "cs-1");
                    assert!(
                        matches!(reply, Message::CallResult(_)),
                        "{policy:?} {status} {}: {reply:?}",
                        entry.action
                    );
                }
            }
        }
    }

    #[tokio::test]
    async fn test_change_availability_while_charging_strict() {
        let (router, registry, transactions) = router(RouterPolicy::Strict).await;
        registry.request_transition(1, ChargePointStatus::Preparing).await.unwrap();
        transactions.start_transaction(1, "test-tag", 0, Utc::now()).await.unwrap();
        registry.request_transition(1, ChargePointStatus::Charging).await.unwrap();

        let reply = router
            .route(call("ChangeAvailability", json!({"connectorId": 1, "type": "Inoperative"})))
            .await;
        assert_eq!(result_payload(reply), json!({"status": "Rejected"}));
        assert_eq!(registry.status(1).await.unwrap(), ChargePointStatus::Charging);
        assert_eq!(router.refusals(), 1);
    }

    #[tokio::test]
    async fn test_permissive_change_availability() {
        let (router, registry, transactions) = router(RouterPolicy::Permissive).await;

        let reply = router
            .route(call("ChangeAvailability", json!({"connectorId": 2, "type": "Inoperative"})))
            .await;
        assert_eq!(result_payload(reply), json!({"status": "Accepted"}));
        assert_eq!(registry.status(2).await.unwrap(), ChargePointStatus::Unavailable);

        registry.request_transition(1, ChargePointStatus::Preparing).await.unwrap();
        transactions.start_transaction(1, "test-tag", 0, Utc::now()).await.unwrap();
        let reply = router
            .route(call("ChangeAvailability", json!({"connectorId": 1, "type": "Inoperative"})))
            .await;
        assert_eq!(result_payload(reply), json!({"status": "Scheduled"}));
        assert_eq!(registry.status(1).await.unwrap(), ChargePointStatus::Preparing);

        let reply = router
            .route(call("ChangeAvailability", json!({"connectorId": 9, "type": "Operative"})))
            .await;
        assert_eq!(result_payload(reply), json!({"status": "Rejected"}));

        assert!(router
            .policy_table()
            .iter()
            .any(|entry| entry.action == "ChangeAvailability" && entry.policy == RoutePolicy::Stateful));
    }

    fn change_all(kind: &str) -> CallMessage {
        call("ChangeAvailability", json!({"connectorId": 0, "type": kind}))
    }

    #[tokio::test]
    async fn test_change_all_connectors_is_all_or_nothing() {
        use ChargePointStatus::*;
        let (router, registry, transactions) = router(RouterPolicy::Permissive).await;

        registry.fault(1, ChargePointErrorCode::GroundFailure, None).await.unwrap();
        let reply = router.route(change_all("Inoperative")).await;
        assert_eq!(result_payload(reply), json!({"status": "Rejected"}));
        assert_eq!(registry.status(1).await.unwrap(), Faulted);
        assert_eq!(registry.status(2).await.unwrap(), Available);
        assert_eq!(router.refusals(), 1);

        registry.reset(1).await.unwrap();
        registry.request_transition(1, Preparing).await.unwrap();
        transactions.start_transaction(1, "test-tag", 0, Utc::now()).await.unwrap();
        let reply = router.route(change_all("Inoperative")).await;
        assert_eq!(result_payload(reply), json!({"status": "Scheduled"}));
        assert_eq!(registry.status(1).await.unwrap(), Preparing);
        assert_eq!(registry.status(2).await.unwrap(), Unavailable);
    }

    #[tokio::test]
    async fn test_change_all_connectors_accepted() {
        use ChargePointStatus::*;
        let (router, registry, _) = router(RouterPolicy::Permissive).await;

        registry.request_transition(2, Unavailable).await.unwrap();
        let reply = router.route(change_all("Inoperative")).await;
        assert_eq!(result_payload(reply), json!({"status": "Accepted"}));
        assert_eq!(registry.status(1).await.unwrap(), Unavailable);
        assert_eq!(registry.status(2).await.unwrap(), Unavailable);

        let reply = router.route(change_all("Operative")).await;
        assert_eq!(result_payload(reply), json!({"status": "Accepted"}));
        assert_eq!(registry.status(1).await.unwrap(), Available);
        assert_eq!(registry.status(2).await.unwrap(), Available);
        assert_eq!(router.refusals(), 0);
    }

    #[tokio::test]
    async fn test_permissive_remote_stop() {
        let (router, registry, transactions) = router(RouterPolicy::Permissive).await;

        let reply = router
            .route(call("RemoteStopTransaction", json!({"transactionId": 77})))
            .await;
        assert_eq!(result_payload(reply), json!({"status": "Rejected"}));

        registry.request_transition(1, ChargePointStatus::Preparing).await.unwrap();
        let id = transactions.start_transaction(1, "test-tag", 0, Utc::now()).await.unwrap();
        transactions.adopt_remote_id(id, 77).await.unwrap();
        registry.request_transition(1, ChargePointStatus::Charging).await.unwrap();

        let reply = router
            .route(call("RemoteStopTransaction", json!({"transactionId": 77})))
            .await;
        assert_eq!(result_payload(reply), json!({"status": "Accepted"}));
        assert_eq!(registry.status(1).await.unwrap(), ChargePointStatus::Finishing);
    }
}
