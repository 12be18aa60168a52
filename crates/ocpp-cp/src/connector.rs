//! # Connectors
//!
//! The registry owns every connector of the session. Each connector sits
//! behind its own mutex in a map that is fixed at construction, so work on
//! one connector never waits on another. Every successful transition is
//! announced on the status channel for the session to forward as a
//! StatusNotification.

use crate::error::{ChargePointError, ChargePointResult};
use crate::state_machine::{ConnectorStateMachine, StateTransition, TransitionRejection};
use chrono::{DateTime, Utc};
use ocpp_messages::v16j::StatusNotificationRequest;
use ocpp_types::v16j::{AvailabilityType, ChargePointErrorCode, ChargePointStatus};
use ocpp_types::{ConnectorId, TransactionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Observable state of one connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorState {
    /// Connector identifier, never 0
    pub id: ConnectorId,
    /// Current OCPP status
    pub status: ChargePointStatus,
    /// Operative unless taken Unavailable
    pub availability: AvailabilityType,
    /// Local id of the transaction bound to the connector
    pub active_transaction: Option<TransactionId>,
    /// Reservation waiting for its id tag
    pub active_reservation: Option<i32>,
    /// Error reported with the last fault, `NoError` otherwise
    pub error_code: ChargePointErrorCode,
    /// Free text accompanying the error code
    pub info: Option<String>,
}

impl ConnectorState {
    fn new(id: ConnectorId) -> Self {
        Self {
            id,
            status: ChargePointStatus::Available,
            availability: AvailabilityType::Operative,
            active_transaction: None,
            active_reservation: None,
            error_code: ChargePointErrorCode::NoError,
            info: None,
        }
    }
}

/// Status change to be reported to the central system
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    /// Connector that moved
    pub connector_id: u32,
    /// Status it moved to
    pub status: ChargePointStatus,
    /// Error code at the time of the transition
    pub error_code: ChargePointErrorCode,
    /// Additional error information
    pub info: Option<String>,
    /// When the transition happened
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    /// StatusNotification reporting this event
    pub fn to_request(&self) -> StatusNotificationRequest {
        let mut request = StatusNotificationRequest::new(self.connector_id, self.status);
        request.error_code = self.error_code;
        request.info = self.info.clone();
        request.timestamp = Some(self.timestamp);
        request
    }
}

/// Connector state together with its transition rules
struct ConnectorSlot {
    state: ConnectorState,
    machine: ConnectorStateMachine,
}

impl ConnectorSlot {
    fn event(&self, transition: &StateTransition) -> StatusEvent {
        StatusEvent {
            connector_id: self.state.id.value(),
            status: transition.to_state,
            error_code: self.state.error_code,
            info: self.state.info.clone(),
            timestamp: transition.timestamp,
        }
    }
}

/// Every connector of the charge point, addressed by id
pub struct ConnectorRegistry {
    connectors: HashMap<ConnectorId, Mutex<ConnectorSlot>>,
    events: mpsc::UnboundedSender<StatusEvent>,
}

impl ConnectorRegistry {
    /// Create connectors `1..=count`, all Available
    pub fn new(count: u32) -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let connectors = (1..=count)
            .filter_map(|id| ConnectorId::new(id).ok())
            .map(|id| {
                let slot = ConnectorSlot {
                    state: ConnectorState::new(id),
                    machine: ConnectorStateMachine::new(id.value(), ChargePointStatus::Available),
                };
                (id, Mutex::new(slot))
            })
            .collect();

        info!("Created {} connectors", count);
        (Self { connectors, events }, rx)
    }

    fn slot(&self, connector_id: u32) -> Result<&Mutex<ConnectorSlot>, TransitionRejection> {
        ConnectorId::new(connector_id)
            .ok()
            .and_then(|id| self.connectors.get(&id))
            .ok_or(TransitionRejection::ConnectorUnknown(connector_id))
    }

    fn publish(&self, event: StatusEvent) {
        if self.events.send(event).is_err() {
            debug!("Status channel closed, dropping event");
        }
    }

    /// Number of connectors
    pub fn count(&self) -> usize {
        self.connectors.len()
    }

    /// Whether `connector_id` names a connector of this charge point
    pub fn contains(&self, connector_id: u32) -> bool {
        self.slot(connector_id).is_ok()
    }

    /// Connector ids in ascending order
    pub fn connector_ids(&self) -> Vec<ConnectorId> {
        let mut ids: Vec<_> = self.connectors.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Ask for `target`. The state is unchanged on rejection.
    pub async fn request_transition(
        &self,
        connector_id: u32,
        target: ChargePointStatus,
    ) -> Result<StateTransition, TransitionRejection> {
        let mut slot = self.slot(connector_id)?.lock().await;
        let active = slot.state.active_transaction;
        let transition = slot.machine.transition_to(target, active)?;

        slot.state.status = target;
        match target {
            ChargePointStatus::Unavailable => slot.state.availability = AvailabilityType::Inoperative,
            ChargePointStatus::Available => {
                slot.state.availability = AvailabilityType::Operative;
                slot.state.active_reservation = None;
            }
            _ => {}
        }

        let event = slot.event(&transition);
        drop(slot);
        self.publish(event);
        Ok(transition)
    }

    /// Whether `target` would be accepted right now, without moving
    pub async fn check_transition(
        &self,
        connector_id: u32,
        target: ChargePointStatus,
    ) -> Result<(), TransitionRejection> {
        let slot = self.slot(connector_id)?.lock().await;
        slot.machine.check(target, slot.state.active_transaction)
    }

    /// Hardware fault signal: any state moves to Faulted
    pub async fn fault(
        &self,
        connector_id: u32,
        error_code: ChargePointErrorCode,
        info: Option<String>,
    ) -> Result<StateTransition, TransitionRejection> {
        let mut slot = self.slot(connector_id)?.lock().await;
        let transition = slot.machine.fault(error_code)?;

        warn!(
            "Connector {} faulted: {:?} {}",
            connector_id,
            error_code,
            info.as_deref().unwrap_or("")
        );
        slot.state.status = ChargePointStatus::Faulted;
        slot.state.error_code = error_code;
        slot.state.info = info;

        let event = slot.event(&transition);
        drop(slot);
        self.publish(event);
        Ok(transition)
    }

    /// Explicit reset back to Available, clearing any fault
    pub async fn reset(&self, connector_id: u32) -> Result<StateTransition, TransitionRejection> {
        let mut slot = self.slot(connector_id)?.lock().await;
        let active = slot.state.active_transaction;
        let transition = slot.machine.reset(active)?;

        slot.state.status = ChargePointStatus::Available;
        slot.state.availability = AvailabilityType::Operative;
        slot.state.error_code = ChargePointErrorCode::NoError;
        slot.state.info = None;
        slot.state.active_reservation = None;

        let event = slot.event(&transition);
        drop(slot);
        self.publish(event);
        Ok(transition)
    }

    /// Current status of one connector
    pub async fn status(&self, connector_id: u32) -> Result<ChargePointStatus, TransitionRejection> {
        Ok(self.slot(connector_id)?.lock().await.state.status)
    }

    /// Full state of one connector
    pub async fn state(&self, connector_id: u32) -> Result<ConnectorState, TransitionRejection> {
        Ok(self.slot(connector_id)?.lock().await.state.clone())
    }

    /// All connector states, sorted by id
    pub async fn snapshot(&self) -> Vec<ConnectorState> {
        let mut states = Vec::with_capacity(self.connectors.len());
        for id in self.connector_ids() {
            if let Some(slot) = self.connectors.get(&id) {
                states.push(slot.lock().await.state.clone());
            }
        }
        states
    }

    /// Recent transitions of one connector, oldest first
    pub async fn history(&self, connector_id: u32) -> Result<Vec<StateTransition>, TransitionRejection> {
        let slot = self.slot(connector_id)?.lock().await;
        Ok(slot.machine.history().cloned().collect())
    }

    /// Reserve an Available connector
    pub async fn set_reservation(
        &self,
        connector_id: u32,
        reservation_id: i32,
    ) -> Result<StateTransition, TransitionRejection> {
        let mut slot = self.slot(connector_id)?.lock().await;
        let active = slot.state.active_transaction;
        let transition = slot.machine.transition_to(ChargePointStatus::Reserved, active)?;
        slot.state.status = ChargePointStatus::Reserved;
        slot.state.active_reservation = Some(reservation_id);

        let event = slot.event(&transition);
        drop(slot);
        self.publish(event);
        Ok(transition)
    }

    /// Drop the reservation; a Reserved connector becomes Available again
    pub async fn clear_reservation(&self, connector_id: u32) -> Result<Option<i32>, TransitionRejection> {
        let reservation = {
            let mut slot = self.slot(connector_id)?.lock().await;
            slot.state.active_reservation.take()
        };
        if self.status(connector_id).await? == ChargePointStatus::Reserved {
            self.request_transition(connector_id, ChargePointStatus::Available)
                .await?;
        }
        Ok(reservation)
    }

    /// Attach a new transaction. The connector must be Preparing and free.
    /// Returns the reservation the transaction consumes, if any.
    pub async fn bind_transaction(
        &self,
        connector_id: u32,
        transaction_id: TransactionId,
    ) -> ChargePointResult<Option<i32>> {
        let mut slot = self.slot(connector_id)?.lock().await;

        if let Some(active) = slot.state.active_transaction {
            return Err(ChargePointError::ConnectorBusy {
                connector_id,
                transaction_id: active,
            });
        }
        if slot.state.status != ChargePointStatus::Preparing {
            return Err(ChargePointError::invalid_operation(format!(
                "connector {} is {}, a transaction needs Preparing",
                connector_id, slot.state.status
            )));
        }

        slot.state.active_transaction = Some(transaction_id);
        debug!("Bound transaction {} to connector {}", transaction_id, connector_id);
        Ok(slot.state.active_reservation.take())
    }

    /// Detach `transaction_id` if it is the one bound to the connector
    pub async fn clear_transaction(
        &self,
        connector_id: u32,
        transaction_id: TransactionId,
    ) -> ChargePointResult<()> {
        let mut slot = self.slot(connector_id)?.lock().await;
        match slot.state.active_transaction {
            Some(active) if active == transaction_id => {
                slot.state.active_transaction = None;
                debug!("Cleared transaction {} from connector {}", transaction_id, connector_id);
                Ok(())
            }
            _ => Err(ChargePointError::UnknownTransaction(transaction_id.value())),
        }
    }

    /// Connector ids with an open transaction
    pub async fn active_transactions(&self) -> Vec<(ConnectorId, TransactionId)> {
        self.snapshot()
            .await
            .into_iter()
            .filter_map(|state| state.active_transaction.map(|tx| (state.id, tx)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ChargePointStatus::*;

    #[tokio::test]
    async fn test_transitions_publish_status_events() {
        let (registry, mut events) = ConnectorRegistry::new(2);

        registry.request_transition(1, Preparing).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.connector_id, 1);
        assert_eq!(event.status, Preparing);
        assert_eq!(event.error_code, ChargePointErrorCode::NoError);

        let request = event.to_request();
        assert_eq!(request.connector_id, 1);
        assert_eq!(request.status, Preparing);
        assert_eq!(request.timestamp, Some(event.timestamp));
    }

    #[tokio::test]
    async fn test_rejection_emits_nothing() {
        let (registry, mut events) = ConnectorRegistry::new(1);

        assert!(registry.request_transition(1, Finishing).await.is_err());
        assert_eq!(registry.status(1).await.unwrap(), Available);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_check_transition_changes_nothing() {
        let (registry, mut events) = ConnectorRegistry::new(1);

        assert!(registry.check_transition(1, Unavailable).await.is_ok());
        assert!(registry.check_transition(1, Charging).await.is_err());
        assert_eq!(registry.status(1).await.unwrap(), Available);
        assert!(events.try_recv().is_err());
        assert_eq!(
            registry.check_transition(4, Unavailable).await.unwrap_err(),
            TransitionRejection::ConnectorUnknown(4)
        );
    }

    #[tokio::test]
    async fn test_unknown_connector() {
        let (registry, _events) = ConnectorRegistry::new(2);
        assert_eq!(
            registry.request_transition(0, Preparing).await.unwrap_err(),
            TransitionRejection::ConnectorUnknown(0)
        );
        assert_eq!(
            registry.status(3).await.unwrap_err(),
            TransitionRejection::ConnectorUnknown(3)
        );
    }

    #[tokio::test]
    async fn test_availability_follows_unavailable() {
        let (registry, _events) = ConnectorRegistry::new(1);

        registry.request_transition(1, Unavailable).await.unwrap();
        assert_eq!(
            registry.state(1).await.unwrap().availability,
            AvailabilityType::Inoperative
        );
        registry.request_transition(1, Available).await.unwrap();
        assert_eq!(
            registry.state(1).await.unwrap().availability,
            AvailabilityType::Operative
        );
    }

    #[tokio::test]
    async fn test_transaction_binding() {
        let (registry, _events) = ConnectorRegistry::new(1);

        // Not Preparing yet
        assert!(registry.bind_transaction(1, TransactionId(1)).await.is_err());

        registry.request_transition(1, Preparing).await.unwrap();
        registry.bind_transaction(1, TransactionId(1)).await.unwrap();
        assert!(matches!(
            registry.bind_transaction(1, TransactionId(2)).await,
            Err(ChargePointError::ConnectorBusy { connector_id: 1, .. })
        ));

        // Open transaction blocks the unplug path
        assert!(matches!(
            registry.request_transition(1, Available).await,
            Err(TransitionRejection::TransactionInProgress { .. })
        ));
        registry.request_transition(1, Charging).await.unwrap();

        assert!(registry.clear_transaction(1, TransactionId(2)).await.is_err());
        registry.clear_transaction(1, TransactionId(1)).await.unwrap();
        assert_eq!(registry.state(1).await.unwrap().active_transaction, None);
    }

    #[tokio::test]
    async fn test_fault_and_reset() {
        let (registry, mut events) = ConnectorRegistry::new(1);

        registry
            .fault(1, ChargePointErrorCode::GroundFailure, Some("RCD tripped".to_string()))
            .await
            .unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.status, Faulted);
        assert_eq!(event.error_code, ChargePointErrorCode::GroundFailure);
        assert_eq!(event.info.as_deref(), Some("RCD tripped"));

        assert!(registry.request_transition(1, Available).await.is_err());
        registry.reset(1).await.unwrap();

        let state = registry.state(1).await.unwrap();
        assert_eq!(state.status, Available);
        assert_eq!(state.error_code, ChargePointErrorCode::NoError);
        assert_eq!(events.recv().await.unwrap().status, Available);
    }

    #[tokio::test]
    async fn test_reservation_is_consumed_by_transaction() {
        let (registry, _events) = ConnectorRegistry::new(1);

        registry.set_reservation(1, 42).await.unwrap();
        assert_eq!(registry.status(1).await.unwrap(), Reserved);

        registry.request_transition(1, Preparing).await.unwrap();
        assert_eq!(
            registry.bind_transaction(1, TransactionId(1)).await.unwrap(),
            Some(42)
        );
        assert_eq!(registry.state(1).await.unwrap().active_reservation, None);
    }

    #[tokio::test]
    async fn test_clear_reservation() {
        let (registry, _events) = ConnectorRegistry::new(1);

        registry.set_reservation(1, 7).await.unwrap();
        assert_eq!(registry.clear_reservation(1).await.unwrap(), Some(7));
        assert_eq!(registry.status(1).await.unwrap(), Available);
    }

    #[tokio::test]
    async fn test_snapshot_sorted() {
        let (registry, _events) = ConnectorRegistry::new(3);
        registry.request_transition(2, Unavailable).await.unwrap();

        let snapshot = registry.snapshot().await;
        let ids: Vec<u32> = snapshot.iter().map(|s| s.id.value()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(snapshot[1].status, Unavailable);
        assert_eq!(registry.history(2).await.unwrap().len(), 1);
    }
}
