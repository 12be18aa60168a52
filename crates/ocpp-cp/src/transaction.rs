//! # Transaction Management
//!
//! Local transaction ids are issued here, starting at 1 and never reused.
//! The central system answers StartTransaction with an id of its own; that
//! one is recorded with [`TransactionManager::adopt_remote_id`] and used on
//! the wire, while the local id keeps driving every local invariant.

use crate::connector::ConnectorRegistry;
use crate::error::{ChargePointError, ChargePointResult};
use chrono::{DateTime, Utc};
use ocpp_messages::v16j::StopTransactionRequest;
use ocpp_messages::validation;
use ocpp_types::meter::{MeterValue, ReadingContext};
use ocpp_types::v16j::Reason;
use ocpp_types::{ConnectorId, TransactionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One energy register reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterSample {
    pub timestamp: DateTime<Utc>,
    /// Energy.Active.Import.Register in Wh
    pub value: i32,
}

/// A charging transaction, active or finalized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Local transaction identifier
    pub id: TransactionId,
    /// Id assigned by the central system, once known
    pub remote_id: Option<i32>,
    /// Connector the transaction runs on
    pub connector_id: ConnectorId,
    /// Id tag that started the transaction
    pub id_tag: String,
    /// Reservation consumed by the transaction
    pub reservation_id: Option<i32>,
    pub start_timestamp: DateTime<Utc>,
    /// Meter value at start (Wh)
    pub meter_start: i32,
    /// Set once the transaction is stopped
    pub stop_timestamp: Option<DateTime<Utc>>,
    /// Meter value at stop (Wh)
    pub meter_stop: Option<i32>,
    pub stop_reason: Option<Reason>,
    /// Samples in arrival order
    pub meter_samples: Vec<MeterSample>,
}

impl Transaction {
    /// Id to put in MeterValues and StopTransaction
    pub fn wire_id(&self) -> i32 {
        self.remote_id.unwrap_or(self.id.value())
    }

    /// Not yet stopped
    pub fn is_active(&self) -> bool {
        self.stop_timestamp.is_none()
    }

    /// Most recent meter sample
    pub fn latest_sample(&self) -> Option<&MeterSample> {
        self.meter_samples.last()
    }

    /// Stop value, or the latest sample while still running, minus start
    pub fn energy_consumed(&self) -> i32 {
        let end = self
            .meter_stop
            .or_else(|| self.latest_sample().map(|s| s.value))
            .unwrap_or(self.meter_start);
        end.saturating_sub(self.meter_start)
    }

    /// Time from start to stop, or to now while running
    pub fn duration(&self) -> chrono::Duration {
        let end = self.stop_timestamp.unwrap_or_else(Utc::now);
        end.signed_duration_since(self.start_timestamp)
    }

    /// Samples as `transactionData` for StopTransaction
    pub fn transaction_data(&self) -> Vec<MeterValue> {
        self.meter_samples
            .iter()
            .map(|s| MeterValue::energy_register(s.timestamp, s.value, ReadingContext::SamplePeriodic))
            .collect()
    }

    /// StopTransaction for a finalized transaction
    pub fn stop_request(&self) -> ChargePointResult<StopTransactionRequest> {
        let (Some(meter_stop), Some(timestamp)) = (self.meter_stop, self.stop_timestamp) else {
            return Err(ChargePointError::invalid_operation(format!(
                "transaction {} is still active",
                self.id
            )));
        };
        let transaction_data = self.transaction_data();
        Ok(StopTransactionRequest {
            id_tag: Some(self.id_tag.clone()),
            meter_stop,
            timestamp,
            transaction_id: self.wire_id(),
            reason: self.stop_reason,
            transaction_data: (!transaction_data.is_empty()).then_some(transaction_data),
        })
    }
}

/// Transaction statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionStatistics {
    /// Transactions still running
    pub active_transactions: usize,
    /// Transactions moved to history
    pub completed_transactions: usize,
    /// Active plus completed
    pub total_transactions: usize,
    /// Energy delivered by completed transactions (Wh)
    pub total_energy_wh: i64,
    /// Meter samples over all transactions
    pub total_meter_samples: usize,
}

/// Everything the manager's single lock protects
#[derive(Debug)]
struct Ledger {
    next_id: i32,
    active: HashMap<TransactionId, Transaction>,
    history: Vec<Transaction>,
}

/// Issues transaction ids and keeps active and finalized transactions
pub struct TransactionManager {
    connectors: Arc<ConnectorRegistry>,
    ledger: Mutex<Ledger>,
}

impl TransactionManager {
    /// Manager binding transactions to connectors of `connectors`
    pub fn new(connectors: Arc<ConnectorRegistry>) -> Self {
        Self {
            connectors,
            ledger: Mutex::new(Ledger {
                next_id: 1,
                active: HashMap::new(),
                history: Vec::new(),
            }),
        }
    }

    /// Open a transaction on a Preparing connector
    pub async fn start_transaction(
        &self,
        connector_id: u32,
        id_tag: &str,
        meter_value: i32,
        timestamp: DateTime<Utc>,
    ) -> ChargePointResult<TransactionId> {
        validation::validate_id_tag("idTag", id_tag)?;
        let connector = ConnectorId::new(connector_id)
            .ok()
            .filter(|_| self.connectors.contains(connector_id))
            .ok_or(ChargePointError::InvalidConnector(connector_id))?;

        let mut ledger = self.ledger.lock().await;
        if let Some(busy) = ledger.active.values().find(|tx| tx.connector_id == connector) {
            return Err(ChargePointError::ConnectorBusy {
                connector_id,
                transaction_id: busy.id,
            });
        }

        let id = TransactionId::new(ledger.next_id);
        let reservation_id = self.connectors.bind_transaction(connector_id, id).await?;
        ledger.next_id += 1;

        ledger.active.insert(
            id,
            Transaction {
                id,
                remote_id: None,
                connector_id: connector,
                id_tag: id_tag.to_string(),
                reservation_id,
                start_timestamp: timestamp,
                meter_start: meter_value,
                stop_timestamp: None,
                meter_stop: None,
                stop_reason: None,
                meter_samples: Vec::new(),
            },
        );

        info!(
            "Started transaction {} on connector {} for {} (meter {} Wh)",
            id, connector_id, id_tag, meter_value
        );
        Ok(id)
    }

    /// Append a sample to an active transaction
    pub async fn record_meter_sample(
        &self,
        transaction_id: TransactionId,
        timestamp: DateTime<Utc>,
        value: i32,
    ) -> ChargePointResult<()> {
        let mut ledger = self.ledger.lock().await;
        let transaction = ledger
            .active
            .get_mut(&transaction_id)
            .ok_or(ChargePointError::UnknownTransaction(transaction_id.value()))?;

        transaction.meter_samples.push(MeterSample { timestamp, value });
        debug!("Transaction {} meter sample: {} Wh", transaction_id, value);
        Ok(())
    }

    /// Close a transaction and move it to history
    pub async fn stop_transaction(
        &self,
        transaction_id: TransactionId,
        meter_value: i32,
        timestamp: DateTime<Utc>,
        reason: Reason,
    ) -> ChargePointResult<Transaction> {
        let mut ledger = self.ledger.lock().await;
        let mut transaction = ledger
            .active
            .remove(&transaction_id)
            .ok_or(ChargePointError::UnknownTransaction(transaction_id.value()))?;

        transaction.stop_timestamp = Some(timestamp);
        transaction.meter_stop = Some(meter_value);
        transaction.stop_reason = Some(reason);

        let connector_id = transaction.connector_id.value();
        let cleared = self.connectors.clear_transaction(connector_id, transaction_id).await;
        ledger.history.push(transaction.clone());
        cleared?;

        info!(
            "Stopped transaction {} on connector {} (reason: {}, energy: {} Wh, samples: {})",
            transaction_id,
            connector_id,
            reason,
            transaction.energy_consumed(),
            transaction.meter_samples.len()
        );
        Ok(transaction)
    }

    /// Record the id the central system assigned to a local transaction
    pub async fn adopt_remote_id(&self, local: TransactionId, remote: i32) -> ChargePointResult<()> {
        let mut ledger = self.ledger.lock().await;
        let transaction = ledger
            .active
            .get_mut(&local)
            .ok_or(ChargePointError::UnknownTransaction(local.value()))?;

        if local.value() != remote {
            debug!("Transaction {} is {} on the central system", local, remote);
        }
        transaction.remote_id = Some(remote);
        Ok(())
    }

    /// Look up a local id or a central system id, active first
    pub async fn find_by_wire_id(&self, wire_id: i32) -> Option<Transaction> {
        let ledger = self.ledger.lock().await;
        ledger
            .active
            .values()
            .find(|tx| tx.wire_id() == wire_id)
            .cloned()
    }

    /// Transaction by local id, active or finalized
    pub async fn get(&self, transaction_id: TransactionId) -> Option<Transaction> {
        let ledger = self.ledger.lock().await;
        ledger
            .active
            .get(&transaction_id)
            .or_else(|| ledger.history.iter().find(|tx| tx.id == transaction_id))
            .cloned()
    }

    /// Active transaction on a connector
    pub async fn active_on(&self, connector_id: ConnectorId) -> Option<Transaction> {
        let ledger = self.ledger.lock().await;
        ledger
            .active
            .values()
            .find(|tx| tx.connector_id == connector_id)
            .cloned()
    }

    /// Active transactions, ordered by id
    pub async fn active(&self) -> Vec<Transaction> {
        let ledger = self.ledger.lock().await;
        let mut active: Vec<_> = ledger.active.values().cloned().collect();
        active.sort_by_key(|tx| tx.id);
        active
    }

    /// Finalized transactions in stop order
    pub async fn history(&self) -> Vec<Transaction> {
        self.ledger.lock().await.history.clone()
    }

    /// Transaction statistics
    pub async fn statistics(&self) -> TransactionStatistics {
        let ledger = self.ledger.lock().await;
        let samples = ledger
            .active
            .values()
            .chain(ledger.history.iter())
            .map(|tx| tx.meter_samples.len())
            .sum();

        TransactionStatistics {
            active_transactions: ledger.active.len(),
            completed_transactions: ledger.history.len(),
            total_transactions: ledger.active.len() + ledger.history.len(),
            total_energy_wh: ledger
                .history
                .iter()
                .map(|tx| i64::from(tx.energy_consumed()))
                .sum(),
            total_meter_samples: samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocpp_types::v16j::ChargePointStatus;

    async fn setup(connectors: u32) -> (Arc<ConnectorRegistry>, TransactionManager) {
        let (registry, _events) = ConnectorRegistry::new(connectors);
        let registry = Arc::new(registry);
        for id in 1..=connectors {
            registry
                .request_transition(id, ChargePointStatus::Preparing)
                .await
                .unwrap();
        }
        let manager = TransactionManager::new(registry.clone());
        (registry, manager)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_full_transaction_scenario() {
        let (registry, manager) = setup(1).await;

        let id = manager.start_transaction(1, "test-tag", 0, at(0)).await.unwrap();
        assert_eq!(id, TransactionId(1));
        registry
            .request_transition(1, ChargePointStatus::Charging)
            .await
            .unwrap();

        for (i, value) in [10, 20, 30].into_iter().enumerate() {
            manager
                .record_meter_sample(id, at(5 * (i as i64 + 1)), value)
                .await
                .unwrap();
        }

        let stopped = manager.stop_transaction(id, 50, at(20), Reason::Local).await.unwrap();
        assert_eq!(stopped.meter_samples.len(), 3);
        assert_eq!(stopped.meter_stop, Some(50));
        assert_eq!(stopped.energy_consumed(), 50);
        assert!(!stopped.is_active());

        registry
            .request_transition(1, ChargePointStatus::Finishing)
            .await
            .unwrap();
        registry
            .request_transition(1, ChargePointStatus::Available)
            .await
            .unwrap();
        assert_eq!(registry.state(1).await.unwrap().active_transaction, None);
    }

    #[tokio::test]
    async fn test_connector_busy() {
        let (_registry, manager) = setup(1).await;

        let first = manager.start_transaction(1, "tag-a", 0, at(0)).await.unwrap();
        for tag in ["tag-a", "tag-b"] {
            let err = manager.start_transaction(1, tag, 100, at(9)).await.unwrap_err();
            assert_eq!(
                err,
                ChargePointError::ConnectorBusy {
                    connector_id: 1,
                    transaction_id: first
                }
            );
        }
    }

    #[tokio::test]
    async fn test_invalid_connector_and_id_tag() {
        let (_registry, manager) = setup(1).await;

        assert_eq!(
            manager.start_transaction(2, "tag", 0, at(0)).await.unwrap_err(),
            ChargePointError::InvalidConnector(2)
        );
        assert_eq!(
            manager.start_transaction(0, "tag", 0, at(0)).await.unwrap_err(),
            ChargePointError::InvalidConnector(0)
        );
        assert!(matches!(
            manager.start_transaction(1, "", 0, at(0)).await,
            Err(ChargePointError::Validation { .. })
        ));
        assert!(matches!(
            manager.start_transaction(1, &"x".repeat(21), 0, at(0)).await,
            Err(ChargePointError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_ids_increase_and_are_never_reused() {
        let (registry, manager) = setup(2).await;

        let mut seen = Vec::new();
        for round in 0..3 {
            for connector in 1..=2 {
                let id = manager
                    .start_transaction(connector, "tag", 0, at(round))
                    .await
                    .unwrap();
                seen.push(id);
                manager.stop_transaction(id, 1, at(round), Reason::Local).await.unwrap();
            }
            // Connectors stay Preparing without an open transaction
            assert_eq!(registry.status(1).await.unwrap(), ChargePointStatus::Preparing);
        }

        let ids: Vec<i32> = seen.iter().map(|id| id.value()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_unknown_transaction() {
        let (_registry, manager) = setup(1).await;
        let missing = TransactionId(99);

        assert_eq!(
            manager.record_meter_sample(missing, at(0), 1).await.unwrap_err(),
            ChargePointError::UnknownTransaction(99)
        );
        assert!(manager.stop_transaction(missing, 1, at(0), Reason::Local).await.is_err());

        let id = manager.start_transaction(1, "tag", 0, at(0)).await.unwrap();
        manager.stop_transaction(id, 1, at(1), Reason::Local).await.unwrap();
        // Closed transactions accept nothing more
        assert!(manager.record_meter_sample(id, at(2), 2).await.is_err());
        assert!(manager.stop_transaction(id, 2, at(2), Reason::Local).await.is_err());
        assert!(manager.get(id).await.is_some());
    }

    #[tokio::test]
    async fn test_remote_id_drives_stop_request() {
        let (_registry, manager) = setup(1).await;

        let id = manager.start_transaction(1, "test-tag", 0, at(0)).await.unwrap();
        manager.adopt_remote_id(id, 4711).await.unwrap();
        manager.record_meter_sample(id, at(5), 10).await.unwrap();
        assert_eq!(manager.find_by_wire_id(4711).await.map(|tx| tx.id), Some(id));

        let stopped = manager
            .stop_transaction(id, 10, at(10), Reason::EVDisconnected)
            .await
            .unwrap();
        let request = stopped.stop_request().unwrap();
        assert_eq!(request.transaction_id, 4711);
        assert_eq!(request.reason, Some(Reason::EVDisconnected));
        assert_eq!(request.transaction_data.map(|data| data.len()), Some(1));
    }

    #[tokio::test]
    async fn test_energy_saturates_on_extreme_meters() {
        let (_registry, manager) = setup(1).await;
        let id = manager.start_transaction(1, "test-tag", i32::MIN, at(0)).await.unwrap();

        let stopped = manager.stop_transaction(id, i32::MAX, at(60), Reason::Local).await.unwrap();
        assert_eq!(stopped.energy_consumed(), i32::MAX);
        assert_eq!(manager.statistics().await.total_energy_wh, i64::from(i32::MAX));
    }

    #[tokio::test]
    async fn test_statistics() {
        let (_registry, manager) = setup(2).await;

        let a = manager.start_transaction(1, "tag", 100, at(0)).await.unwrap();
        let _b = manager.start_transaction(2, "tag", 0, at(0)).await.unwrap();
        manager.record_meter_sample(a, at(1), 150).await.unwrap();
        manager.stop_transaction(a, 250, at(2), Reason::Local).await.unwrap();

        let stats = manager.statistics().await;
        assert_eq!(stats.active_transactions, 1);
        assert_eq!(stats.completed_transactions, 1);
        assert_eq!(stats.total_transactions, 2);
        assert_eq!(stats.total_energy_wh, 150);
        assert_eq!(stats.total_meter_samples, 1);
        assert_eq!(manager.history().await.len(), 1);
        assert_eq!(manager.active().await.len(), 1);
    }
}
