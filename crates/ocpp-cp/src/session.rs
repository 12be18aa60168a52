//! # Charge Point Session
//!
//! [`SessionController`] owns one connection attempt: connect, boot,
//! status broadcast, heartbeat, the demonstration charge cycle and the
//! orderly shutdown. Progress is tracked by [`SessionStateMachine`], which
//! only moves on explicit [`SessionEvent`]s.

use crate::config::ChargePointConfig;
use crate::connector::{ConnectorRegistry, StatusEvent};
use crate::correlator::Correlator;
use crate::error::{ChargePointError, ChargePointResult, ErrorSeverity};
use crate::router::Router;
use crate::transaction::{Transaction, TransactionManager};
use chrono::Utc;
use ocpp_messages::v16j::{
    AuthorizeRequest, BootNotificationResponse, HeartbeatRequest, MeterValuesRequest,
    StartTransactionRequest, StatusNotificationRequest,
};
use ocpp_transport::Transport;
use ocpp_types::meter::{MeterValue, ReadingContext};
use ocpp_types::v16j::{AuthorizationStatus, ChargePointStatus, Reason, RegistrationStatus};
use ocpp_types::ConnectorId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where the session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Boot,
    Idle,
    Authorizing,
    Preparing,
    Charging,
    Finishing,
    Disconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Input that moves the session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    ConnectRequested,
    Connected,
    BootAccepted,
    BootRejected,
    AuthorizeRequested,
    AuthorizeAccepted,
    AuthorizeRejected,
    TransactionStarted,
    StopRequested,
    TransactionStopped,
    /// A charge cycle failed after authorization and was unwound
    CycleAborted,
    DisconnectRequested,
    Closed,
    ConnectionLost,
}

impl SessionState {
    /// Boot accepted and the link still up
    pub fn is_online(&self) -> bool {
        !matches!(
            self,
            Self::Disconnected | Self::Connecting | Self::Boot | Self::Disconnecting
        )
    }
}

/// Target state for `event` in `state`, `None` if the event is not valid there
pub fn next_state(state: SessionState, event: SessionEvent) -> Option<SessionState> {
    use SessionEvent as E;
    use SessionState as S;

    let next = match (state, event) {
        (S::Disconnected, E::ConnectRequested) => S::Connecting,
        (S::Connecting, E::Connected) => S::Boot,
        (S::Boot, E::BootAccepted) => S::Idle,
        (S::Boot, E::BootRejected) => S::Disconnected,
        (S::Idle, E::AuthorizeRequested) => S::Authorizing,
        (S::Authorizing, E::AuthorizeAccepted) => S::Preparing,
        (S::Authorizing, E::AuthorizeRejected) => S::Idle,
        (S::Preparing, E::TransactionStarted) => S::Charging,
        (S::Preparing | S::Charging, E::StopRequested) => S::Finishing,
        (S::Finishing, E::TransactionStopped) => S::Idle,
        (S::Preparing | S::Charging | S::Finishing, E::CycleAborted) => S::Idle,
        (S::Disconnected | S::Disconnecting, E::DisconnectRequested) => return None,
        (_, E::DisconnectRequested) => S::Disconnecting,
        (S::Disconnecting, E::Closed) => S::Disconnected,
        (S::Disconnected, E::ConnectionLost) => return None,
        (_, E::ConnectionLost) => S::Disconnected,
        _ => return None,
    };
    Some(next)
}

/// Session state guarded by [`next_state`]
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    state: SessionState,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Apply an event. An invalid event leaves the state unchanged.
    pub fn apply(&mut self, event: SessionEvent) -> ChargePointResult<SessionState> {
        let next = next_state(self.state, event).ok_or_else(|| {
            ChargePointError::invalid_operation(format!(
                "session event {:?} not valid in state {}",
                event, self.state
            ))
        })?;
        debug!("Session {} -> {} ({:?})", self.state, next, event);
        self.state = next;
        Ok(next)
    }
}

/// How a charge cycle ended
#[derive(Debug, Clone, PartialEq)]
pub enum ChargeCycleOutcome {
    /// The transaction ran and was stopped
    Completed(Transaction),
    /// Authorize refused the id tag, nothing was started
    NotAuthorized(AuthorizationStatus),
}

/// Drives one charge point session over a transport
pub struct SessionController {
    config: ChargePointConfig,
    state: Arc<Mutex<SessionStateMachine>>,
    connectors: Arc<ConnectorRegistry>,
    transactions: Arc<TransactionManager>,
    router: Arc<Router>,
    correlator: Arc<Correlator>,
    status_events: Mutex<Option<mpsc::UnboundedReceiver<StatusEvent>>>,
    heartbeat_interval: Mutex<Duration>,
    background: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionController {
    /// Validate `config` and wire connectors, transactions, router and
    /// correlator onto `transport`
    pub fn new(config: ChargePointConfig, transport: Arc<dyn Transport>) -> ChargePointResult<Self> {
        config.validate()?;

        let (registry, status_events) = ConnectorRegistry::new(config.connector_count);
        let connectors = Arc::new(registry);
        let transactions = Arc::new(TransactionManager::new(connectors.clone()));
        let router = Arc::new(Router::new(
            config.router_policy,
            connectors.clone(),
            transactions.clone(),
        )?);
        let correlator = Correlator::new(transport, router.clone(), config.request_timeout());
        correlator.attach();

        let heartbeat_interval = Duration::from_secs(config.default_heartbeat_interval_secs);
        Ok(Self {
            config,
            state: Arc::new(Mutex::new(SessionStateMachine::new())),
            connectors,
            transactions,
            router,
            correlator,
            status_events: Mutex::new(Some(status_events)),
            heartbeat_interval: Mutex::new(heartbeat_interval),
            background: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ChargePointConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().state()
    }

    pub fn connectors(&self) -> &Arc<ConnectorRegistry> {
        &self.connectors
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Interval accepted at boot, or the configured default before that
    pub fn heartbeat_interval(&self) -> Duration {
        *self.heartbeat_interval.lock()
    }

    fn apply(&self, event: SessionEvent) -> ChargePointResult<SessionState> {
        self.state.lock().apply(event)
    }

    /// Mark the session disconnected when a call failed on a dead link
    fn note_failure(&self, error: ChargePointError) -> ChargePointError {
        if matches!(error, ChargePointError::ConnectionLost(_)) {
            // Already Disconnected if the watcher got there first.
            let _ = self.apply(SessionEvent::ConnectionLost);
        }
        error
    }

    /// Connect, boot and announce every connector
    pub async fn start(&self) -> ChargePointResult<BootNotificationResponse> {
        self.connect().await?;
        let response = self.boot().await?;
        self.broadcast_status().await?;
        Ok(response)
    }

    /// Open the transport to the configured endpoint
    pub async fn connect(&self) -> ChargePointResult<()> {
        self.apply(SessionEvent::ConnectRequested)?;
        let endpoint = self.config.endpoint();
        info!("Connecting to central system at {}", endpoint);

        if let Err(e) = self.correlator.transport().connect(&endpoint).await {
            error!("Connection to {} failed: {}", endpoint, e);
            self.apply(SessionEvent::ConnectionLost)?;
            return Err(e.into());
        }
        self.apply(SessionEvent::Connected)?;
        self.spawn_connection_watcher();
        info!("Connected to central system as {}", self.config.charge_point_id);
        Ok(())
    }

    fn spawn_connection_watcher(&self) {
        let correlator = self.correlator.clone();
        let state = self.state.clone();
        let stop = self.background.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = correlator.connection_lost() => {
                    let _ = state.lock().apply(SessionEvent::ConnectionLost);
                }
            }
        });
        self.workers.lock().push(handle);
    }

    /// BootNotification handshake. Pending is retried after the interval the
    /// central system asked for, up to `boot_retries` times.
    pub async fn boot(&self) -> ChargePointResult<BootNotificationResponse> {
        let request = self.config.vendor_info.boot_request();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            info!("Sending BootNotification (attempt {})", attempt);
            let response = match self.correlator.call(&request).await {
                Ok(response) => response,
                Err(ChargePointError::Timeout { duration_ms, .. }) => {
                    self.apply(SessionEvent::BootRejected)?;
                    return Err(ChargePointError::boot_failed(format!(
                        "no response within {duration_ms}ms"
                    )));
                }
                Err(ChargePointError::CallError { code, description }) => {
                    self.apply(SessionEvent::BootRejected)?;
                    return Err(ChargePointError::boot_failed(format!(
                        "central system answered {code}: {description}"
                    )));
                }
                Err(e) => return Err(self.note_failure(e)),
            };

            match response.status {
                RegistrationStatus::Accepted => {
                    let interval = self.interval_or_default(response.interval);
                    *self.heartbeat_interval.lock() = interval;
                    self.apply(SessionEvent::BootAccepted)?;
                    info!(
                        "Boot accepted, central system time {}, heartbeat every {:?}",
                        response.current_time, interval
                    );
                    self.spawn_background_tasks(interval);
                    return Ok(response);
                }
                RegistrationStatus::Pending if attempt <= self.config.boot_retries => {
                    let retry_in = self.interval_or_default(response.interval);
                    warn!("Boot pending, retrying in {:?}", retry_in);
                    tokio::time::sleep(retry_in).await;
                }
                RegistrationStatus::Pending => {
                    self.apply(SessionEvent::BootRejected)?;
                    return Err(ChargePointError::boot_failed(format!(
                        "still pending after {attempt} attempts"
                    )));
                }
                RegistrationStatus::Rejected => {
                    self.apply(SessionEvent::BootRejected)?;
                    return Err(ChargePointError::boot_failed("rejected by central system"));
                }
            }
        }
    }

    fn interval_or_default(&self, interval: i32) -> Duration {
        match u64::try_from(interval) {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            _ => Duration::from_secs(self.config.default_heartbeat_interval_secs),
        }
    }

    fn spawn_background_tasks(&self, heartbeat_interval: Duration) {
        let mut workers = self.workers.lock();
        workers.push(tokio::spawn(heartbeat(
            self.correlator.clone(),
            heartbeat_interval,
            self.background.clone(),
        )));

        if let Some(events) = self.status_events.lock().take() {
            workers.push(tokio::spawn(forward_status(
                self.correlator.clone(),
                events,
                self.background.clone(),
            )));
        }
    }

    /// StatusNotification for the charge point itself and each connector
    pub async fn broadcast_status(&self) -> ChargePointResult<()> {
        self.correlator
            .call(&StatusNotificationRequest::new(0, ChargePointStatus::Available))
            .await
            .map_err(|e| self.note_failure(e))?;

        for state in self.connectors.snapshot().await {
            let mut request = StatusNotificationRequest::new(state.id.value(), state.status);
            request.error_code = state.error_code;
            request.info = state.info.clone();
            request.timestamp = Some(Utc::now());
            self.correlator
                .call(&request)
                .await
                .map_err(|e| self.note_failure(e))?;
        }
        debug!("Status broadcast for {} connectors", self.connectors.count());
        Ok(())
    }

    /// Authorize, start, meter and stop one transaction on `connector_id`
    pub async fn run_charge_cycle(
        &self,
        connector_id: u32,
        id_tag: &str,
    ) -> ChargePointResult<ChargeCycleOutcome> {
        if !self.connectors.contains(connector_id) {
            return Err(ChargePointError::InvalidConnector(connector_id));
        }
        self.charge_cycle(connector_id, id_tag)
            .await
            .map_err(|e| self.note_failure(e))
    }

    async fn charge_cycle(&self, connector_id: u32, id_tag: &str) -> ChargePointResult<ChargeCycleOutcome> {
        self.apply(SessionEvent::AuthorizeRequested)?;
        let authorization = match self
            .correlator
            .call(&AuthorizeRequest {
                id_tag: id_tag.to_string(),
            })
            .await
        {
            Ok(response) => response.id_tag_info,
            Err(e) => {
                let _ = self.apply(SessionEvent::AuthorizeRejected);
                return Err(e);
            }
        };
        if !authorization.is_accepted() {
            warn!("Id tag {} not authorized: {:?}", id_tag, authorization.status);
            self.apply(SessionEvent::AuthorizeRejected)?;
            return Ok(ChargeCycleOutcome::NotAuthorized(authorization.status));
        }
        self.apply(SessionEvent::AuthorizeAccepted)?;

        match self.transaction_phase(connector_id, id_tag).await {
            Ok(transaction) => Ok(ChargeCycleOutcome::Completed(transaction)),
            Err(e) => {
                self.abort_cycle(connector_id, &e).await;
                Err(e)
            }
        }
    }

    async fn transaction_phase(&self, connector_id: u32, id_tag: &str) -> ChargePointResult<Transaction> {
        let demo = &self.config.demo;
        self.connectors
            .request_transition(connector_id, ChargePointStatus::Preparing)
            .await?;

        let started_at = Utc::now();
        let local_id = self
            .transactions
            .start_transaction(connector_id, id_tag, demo.meter_start_wh, started_at)
            .await?;
        let reservation_id = self
            .transactions
            .get(local_id)
            .await
            .and_then(|tx| tx.reservation_id);
        let started = self
            .correlator
            .call(&StartTransactionRequest {
                connector_id,
                id_tag: id_tag.to_string(),
                meter_start: demo.meter_start_wh,
                reservation_id,
                timestamp: started_at,
            })
            .await?;
        self.transactions
            .adopt_remote_id(local_id, started.transaction_id)
            .await?;
        self.apply(SessionEvent::TransactionStarted)?;

        let mut meter = demo.meter_start_wh;
        let mut reason = demo.stop_reason;
        if started.id_tag_info.is_accepted() {
            self.connectors
                .request_transition(connector_id, ChargePointStatus::Charging)
                .await?;
            info!(
                "Charging on connector {} (transaction {})",
                connector_id, started.transaction_id
            );

            let interval = Duration::from_secs(demo.sample_interval_secs);
            for sample in 1..=demo.samples {
                tokio::time::sleep(interval).await;
                match self.connectors.status(connector_id).await? {
                    ChargePointStatus::Finishing => {
                        info!("Transaction {} stopped remotely", started.transaction_id);
                        reason = Reason::Remote;
                        break;
                    }
                    ChargePointStatus::Faulted => {
                        warn!(
                            "Connector {} faulted during transaction {}",
                            connector_id, started.transaction_id
                        );
                        reason = Reason::Other;
                        break;
                    }
                    _ => {}
                }

                meter = demo
                    .meter_start_wh
                    .saturating_add(demo.meter_step_wh.saturating_mul(sample as i32));
                let sampled_at = Utc::now();
                self.transactions
                    .record_meter_sample(local_id, sampled_at, meter)
                    .await?;
                let request = MeterValuesRequest {
                    connector_id,
                    transaction_id: Some(started.transaction_id),
                    meter_value: vec![MeterValue::energy_register(
                        sampled_at,
                        meter,
                        ReadingContext::SamplePeriodic,
                    )],
                };
                // The sample stays in transactionData even if this report is lost.
                match self.correlator.call(&request).await {
                    Ok(_) => {}
                    Err(e @ (ChargePointError::ConnectionLost(_) | ChargePointError::Cancelled { .. })) => {
                        return Err(e)
                    }
                    Err(e) => warn!(
                        "MeterValues {} for transaction {} failed: {}",
                        sample, started.transaction_id, e
                    ),
                }
            }
        } else {
            warn!(
                "Central system refused transaction {}: {:?}",
                started.transaction_id, started.id_tag_info.status
            );
            reason = Reason::DeAuthorized;
        }

        self.apply(SessionEvent::StopRequested)?;
        if matches!(
            self.connectors.status(connector_id).await?,
            ChargePointStatus::Preparing | ChargePointStatus::Charging
        ) {
            self.connectors
                .request_transition(connector_id, ChargePointStatus::Finishing)
                .await?;
        }
        let transaction = self
            .transactions
            .stop_transaction(local_id, meter, Utc::now(), reason)
            .await?;
        self.correlator.call(&transaction.stop_request()?).await?;
        // A faulted connector stays Faulted until it is reset.
        if self.connectors.status(connector_id).await? == ChargePointStatus::Finishing {
            self.connectors
                .request_transition(connector_id, ChargePointStatus::Available)
                .await?;
        }
        self.apply(SessionEvent::TransactionStopped)?;

        info!(
            "Charge cycle on connector {} done: {} Wh in {} samples",
            connector_id,
            transaction.energy_consumed(),
            transaction.meter_samples.len()
        );
        Ok(transaction)
    }

    /// Unwind a cycle that failed after authorization: close the local
    /// transaction, free the connector and return the session to Idle.
    async fn abort_cycle(&self, connector_id: u32, cause: &ChargePointError) {
        if cause.severity() >= ErrorSeverity::Error {
            error!(
                "Charge cycle on connector {} aborted ({}): {}",
                connector_id,
                cause.category(),
                cause
            );
        } else {
            warn!("Charge cycle on connector {} aborted: {}", connector_id, cause);
        }

        let link_down = matches!(
            cause,
            ChargePointError::ConnectionLost(_) | ChargePointError::Cancelled { .. }
        );
        let open = match ConnectorId::new(connector_id) {
            Ok(id) => self.transactions.active_on(id).await,
            Err(_) => None,
        };
        if let Some(open) = open {
            let meter = open
                .latest_sample()
                .map(|sample| sample.value)
                .unwrap_or(open.meter_start);
            match self
                .transactions
                .stop_transaction(open.id, meter, Utc::now(), Reason::Other)
                .await
            {
                // Only a transaction the central system confirmed is reported.
                Ok(stopped) if stopped.remote_id.is_some() && !link_down => {
                    let sent = match stopped.stop_request() {
                        Ok(request) => self.correlator.call(&request).await.map(|_| ()),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        warn!("StopTransaction for {} failed: {}", stopped.wire_id(), e);
                    }
                }
                Ok(stopped) => debug!("Transaction {} closed locally", stopped.id),
                Err(e) => warn!("Could not close transaction {}: {}", open.id, e),
            }
        }

        let path: &[ChargePointStatus] = match self.connectors.status(connector_id).await {
            Ok(ChargePointStatus::Charging) => &[ChargePointStatus::Finishing, ChargePointStatus::Available],
            Ok(ChargePointStatus::Preparing | ChargePointStatus::Finishing) => &[ChargePointStatus::Available],
            _ => &[],
        };
        for &target in path {
            if let Err(e) = self.connectors.request_transition(connector_id, target).await {
                warn!("Connector {} not returned to Available: {}", connector_id, e);
                break;
            }
        }

        if let Err(e) = self.apply(SessionEvent::CycleAborted) {
            debug!("Session not unwound: {}", e);
        }
    }

    /// Stop open transactions, report every connector Unavailable, then
    /// cancel whatever is still pending and close the link.
    pub async fn shutdown(&self) -> ChargePointResult<()> {
        info!("Shutting down session {}", self.config.charge_point_id);
        let online = self.apply(SessionEvent::DisconnectRequested).is_ok();

        if online {
            self.stop_active_transactions().await;
            self.take_connectors_offline().await;
        }
        self.stop_background_tasks().await;

        if online {
            if let Err(e) = self
                .correlator
                .call(&StatusNotificationRequest::new(0, ChargePointStatus::Unavailable))
                .await
            {
                warn!("Final status notification failed: {}", e);
            }
        }

        self.correlator.cancel_all();
        if let Err(e) = self.correlator.transport().close().await {
            warn!("Closing transport failed: {}", e);
        }
        if online {
            self.apply(SessionEvent::Closed)?;
        }
        info!("Session {} closed", self.config.charge_point_id);
        Ok(())
    }

    async fn stop_active_transactions(&self) {
        for transaction in self.transactions.active().await {
            let connector_id = transaction.connector_id.value();
            let status = self.connectors.status(connector_id).await.ok();
            if status != Some(ChargePointStatus::Finishing) {
                if let Err(e) = self
                    .connectors
                    .request_transition(connector_id, ChargePointStatus::Finishing)
                    .await
                {
                    debug!("Connector {} not moved to Finishing: {}", connector_id, e);
                }
            }

            let meter = transaction
                .latest_sample()
                .map(|sample| sample.value)
                .unwrap_or(transaction.meter_start);
            let stopped = match self
                .transactions
                .stop_transaction(transaction.id, meter, Utc::now(), Reason::Local)
                .await
            {
                Ok(stopped) => stopped,
                Err(e) => {
                    warn!("Could not stop transaction {}: {}", transaction.id, e);
                    continue;
                }
            };
            let sent = match stopped.stop_request() {
                Ok(request) => self.correlator.call(&request).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!("StopTransaction for {} failed: {}", stopped.wire_id(), e);
            }
        }
    }

    async fn take_connectors_offline(&self) {
        for id in self.connectors.connector_ids() {
            let connector_id = id.value();
            match self.connectors.status(connector_id).await {
                Ok(ChargePointStatus::Unavailable) | Err(_) => continue,
                Ok(ChargePointStatus::Available) => {}
                Ok(_) => {
                    if let Err(e) = self.connectors.reset(connector_id).await {
                        warn!("Connector {} reset failed: {}", connector_id, e);
                        continue;
                    }
                }
            }
            if let Err(e) = self
                .connectors
                .request_transition(connector_id, ChargePointStatus::Unavailable)
                .await
            {
                warn!("Connector {} not taken offline: {}", connector_id, e);
            }
        }
    }

    async fn stop_background_tasks(&self) {
        self.background.cancel();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.background.cancel();
        self.correlator.cancel_all();
    }
}

async fn heartbeat(correlator: Arc<Correlator>, period: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match correlator.call(&HeartbeatRequest {}).await {
            Ok(response) => debug!("Heartbeat, central system time {}", response.current_time),
            Err(e @ (ChargePointError::ConnectionLost(_) | ChargePointError::Cancelled { .. })) => {
                debug!("Heartbeat stopped: {}", e);
                break;
            }
            Err(e) => warn!("Heartbeat failed: {}", e),
        }
    }
}

/// Report connector transitions in the order they happened. On stop,
/// whatever is already queued is still sent.
async fn forward_status(
    correlator: Arc<Correlator>,
    mut events: mpsc::UnboundedReceiver<StatusEvent>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
            _ = stop.cancelled() => break,
        };
        send_status(&correlator, event).await;
    }

    while let Ok(event) = events.try_recv() {
        send_status(&correlator, event).await;
    }
}

async fn send_status(correlator: &Correlator, event: StatusEvent) {
    if let Err(e) = correlator.call(&event.to_request()).await {
        warn!(
            "StatusNotification {} for connector {} failed: {}",
            event.status, event.connector_id, e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENTS: [SessionEvent; 14] = [
        SessionEvent::ConnectRequested,
        SessionEvent::Connected,
        SessionEvent::BootAccepted,
        SessionEvent::BootRejected,
        SessionEvent::AuthorizeRequested,
        SessionEvent::AuthorizeAccepted,
        SessionEvent::AuthorizeRejected,
        SessionEvent::TransactionStarted,
        SessionEvent::StopRequested,
        SessionEvent::TransactionStopped,
        SessionEvent::CycleAborted,
        SessionEvent::DisconnectRequested,
        SessionEvent::Closed,
        SessionEvent::ConnectionLost,
    ];

    #[test]
    fn test_full_session_path() {
        let mut session = SessionStateMachine::new();
        let path = [
            (SessionEvent::ConnectRequested, SessionState::Connecting),
            (SessionEvent::Connected, SessionState::Boot),
            (SessionEvent::BootAccepted, SessionState::Idle),
            (SessionEvent::AuthorizeRequested, SessionState::Authorizing),
            (SessionEvent::AuthorizeAccepted, SessionState::Preparing),
            (SessionEvent::TransactionStarted, SessionState::Charging),
            (SessionEvent::StopRequested, SessionState::Finishing),
            (SessionEvent::TransactionStopped, SessionState::Idle),
            (SessionEvent::DisconnectRequested, SessionState::Disconnecting),
            (SessionEvent::Closed, SessionState::Disconnected),
        ];
        for (event, expected) in path {
            assert_eq!(session.apply(event).unwrap(), expected);
        }
    }

    #[test]
    fn test_invalid_event_keeps_state() {
        let mut session = SessionStateMachine::new();
        let err = session.apply(SessionEvent::AuthorizeRequested).unwrap_err();
        assert!(matches!(err, ChargePointError::InvalidOperation(_)));
        assert_eq!(session.state(), SessionState::Disconnected);

        session.apply(SessionEvent::ConnectRequested).unwrap();
        session.apply(SessionEvent::Connected).unwrap();
        assert!(session.apply(SessionEvent::TransactionStarted).is_err());
        assert_eq!(session.state(), SessionState::Boot);
    }

    #[test]
    fn test_boot_rejected_returns_to_disconnected() {
        let mut session = SessionStateMachine::new();
        session.apply(SessionEvent::ConnectRequested).unwrap();
        session.apply(SessionEvent::Connected).unwrap();
        assert_eq!(
            session.apply(SessionEvent::BootRejected).unwrap(),
            SessionState::Disconnected
        );
        assert!(!session.state().is_online());
    }

    #[test]
    fn test_connection_lost_from_any_connected_state() {
        let states = [
            SessionState::Connecting,
            SessionState::Boot,
            SessionState::Idle,
            SessionState::Authorizing,
            SessionState::Preparing,
            SessionState::Charging,
            SessionState::Finishing,
            SessionState::Disconnecting,
        ];
        for state in states {
            assert_eq!(
                next_state(state, SessionEvent::ConnectionLost),
                Some(SessionState::Disconnected),
                "{state}"
            );
        }
        assert_eq!(
            next_state(SessionState::Disconnected, SessionEvent::ConnectionLost),
            None
        );
    }

    #[test]
    fn test_every_state_event_pair_is_decided() {
        let states = [
            SessionState::Disconnected,
            SessionState::Connecting,
            SessionState::Boot,
            SessionState::Idle,
            SessionState::Authorizing,
            SessionState::Preparing,
            SessionState::Charging,
            SessionState::Finishing,
            SessionState::Disconnecting,
        ];
        for state in states {
            for event in EVENTS {
                let mut session = SessionStateMachine { state };
                match next_state(state, event) {
                    Some(next) => assert_eq!(session.apply(event).unwrap(), next),
                    None => {
                        assert!(session.apply(event).is_err());
                        assert_eq!(session.state(), state);
                    }
                }
            }
        }
    }

    #[test]
    fn test_aborted_cycle_returns_to_idle() {
        for state in [SessionState::Preparing, SessionState::Charging, SessionState::Finishing] {
            assert_eq!(
                next_state(state, SessionEvent::CycleAborted),
                Some(SessionState::Idle),
                "{state}"
            );
        }
        assert_eq!(next_state(SessionState::Idle, SessionEvent::CycleAborted), None);
        assert_eq!(next_state(SessionState::Authorizing, SessionEvent::CycleAborted), None);
    }

    #[test]
    fn test_stop_before_start_is_allowed() {
        assert_eq!(
            next_state(SessionState::Preparing, SessionEvent::StopRequested),
            Some(SessionState::Finishing)
        );
        assert_eq!(
            next_state(SessionState::Idle, SessionEvent::StopRequested),
            None
        );
    }
}
