//! # OCPP Charge Point
//!
//! Charge point side of OCPP 1.6J:
//! - request/response correlation over any [`ocpp_transport::Transport`]
//! - connector state machines driven by the OCPP 1.6 transition table
//! - transaction bookkeeping with meter samples
//! - a policy router answering central system requests
//! - a session controller running boot, heartbeat and a charge cycle

pub mod config;
pub mod connector;
pub mod correlator;
pub mod error;
pub mod loopback;
pub mod router;
pub mod session;
pub mod state_machine;
pub mod transaction;

pub use config::{ChargePointConfig, DemoConfig, LogFormat, LoggingConfig, ReconnectConfig, VendorInfo};
pub use connector::{ConnectorRegistry, ConnectorState, StatusEvent};
pub use correlator::{Correlator, PendingInfo, DEFAULT_REQUEST_TIMEOUT};
pub use error::{ChargePointError, ChargePointResult, ErrorCategory, ErrorSeverity};
pub use loopback::{LoopbackCentralSystem, LoopbackOptions};
pub use router::{Reply, RouteEntry, RoutePolicy, Router, RouterPolicy};
pub use session::{ChargeCycleOutcome, SessionController, SessionEvent, SessionState, SessionStateMachine};
pub use state_machine::{ConnectorStateMachine, StateTransition, TransitionRejection, TransitionTrigger};
pub use transaction::{MeterSample, Transaction, TransactionManager, TransactionStatistics};
