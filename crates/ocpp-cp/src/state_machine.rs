//! # Connector State Machine
//!
//! Transition rules for a single connector. The machine is target driven:
//! callers ask for a new status and the machine either moves there or
//! returns a [`TransitionRejection`] with the state left untouched.
//!
//! ```text
//! Available -> Preparing -> Charging -> Finishing -> Available
//! Available <-> Unavailable        Available <-> Reserved -> Preparing
//! any -> Faulted                   Faulted -> Available (reset only)
//! ```

use chrono::{DateTime, Utc};
use ocpp_types::v16j::{ChargePointErrorCode, ChargePointStatus};
use ocpp_types::TransactionId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, info, warn};

const MAX_HISTORY: usize = 100;

/// Why a requested transition was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionRejection {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: ChargePointStatus,
        to: ChargePointStatus,
    },

    #[error("connector {0} is unknown")]
    ConnectorUnknown(u32),

    #[error("transaction {transaction_id} in progress on connector {connector_id}")]
    TransactionInProgress {
        connector_id: u32,
        transaction_id: TransactionId,
    },

    #[error("connector {0} has no active transaction")]
    NoActiveTransaction(u32),
}

/// What caused a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionTrigger {
    /// Ordinary status change requested by the session or router
    Request,
    /// Hardware fault signal
    Fault(ChargePointErrorCode),
    /// Explicit reset
    Reset,
}

/// Record of a completed transition
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub connector_id: u32,
    pub from_state: ChargePointStatus,
    pub to_state: ChargePointStatus,
    pub trigger: TransitionTrigger,
    pub timestamp: DateTime<Utc>,
}

/// Whether the table permits `from -> to` for an ordinary request.
///
/// Faulted is reachable from everywhere and left only through reset, so it
/// never appears as a source here.
pub fn is_allowed(from: ChargePointStatus, to: ChargePointStatus) -> bool {
    use ChargePointStatus::*;

    match (from, to) {
        (_, Faulted) => from != Faulted,
        (Available, Preparing | Reserved | Unavailable) => true,
        (Preparing, Available | Charging | Finishing) => true,
        (Charging, Finishing) => true,
        (Finishing, Available) => true,
        (Reserved, Available | Preparing | Unavailable) => true,
        (Unavailable, Available) => true,
        _ => false,
    }
}

/// State machine for one connector
#[derive(Debug)]
pub struct ConnectorStateMachine {
    connector_id: u32,
    current_state: ChargePointStatus,
    previous_state: Option<ChargePointStatus>,
    history: VecDeque<StateTransition>,
}

impl ConnectorStateMachine {
    pub fn new(connector_id: u32, initial_state: ChargePointStatus) -> Self {
        Self {
            connector_id,
            current_state: initial_state,
            previous_state: None,
            history: VecDeque::new(),
        }
    }

    pub fn current_state(&self) -> ChargePointStatus {
        self.current_state
    }

    pub fn previous_state(&self) -> Option<ChargePointStatus> {
        self.previous_state
    }

    /// Check a request without applying it
    pub fn check(
        &self,
        target: ChargePointStatus,
        active_transaction: Option<TransactionId>,
    ) -> Result<(), TransitionRejection> {
        use ChargePointStatus::*;

        let from = self.current_state;
        if from == target || !is_allowed(from, target) {
            return Err(TransitionRejection::InvalidTransition { from, to: target });
        }

        match (target, active_transaction) {
            (Charging, None) => Err(TransitionRejection::NoActiveTransaction(self.connector_id)),
            (Available | Unavailable | Reserved, Some(transaction_id)) => {
                Err(TransitionRejection::TransactionInProgress {
                    connector_id: self.connector_id,
                    transaction_id,
                })
            }
            _ => Ok(()),
        }
    }

    /// Move to `target` if the table and the transaction precondition allow it
    pub fn transition_to(
        &mut self,
        target: ChargePointStatus,
        active_transaction: Option<TransactionId>,
    ) -> Result<StateTransition, TransitionRejection> {
        debug!(
            "Connector {} requested {} -> {}",
            self.connector_id, self.current_state, target
        );

        if let Err(rejection) = self.check(target, active_transaction) {
            warn!("Connector {} transition rejected: {}", self.connector_id, rejection);
            return Err(rejection);
        }
        Ok(self.apply(target, TransitionTrigger::Request))
    }

    /// Any state except Faulted itself moves to Faulted
    pub fn fault(
        &mut self,
        error_code: ChargePointErrorCode,
    ) -> Result<StateTransition, TransitionRejection> {
        if self.current_state == ChargePointStatus::Faulted {
            return Err(TransitionRejection::InvalidTransition {
                from: ChargePointStatus::Faulted,
                to: ChargePointStatus::Faulted,
            });
        }
        Ok(self.apply(ChargePointStatus::Faulted, TransitionTrigger::Fault(error_code)))
    }

    /// Return to Available. The only way out of Faulted; refused while a
    /// transaction is still open.
    pub fn reset(
        &mut self,
        active_transaction: Option<TransactionId>,
    ) -> Result<StateTransition, TransitionRejection> {
        if let Some(transaction_id) = active_transaction {
            return Err(TransitionRejection::TransactionInProgress {
                connector_id: self.connector_id,
                transaction_id,
            });
        }
        if self.current_state == ChargePointStatus::Available {
            return Err(TransitionRejection::InvalidTransition {
                from: ChargePointStatus::Available,
                to: ChargePointStatus::Available,
            });
        }
        Ok(self.apply(ChargePointStatus::Available, TransitionTrigger::Reset))
    }

    fn apply(&mut self, target: ChargePointStatus, trigger: TransitionTrigger) -> StateTransition {
        let transition = StateTransition {
            connector_id: self.connector_id,
            from_state: self.current_state,
            to_state: target,
            trigger,
            timestamp: Utc::now(),
        };
        self.previous_state = Some(self.current_state);
        self.current_state = target;

        info!(
            "Connector {} state transition: {} -> {} ({:?})",
            self.connector_id, transition.from_state, transition.to_state, trigger
        );

        if self.history.len() >= MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(transition.clone());
        transition
    }

    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.history.iter()
    }

    pub fn last_transition(&self) -> Option<&StateTransition> {
        self.history.back()
    }

    /// Connector can accept a new user
    pub fn is_available_for_transaction(&self) -> bool {
        matches!(
            self.current_state,
            ChargePointStatus::Available | ChargePointStatus::Reserved
        )
    }

    pub fn is_operational(&self) -> bool {
        !matches!(
            self.current_state,
            ChargePointStatus::Faulted | ChargePointStatus::Unavailable
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ChargePointStatus::*;

    const TX: Option<TransactionId> = Some(TransactionId(1));

    #[test]
    fn test_main_charging_path() {
        let mut sm = ConnectorStateMachine::new(1, Available);

        sm.transition_to(Preparing, None).unwrap();
        sm.transition_to(Charging, TX).unwrap();
        sm.transition_to(Finishing, TX).unwrap();
        sm.transition_to(Available, None).unwrap();

        let path: Vec<_> = sm.history().map(|t| t.to_state).collect();
        assert_eq!(path, vec![Preparing, Charging, Finishing, Available]);
        assert_eq!(sm.previous_state(), Some(Finishing));
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let mut sm = ConnectorStateMachine::new(1, Available);
        let err = sm.transition_to(Charging, TX).unwrap_err();

        assert_eq!(
            err,
            TransitionRejection::InvalidTransition {
                from: Available,
                to: Charging
            }
        );
        assert_eq!(sm.current_state(), Available);
        assert!(sm.last_transition().is_none());
    }

    #[test]
    fn test_charging_requires_transaction() {
        let mut sm = ConnectorStateMachine::new(2, Preparing);
        assert_eq!(
            sm.transition_to(Charging, None).unwrap_err(),
            TransitionRejection::NoActiveTransaction(2)
        );
    }

    #[test]
    fn test_unplug_rejected_while_transaction_open() {
        let mut sm = ConnectorStateMachine::new(1, Preparing);
        assert_eq!(
            sm.transition_to(Available, TX).unwrap_err(),
            TransitionRejection::TransactionInProgress {
                connector_id: 1,
                transaction_id: TransactionId(1)
            }
        );
        assert!(sm.transition_to(Available, None).is_ok());
    }

    #[test]
    fn test_fault_from_any_state_and_reset() {
        for status in ChargePointStatus::ALL {
            let mut sm = ConnectorStateMachine::new(1, status);
            if status == Faulted {
                assert!(sm.fault(ChargePointErrorCode::GroundFailure).is_err());
                continue;
            }
            let transition = sm.fault(ChargePointErrorCode::GroundFailure).unwrap();
            assert_eq!(
                transition.trigger,
                TransitionTrigger::Fault(ChargePointErrorCode::GroundFailure)
            );
            assert_eq!(sm.current_state(), Faulted);
        }

        let mut sm = ConnectorStateMachine::new(1, Faulted);
        for target in ChargePointStatus::ALL {
            assert!(sm.transition_to(target, None).is_err());
        }
        let transition = sm.reset(None).unwrap();
        assert_eq!(transition.trigger, TransitionTrigger::Reset);
        assert_eq!(sm.current_state(), Available);
    }

    #[test]
    fn test_reset_refused_with_open_transaction() {
        let mut sm = ConnectorStateMachine::new(1, Faulted);
        assert!(matches!(
            sm.reset(TX),
            Err(TransitionRejection::TransactionInProgress { .. })
        ));
        assert_eq!(sm.current_state(), Faulted);
    }

    #[test]
    fn test_table_matches_allowed_pairs() {
        let allowed = [
            (Available, Preparing),
            (Available, Reserved),
            (Available, Unavailable),
            (Preparing, Available),
            (Preparing, Charging),
            (Preparing, Finishing),
            (Charging, Finishing),
            (Finishing, Available),
            (Reserved, Available),
            (Reserved, Preparing),
            (Reserved, Unavailable),
            (Unavailable, Available),
        ];

        for from in ChargePointStatus::ALL {
            for to in ChargePointStatus::ALL {
                let expected = allowed.contains(&(from, to)) || (to == Faulted && from != Faulted);
                assert_eq!(is_allowed(from, to), expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_random_walk_stays_in_table() {
        // Deterministic pseudo-random sequence over all targets.
        let mut sm = ConnectorStateMachine::new(1, Available);
        let mut seed: u32 = 7;
        for _ in 0..500 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let target = ChargePointStatus::ALL[(seed >> 16) as usize % 7];
            let tx = if seed & 1 == 0 { TX } else { None };
            let before = sm.current_state();
            match sm.transition_to(target, tx) {
                Ok(t) => assert!(is_allowed(t.from_state, t.to_state)),
                Err(_) => assert_eq!(sm.current_state(), before),
            }
            if sm.current_state() == Faulted {
                sm.reset(None).unwrap();
            }
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let mut sm = ConnectorStateMachine::new(1, Available);
        for _ in 0..60 {
            sm.transition_to(Unavailable, None).unwrap();
            sm.transition_to(Available, None).unwrap();
        }
        assert_eq!(sm.history().count(), MAX_HISTORY);
    }

    #[test]
    fn test_state_queries() {
        let sm = ConnectorStateMachine::new(1, Reserved);
        assert!(sm.is_available_for_transaction());
        assert!(sm.is_operational());
        assert!(!ConnectorStateMachine::new(1, Unavailable).is_operational());
    }
}
