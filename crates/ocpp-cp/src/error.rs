//! # Charge Point Error Handling
//!
//! One error type for the engine. Envelope errors from `ocpp-types` and
//! transport failures convert into it, so the session code can use `?`
//! across layers and still classify what went wrong.

use crate::state_machine::TransitionRejection;
use ocpp_transport::TransportError;
use ocpp_types::{CallErrorCode, OcppError, TransactionId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChargePointError {
    /// Malformed envelope or unexpected frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout: {action} after {duration_ms}ms")]
    Timeout { action: String, duration_ms: u64 },

    /// Session closed while the request was outstanding
    #[error("Request cancelled: {action}")]
    Cancelled { action: String },

    #[error("Connector {connector_id} busy with transaction {transaction_id}")]
    ConnectorBusy {
        connector_id: u32,
        transaction_id: TransactionId,
    },

    #[error("Invalid connector: {0}")]
    InvalidConnector(u32),

    #[error("Unknown transaction: {0}")]
    UnknownTransaction(i32),

    #[error("Transition rejected: {0}")]
    Rejected(TransitionRejection),

    /// Deliberate refusal by the request router
    #[error("Rejected by policy: {action}")]
    RejectedByPolicy { action: String },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The central system answered with a CallError
    #[error("Central system error {code}: {description}")]
    CallError {
        code: CallErrorCode,
        description: String,
    },

    #[error("Boot notification failed: {reason}")]
    BootFailed { reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl ChargePointError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn timeout(action: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            action: action.into(),
            duration_ms,
        }
    }

    pub fn cancelled(action: impl Into<String>) -> Self {
        Self::Cancelled {
            action: action.into(),
        }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost(message.into())
    }

    pub fn call_error(code: CallErrorCode, description: impl Into<String>) -> Self {
        Self::CallError {
            code,
            description: description.into(),
        }
    }

    pub fn boot_failed(reason: impl Into<String>) -> Self {
        Self::BootFailed {
            reason: reason.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    /// Worth retrying the same operation later
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. }
            | Self::ConnectionLost(_)
            | Self::CallError { .. }
            | Self::BootFailed { .. }
            | Self::Protocol(_) => true,

            Self::Cancelled { .. }
            | Self::ConnectorBusy { .. }
            | Self::InvalidConnector(_)
            | Self::UnknownTransaction(_)
            | Self::Rejected(_)
            | Self::RejectedByPolicy { .. }
            | Self::Serialization(_)
            | Self::Validation { .. }
            | Self::Configuration(_)
            | Self::InvalidOperation(_) => false,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::RejectedByPolicy { .. }
            | Self::Rejected(_)
            | Self::ConnectorBusy { .. }
            | Self::Validation { .. }
            | Self::InvalidOperation(_)
            | Self::Cancelled { .. } => ErrorSeverity::Warning,

            Self::Timeout { .. }
            | Self::ConnectionLost(_)
            | Self::CallError { .. }
            | Self::Protocol(_)
            | Self::InvalidConnector(_)
            | Self::UnknownTransaction(_)
            | Self::Serialization(_) => ErrorSeverity::Error,

            Self::BootFailed { .. } | Self::Configuration(_) => ErrorSeverity::Critical,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConnectionLost(_) | Self::Cancelled { .. } => ErrorCategory::Network,
            Self::Protocol(_) | Self::Serialization(_) | Self::CallError { .. } => {
                ErrorCategory::Protocol
            }
            Self::Configuration(_) | Self::Validation { .. } => ErrorCategory::Configuration,
            Self::Rejected(_) | Self::InvalidConnector(_) => ErrorCategory::Connector,
            Self::ConnectorBusy { .. } | Self::UnknownTransaction(_) => ErrorCategory::Transaction,
            Self::Timeout { .. } => ErrorCategory::Performance,
            Self::RejectedByPolicy { .. } => ErrorCategory::Policy,
            Self::BootFailed { .. } => ErrorCategory::System,
            Self::InvalidOperation(_) => ErrorCategory::Logic,
        }
    }

    /// Suggested retry delay in milliseconds
    pub fn suggested_retry_delay(&self) -> Option<u64> {
        match self {
            Self::ConnectionLost(_) => Some(5000),
            Self::Timeout { .. } => Some(1000),
            Self::CallError { .. } => Some(10000),
            Self::BootFailed { .. } => Some(30000),
            _ => None,
        }
    }
}

impl From<TransitionRejection> for ChargePointError {
    fn from(rejection: TransitionRejection) -> Self {
        match rejection {
            TransitionRejection::ConnectorUnknown(id) => Self::InvalidConnector(id),
            other => Self::Rejected(other),
        }
    }
}

impl From<OcppError> for ChargePointError {
    fn from(err: OcppError) -> Self {
        match err {
            OcppError::Validation { field, message } => Self::Validation { field, message },
            OcppError::Json { message } => Self::Serialization(message),
            OcppError::InvalidConnectorId(id) => Self::InvalidConnector(id),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<TransportError> for ChargePointError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::InvalidUrl { message } => Self::Configuration(message),
            other => Self::ConnectionLost(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ChargePointError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Operation refused, engine state is intact
    Warning,
    /// Operation failed, engine is stable
    Error,
    /// Session cannot continue
    Critical,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Network,
    Protocol,
    Configuration,
    Connector,
    Transaction,
    Performance,
    Policy,
    System,
    Logic,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

pub type ChargePointResult<T> = Result<T, ChargePointError>;
