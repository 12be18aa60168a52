//! Error types for envelope handling and value validation

use std::str::FromStr;
use thiserror::Error;

/// Error raised while building or parsing OCPP-J frames
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OcppError {
    /// First array element is not 2, 3 or 4
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u64),

    /// Connector 0 used where a physical connector is required
    #[error("Invalid connector ID: {0} (must be > 0)")]
    InvalidConnectorId(u32),

    /// JSON serialization/deserialization error
    #[error("JSON error: {message}")]
    Json { message: String },

    /// Frame does not have the OCPP-J array shape. `unique_id` is kept
    /// when it could still be read so the peer can be answered.
    #[error("Malformed frame: {message}")]
    MalformedFrame {
        message: String,
        unique_id: Option<String>,
    },

    /// CallError carried an error code outside the OCPP 1.6 set
    #[error("Unknown call error code: {0}")]
    UnknownErrorCode(String),

    /// Field value violates a constraint of the protocol
    #[error("Validation error on {field}: {message}")]
    Validation { field: String, message: String },
}

impl OcppError {
    pub fn malformed(message: impl Into<String>, unique_id: Option<String>) -> Self {
        OcppError::MalformedFrame {
            message: message.into(),
            unique_id,
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        OcppError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for OcppError {
    fn from(err: serde_json::Error) -> Self {
        OcppError::Json {
            message: err.to_string(),
        }
    }
}

/// CallError codes defined by OCPP-J 1.6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum CallErrorCode {
    /// Requested action is not known by the receiver
    NotImplemented,
    /// Requested action is recognized but not supported
    NotSupported,
    InternalError,
    /// Payload for the action is incomplete
    ProtocolError,
    SecurityError,
    /// Payload is syntactically incorrect or does not match the PDU
    FormationViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl CallErrorCode {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            CallErrorCode::NotImplemented => "NotImplemented",
            CallErrorCode::NotSupported => "NotSupported",
            CallErrorCode::InternalError => "InternalError",
            CallErrorCode::ProtocolError => "ProtocolError",
            CallErrorCode::SecurityError => "SecurityError",
            CallErrorCode::FormationViolation => "FormationViolation",
            CallErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            CallErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            CallErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            CallErrorCode::GenericError => "GenericError",
        }
    }
}

impl FromStr for CallErrorCode {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = match s {
            "NotImplemented" => CallErrorCode::NotImplemented,
            "NotSupported" => CallErrorCode::NotSupported,
            "InternalError" => CallErrorCode::InternalError,
            "ProtocolError" => CallErrorCode::ProtocolError,
            "SecurityError" => CallErrorCode::SecurityError,
            "FormationViolation" => CallErrorCode::FormationViolation,
            "PropertyConstraintViolation" => CallErrorCode::PropertyConstraintViolation,
            "OccurrenceConstraintViolation" => CallErrorCode::OccurrenceConstraintViolation,
            "TypeConstraintViolation" => CallErrorCode::TypeConstraintViolation,
            "GenericError" => CallErrorCode::GenericError,
            other => return Err(OcppError::UnknownErrorCode(other.to_string())),
        };
        Ok(code)
    }
}

impl std::fmt::Display for CallErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type alias for envelope operations
pub type OcppResult<T> = Result<T, OcppError>;
