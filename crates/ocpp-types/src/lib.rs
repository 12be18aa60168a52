//! # OCPP Types
//!
//! Foundational types for the OCPP 1.6J charge point stack: the OCPP-J
//! envelope, identifiers, call error codes and the protocol enumerations
//! shared by the message payloads.

pub mod error;
pub mod message;
pub mod meter;
pub mod v16j;

pub use error::*;
pub use message::*;

/// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use uuid::Uuid;

/// Protocol identifier negotiated as the WebSocket subprotocol
pub const OCPP16_SUBPROTOCOL: &str = "ocpp1.6";

/// Message type identifier, the first element of every OCPP-J frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl TryFrom<u64> for MessageType {
    type Error = OcppError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(MessageType::Call),
            3 => Ok(MessageType::CallResult),
            4 => Ok(MessageType::CallError),
            other => Err(OcppError::InvalidMessageType(other)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(msg_type: MessageType) -> Self {
        msg_type as u8
    }
}

/// Physical connector identifier. Connectors are numbered from 1; the
/// charge point as a whole is addressed as connector 0 on the wire only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ConnectorId(u32);

impl ConnectorId {
    /// Create a connector ID, rejecting 0
    pub fn new(id: u32) -> Result<Self, OcppError> {
        if id == 0 {
            Err(OcppError::InvalidConnectorId(id))
        } else {
            Ok(ConnectorId(id))
        }
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for ConnectorId {
    type Error = OcppError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        ConnectorId::new(value)
    }
}

impl From<ConnectorId> for u32 {
    fn from(id: ConnectorId) -> Self {
        id.0
    }
}

impl std::fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub i32);

impl TransactionId {
    pub fn new(id: i32) -> Self {
        TransactionId(id)
    }

    pub fn value(&self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::try_from(2).unwrap(), MessageType::Call);
        assert_eq!(MessageType::try_from(3).unwrap(), MessageType::CallResult);
        assert_eq!(MessageType::try_from(4).unwrap(), MessageType::CallError);
        assert!(matches!(
            MessageType::try_from(7),
            Err(OcppError::InvalidMessageType(7))
        ));
        assert_eq!(u8::from(MessageType::CallError), 4);
    }

    #[test]
    fn test_connector_id_rejects_zero() {
        let connector = ConnectorId::new(2).unwrap();
        assert_eq!(connector.value(), 2);
        assert_eq!(connector.to_string(), "2");
        assert!(ConnectorId::new(0).is_err());
    }

    #[test]
    fn test_connector_id_serde() {
        let id: ConnectorId = serde_json::from_str("3").unwrap();
        assert_eq!(id.value(), 3);
        assert_eq!(serde_json::to_string(&id).unwrap(), "3");
        assert!(serde_json::from_str::<ConnectorId>("0").is_err());
    }

    #[test]
    fn test_transaction_id_is_transparent() {
        let tx_id = TransactionId::new(42);
        assert_eq!(serde_json::to_string(&tx_id).unwrap(), "42");
        assert!(TransactionId::new(1) < TransactionId::new(2));
    }
}
