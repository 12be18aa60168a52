//! OCPP-J message envelope
//!
//! Frames are JSON arrays:
//!
//! ```text
//! [2, "<uniqueId>", "<Action>", {payload}]                  Call
//! [3, "<uniqueId>", {payload}]                              CallResult
//! [4, "<uniqueId>", "<errorCode>", "<description>", {details}] CallError
//! ```
//!
//! Parsing works on a `serde_json::Value` rather than a derived tuple type
//! because a four element CallError and a Call share the same arity.

use crate::{CallErrorCode, MessageType, OcppError, OcppResult};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Parsed OCPP-J frame
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Call(CallMessage),
    CallResult(CallResultMessage),
    CallError(CallErrorMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Call(_) => MessageType::Call,
            Message::CallResult(_) => MessageType::CallResult,
            Message::CallError(_) => MessageType::CallError,
        }
    }

    pub fn unique_id(&self) -> &str {
        match self {
            Message::Call(msg) => &msg.unique_id,
            Message::CallResult(msg) => &msg.unique_id,
            Message::CallError(msg) => &msg.unique_id,
        }
    }

    /// Parse a text frame received from the transport
    pub fn parse(text: &str) -> OcppResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| OcppError::malformed(format!("not valid JSON: {e}"), None))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> OcppResult<Self> {
        let Value::Array(mut items) = value else {
            return Err(OcppError::malformed("frame is not a JSON array", None));
        };
        if items.len() < 3 {
            return Err(OcppError::malformed(
                format!("frame has {} elements, expected at least 3", items.len()),
                None,
            ));
        }

        let type_id = items[0]
            .as_u64()
            .ok_or_else(|| OcppError::malformed("message type is not an integer", None))?;
        let message_type = MessageType::try_from(type_id)?;

        let unique_id = match &items[1] {
            Value::String(id) if !id.is_empty() => id.clone(),
            _ => return Err(OcppError::malformed("unique id is not a string", None)),
        };
        let with_id = |message: String| OcppError::malformed(message, Some(unique_id.clone()));

        match message_type {
            MessageType::Call => {
                if items.len() != 4 {
                    return Err(with_id(format!(
                        "Call has {} elements, expected 4",
                        items.len()
                    )));
                }
                let payload = items.pop().unwrap_or(Value::Null);
                let action = match &items[2] {
                    Value::String(action) if !action.is_empty() => action.clone(),
                    _ => return Err(with_id("action is not a string".to_string())),
                };
                if !payload.is_object() {
                    return Err(with_id("Call payload is not an object".to_string()));
                }
                Ok(Message::Call(CallMessage {
                    unique_id,
                    action,
                    payload,
                }))
            }
            MessageType::CallResult => {
                if items.len() != 3 {
                    return Err(with_id(format!(
                        "CallResult has {} elements, expected 3",
                        items.len()
                    )));
                }
                let payload = items.pop().unwrap_or(Value::Null);
                Ok(Message::CallResult(CallResultMessage { unique_id, payload }))
            }
            MessageType::CallError => {
                if !(4..=5).contains(&items.len()) {
                    return Err(with_id(format!(
                        "CallError has {} elements, expected 5",
                        items.len()
                    )));
                }
                let error_details = if items.len() == 5 {
                    items.pop().unwrap_or_default()
                } else {
                    Value::Object(Default::default())
                };
                let error_description = items[3].as_str().unwrap_or_default().to_string();
                // Unknown codes still resolve the pending request.
                let error_code = items[2]
                    .as_str()
                    .and_then(|code| code.parse().ok())
                    .unwrap_or(CallErrorCode::GenericError);
                Ok(Message::CallError(CallErrorMessage {
                    unique_id,
                    error_code,
                    error_description,
                    error_details,
                }))
            }
        }
    }

    /// Encode as an OCPP-J text frame
    pub fn to_frame(&self) -> String {
        let array = match self {
            Message::Call(msg) => vec![
                Value::from(u8::from(MessageType::Call)),
                Value::String(msg.unique_id.clone()),
                Value::String(msg.action.clone()),
                msg.payload.clone(),
            ],
            Message::CallResult(msg) => vec![
                Value::from(u8::from(MessageType::CallResult)),
                Value::String(msg.unique_id.clone()),
                msg.payload.clone(),
            ],
            Message::CallError(msg) => vec![
                Value::from(u8::from(MessageType::CallError)),
                Value::String(msg.unique_id.clone()),
                Value::String(msg.error_code.as_str().to_string()),
                Value::String(msg.error_description.clone()),
                msg.error_details.clone(),
            ],
        };
        Value::Array(array).to_string()
    }
}

impl From<CallMessage> for Message {
    fn from(msg: CallMessage) -> Self {
        Message::Call(msg)
    }
}

impl From<CallResultMessage> for Message {
    fn from(msg: CallResultMessage) -> Self {
        Message::CallResult(msg)
    }
}

impl From<CallErrorMessage> for Message {
    fn from(msg: CallErrorMessage) -> Self {
        Message::CallError(msg)
    }
}

/// Request frame
#[derive(Debug, Clone, PartialEq)]
pub struct CallMessage {
    pub unique_id: String,
    /// Action name, e.g. "Authorize"
    pub action: String,
    pub payload: Value,
}

impl CallMessage {
    /// Create a Call with a fresh v4 UUID as its unique id
    pub fn new<T: Serialize>(action: impl Into<String>, payload: &T) -> OcppResult<Self> {
        Ok(CallMessage {
            unique_id: Uuid::new_v4().to_string(),
            action: action.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> OcppResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Successful response frame
#[derive(Debug, Clone, PartialEq)]
pub struct CallResultMessage {
    /// Same id as the Call being answered
    pub unique_id: String,
    pub payload: Value,
}

impl CallResultMessage {
    pub fn new<T: Serialize>(unique_id: impl Into<String>, payload: &T) -> OcppResult<Self> {
        Ok(CallResultMessage {
            unique_id: unique_id.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> OcppResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Error response frame
#[derive(Debug, Clone, PartialEq)]
pub struct CallErrorMessage {
    pub unique_id: String,
    pub error_code: CallErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallErrorMessage {
    pub fn new(
        unique_id: impl Into<String>,
        error_code: CallErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        CallErrorMessage {
            unique_id: unique_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(Default::default()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }
}
