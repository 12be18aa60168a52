//! # OCPP Messages
//!
//! Typed request and response payloads for OCPP 1.6J. Every request type
//! implements [`OcppAction`], which binds it to its action name and its
//! response type so callers can send a request and get the matching
//! response back without stringly-typed dispatch.

pub mod v16j;
pub mod validation;

pub use ocpp_types::{CallErrorMessage, CallMessage, CallResultMessage, Message, MessageType};
pub use ocpp_types::{OcppError, OcppResult};

pub use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

/// A request payload together with its action name and response type
pub trait OcppAction: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Action name as it appears in the Call frame
    const ACTION_NAME: &'static str;
    type Response: OcppResponse;

    /// Check field constraints before the request is sent or after it is received
    fn validate(&self) -> OcppResult<()> {
        Ok(())
    }
}

/// Marker for response payloads
pub trait OcppResponse: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Implements [`OcppAction`] and [`OcppResponse`] for a request/response pair
#[macro_export]
macro_rules! ocpp_action {
    ($request:ty => $response:ty, $name:literal) => {
        impl $crate::OcppAction for $request {
            const ACTION_NAME: &'static str = $name;
            type Response = $response;
        }

        impl $crate::OcppResponse for $response {}
    };
    ($request:ty => $response:ty, $name:literal, validate($this:ident) $body:block) => {
        impl $crate::OcppAction for $request {
            const ACTION_NAME: &'static str = $name;
            type Response = $response;

            fn validate(&self) -> $crate::OcppResult<()> {
                let $this = self;
                $body
            }
        }

        impl $crate::OcppResponse for $response {}
    };
}

/// Helpers for moving between typed payloads and envelopes
pub mod utils {
    use super::*;

    /// Build a Call frame for a typed request
    pub fn create_call<T: OcppAction>(action: &T) -> OcppResult<CallMessage> {
        action.validate()?;
        CallMessage::new(T::ACTION_NAME, action)
    }

    pub fn create_call_result<T: OcppResponse>(
        unique_id: impl Into<String>,
        response: &T,
    ) -> OcppResult<CallResultMessage> {
        CallResultMessage::new(unique_id, response)
    }

    /// Decode the payload of a Call, checking that the action matches
    pub fn extract_payload<T: OcppAction>(call: &CallMessage) -> OcppResult<T> {
        if call.action != T::ACTION_NAME {
            return Err(OcppError::malformed(
                format!("Expected action '{}', got '{}'", T::ACTION_NAME, call.action),
                Some(call.unique_id.clone()),
            ));
        }
        let payload: T = call.payload_as()?;
        payload.validate()?;
        Ok(payload)
    }

    pub fn parse_timestamp(timestamp: &str) -> OcppResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(timestamp)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| OcppError::validation("timestamp", format!("invalid RFC 3339: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v16j::{AuthorizeRequest, HeartbeatRequest};
    use serde_json::json;

    #[test]
    fn test_create_call_uses_action_name() {
        let request = AuthorizeRequest {
            id_tag: "test-tag".to_string(),
        };
        let call = utils::create_call(&request).unwrap();

        assert_eq!(call.action, "Authorize");
        assert_eq!(call.payload, json!({"idTag": "test-tag"}));

        let extracted: AuthorizeRequest = utils::extract_payload(&call).unwrap();
        assert_eq!(extracted, request);
    }

    #[test]
    fn test_create_call_validates() {
        let request = AuthorizeRequest {
            id_tag: "x".repeat(21),
        };
        assert!(matches!(
            utils::create_call(&request),
            Err(OcppError::Validation { .. })
        ));
    }

    #[test]
    fn test_extract_payload_wrong_action() {
        let call = CallMessage::new("Heartbeat", &json!({})).unwrap();
        let result: OcppResult<AuthorizeRequest> = utils::extract_payload(&call);

        match result.unwrap_err() {
            OcppError::MalformedFrame { message, unique_id } => {
                assert!(message.contains("Expected action 'Authorize'"));
                assert_eq!(unique_id.as_deref(), Some(call.unique_id.as_str()));
            }
            other => panic!("Expected MalformedFrame, got {other:?}"),
        }

        let heartbeat: HeartbeatRequest = utils::extract_payload(&call).unwrap();
        assert_eq!(heartbeat, HeartbeatRequest {});
    }

    #[test]
    fn test_parse_timestamp() {
        let parsed = utils::parse_timestamp("2024-03-01T12:00:00+02:00").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-03-01T10:00:00+00:00");
        assert!(utils::parse_timestamp("yesterday").is_err());
    }
}
