//! Requests the central system sends to the charge point
//!
//! Grouped by OCPP 1.6 feature profile: Core, Firmware Management, Local
//! Auth List Management, Remote Trigger, Reservation and Smart Charging.

use crate::{ocpp_action, validation};
use chrono::{DateTime, Utc};
use ocpp_types::v16j::*;
use serde::{Deserialize, Serialize};

// Core profile

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeAvailabilityRequest {
    /// 0 addresses the whole charge point
    pub connector_id: u32,
    #[serde(rename = "type")]
    pub kind: AvailabilityType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeAvailabilityResponse {
    pub status: AvailabilityStatus,
}

ocpp_action!(ChangeAvailabilityRequest => ChangeAvailabilityResponse, "ChangeAvailability");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeConfigurationRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeConfigurationResponse {
    pub status: ConfigurationStatus,
}

ocpp_action!(ChangeConfigurationRequest => ChangeConfigurationResponse, "ChangeConfiguration", validate(req) {
    validation::validate_ci_string("key", &req.key, validation::CI_STRING_50)?;
    validation::validate_ci_string("value", &req.value, validation::CI_STRING_500)
});

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClearCacheRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearCacheResponse {
    pub status: ClearCacheStatus,
}

ocpp_action!(ClearCacheRequest => ClearCacheResponse, "ClearCache");

/// Vendor-specific exchange, may be sent by either side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferRequest {
    pub vendor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTransferResponse {
    pub status: DataTransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

ocpp_action!(DataTransferRequest => DataTransferResponse, "DataTransfer");

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GetConfigurationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetConfigurationResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration_key: Option<Vec<KeyValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unknown_key: Option<Vec<String>>,
}

ocpp_action!(GetConfigurationRequest => GetConfigurationResponse, "GetConfiguration");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStartTransactionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<u32>,
    pub id_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging_profile: Option<ChargingProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStartTransactionResponse {
    pub status: RemoteStartStopStatus,
}

ocpp_action!(RemoteStartTransactionRequest => RemoteStartTransactionResponse, "RemoteStartTransaction", validate(req) {
    validation::validate_id_tag("idTag", &req.id_tag)
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStopTransactionRequest {
    pub transaction_id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStopTransactionResponse {
    pub status: RemoteStartStopStatus,
}

ocpp_action!(RemoteStopTransactionRequest => RemoteStopTransactionResponse, "RemoteStopTransaction");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetRequest {
    #[serde(rename = "type")]
    pub kind: ResetType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetResponse {
    pub status: ResetStatus,
}

ocpp_action!(ResetRequest => ResetResponse, "Reset");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockConnectorRequest {
    pub connector_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlockConnectorResponse {
    pub status: UnlockStatus,
}

ocpp_action!(UnlockConnectorRequest => UnlockConnectorResponse, "UnlockConnector", validate(req) {
    validation::validate_connector_id(req.connector_id, false)
});

// Local auth list management

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GetLocalListVersionRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLocalListVersionResponse {
    pub list_version: i32,
}

ocpp_action!(GetLocalListVersionRequest => GetLocalListVersionResponse, "GetLocalListVersion");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationData {
    pub id_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tag_info: Option<IdTagInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendLocalListRequest {
    pub list_version: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_authorization_list: Option<Vec<AuthorizationData>>,
    pub update_type: UpdateType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendLocalListResponse {
    pub status: UpdateStatus,
}

ocpp_action!(SendLocalListRequest => SendLocalListResponse, "SendLocalList");

// Firmware management

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDiagnosticsRequest {
    /// Upload target URI
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDiagnosticsResponse {
    /// Absent when no diagnostics are available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

ocpp_action!(GetDiagnosticsRequest => GetDiagnosticsResponse, "GetDiagnostics");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFirmwareRequest {
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<i32>,
    pub retrieve_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpdateFirmwareResponse {}

ocpp_action!(UpdateFirmwareRequest => UpdateFirmwareResponse, "UpdateFirmware");

// Remote trigger

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerMessageRequest {
    pub requested_message: MessageTrigger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerMessageResponse {
    pub status: TriggerMessageStatus,
}

ocpp_action!(TriggerMessageRequest => TriggerMessageResponse, "TriggerMessage");

// Reservation

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveNowRequest {
    pub connector_id: u32,
    pub expiry_date: DateTime<Utc>,
    pub id_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id_tag: Option<String>,
    pub reservation_id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveNowResponse {
    pub status: ReservationStatus,
}

ocpp_action!(ReserveNowRequest => ReserveNowResponse, "ReserveNow", validate(req) {
    validation::validate_id_tag("idTag", &req.id_tag)
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelReservationRequest {
    pub reservation_id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelReservationResponse {
    pub status: CancelReservationStatus,
}

ocpp_action!(CancelReservationRequest => CancelReservationResponse, "CancelReservation");

// Smart charging

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedulePeriod {
    /// Offset from the schedule start (seconds)
    pub start_period: i32,
    pub limit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_phases: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_schedule: Option<DateTime<Utc>>,
    pub charging_rate_unit: ChargingRateUnitType,
    pub charging_schedule_period: Vec<ChargingSchedulePeriod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_charging_rate: Option<f64>,
}

/// Charging profile. `chargingProfileKind` and `recurrencyKind` are kept as
/// plain strings since no local logic depends on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingProfile {
    pub charging_profile_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i32>,
    pub stack_level: i32,
    pub charging_profile_purpose: ChargingProfilePurposeType,
    pub charging_profile_kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrency_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
    pub charging_schedule: ChargingSchedule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetChargingProfileRequest {
    pub connector_id: u32,
    pub cs_charging_profiles: ChargingProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetChargingProfileResponse {
    pub status: ChargingProfileStatus,
}

ocpp_action!(SetChargingProfileRequest => SetChargingProfileResponse, "SetChargingProfile");

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearChargingProfileRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging_profile_purpose: Option<ChargingProfilePurposeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_level: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearChargingProfileResponse {
    pub status: ClearChargingProfileStatus,
}

ocpp_action!(ClearChargingProfileRequest => ClearChargingProfileResponse, "ClearChargingProfile");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCompositeScheduleRequest {
    pub connector_id: u32,
    /// Length of the requested schedule (seconds)
    pub duration: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging_rate_unit: Option<ChargingRateUnitType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCompositeScheduleResponse {
    pub status: GetCompositeScheduleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging_schedule: Option<ChargingSchedule>,
}

ocpp_action!(GetCompositeScheduleRequest => GetCompositeScheduleResponse, "GetCompositeSchedule");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OcppAction;
    use serde_json::json;

    #[test]
    fn test_change_availability_type_field() {
        let request: ChangeAvailabilityRequest =
            serde_json::from_value(json!({"connectorId": 1, "type": "Inoperative"})).unwrap();
        assert_eq!(request.connector_id, 1);
        assert_eq!(request.kind, AvailabilityType::Inoperative);
    }

    #[test]
    fn test_get_configuration_without_keys() {
        let request: GetConfigurationRequest = serde_json::from_value(json!({})).unwrap();
        assert!(request.key.is_none());

        let response = GetConfigurationResponse::default();
        assert_eq!(serde_json::to_value(&response).unwrap(), json!({}));
    }

    #[test]
    fn test_set_charging_profile_parse() {
        let request: SetChargingProfileRequest = serde_json::from_value(json!({
            "connectorId": 1,
            "csChargingProfiles": {
                "chargingProfileId": 9,
                "stackLevel": 0,
                "chargingProfilePurpose": "TxDefaultProfile",
                "chargingProfileKind": "Absolute",
                "chargingSchedule": {
                    "chargingRateUnit": "A",
                    "chargingSchedulePeriod": [{"startPeriod": 0, "limit": 16.0}]
                }
            }
        }))
        .unwrap();
        let profile = request.cs_charging_profiles;
        assert_eq!(profile.charging_profile_id, 9);
        assert_eq!(profile.charging_schedule.charging_schedule_period.len(), 1);
    }

    #[test]
    fn test_reserve_now_validates_id_tag() {
        let request = ReserveNowRequest {
            connector_id: 1,
            expiry_date: Utc::now(),
            id_tag: String::new(),
            parent_id_tag: None,
            reservation_id: 3,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_remote_action_names() {
        assert_eq!(ChangeAvailabilityRequest::ACTION_NAME, "ChangeAvailability");
        assert_eq!(GetLocalListVersionRequest::ACTION_NAME, "GetLocalListVersion");
        assert_eq!(TriggerMessageRequest::ACTION_NAME, "TriggerMessage");
        assert_eq!(ClearChargingProfileRequest::ACTION_NAME, "ClearChargingProfile");
        assert_eq!(GetCompositeScheduleRequest::ACTION_NAME, "GetCompositeSchedule");
    }
}
