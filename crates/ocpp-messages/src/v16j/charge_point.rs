//! Requests the charge point sends to the central system

use crate::{ocpp_action, validation};
use chrono::{DateTime, Utc};
use ocpp_types::{
    meter::MeterValue,
    v16j::{ChargePointErrorCode, ChargePointStatus, IdTagInfo, Reason, RegistrationStatus},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    pub id_tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeResponse {
    pub id_tag_info: IdTagInfo,
}

ocpp_action!(AuthorizeRequest => AuthorizeResponse, "Authorize", validate(req) {
    validation::validate_id_tag("idTag", &req.id_tag)
});

/// Identification sent once per connection before any other request
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charge_point_vendor: String,
    pub charge_point_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_box_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iccid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imsi: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_serial_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub current_time: DateTime<Utc>,
    /// Heartbeat interval when accepted, retry delay otherwise (seconds)
    pub interval: i32,
    pub status: RegistrationStatus,
}

ocpp_action!(BootNotificationRequest => BootNotificationResponse, "BootNotification", validate(req) {
    for (field, value) in [
        ("chargePointVendor", &req.charge_point_vendor),
        ("chargePointModel", &req.charge_point_model),
    ] {
        if value.is_empty() {
            return Err(ocpp_types::OcppError::validation(field, "must not be empty"));
        }
        validation::validate_ci_string(field, value, validation::CI_STRING_20)?;
    }
    if let Some(serial) = &req.charge_point_serial_number {
        validation::validate_ci_string("chargePointSerialNumber", serial, validation::CI_STRING_25)?;
    }
    if let Some(firmware) = &req.firmware_version {
        validation::validate_ci_string("firmwareVersion", firmware, validation::CI_STRING_50)?;
    }
    Ok(())
});

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

ocpp_action!(HeartbeatRequest => HeartbeatResponse, "Heartbeat");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValuesRequest {
    pub connector_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i32>,
    pub meter_value: Vec<MeterValue>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MeterValuesResponse {}

ocpp_action!(MeterValuesRequest => MeterValuesResponse, "MeterValues");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionRequest {
    pub connector_id: u32,
    pub id_tag: String,
    /// Energy register at start (Wh)
    pub meter_start: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionResponse {
    pub id_tag_info: IdTagInfo,
    pub transaction_id: i32,
}

ocpp_action!(StartTransactionRequest => StartTransactionResponse, "StartTransaction", validate(req) {
    validation::validate_connector_id(req.connector_id, false)?;
    validation::validate_id_tag("idTag", &req.id_tag)
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    /// 0 addresses the charge point as a whole
    pub connector_id: u32,
    pub error_code: ChargePointErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    pub status: ChargePointStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_error_code: Option<String>,
}

impl StatusNotificationRequest {
    pub fn new(connector_id: u32, status: ChargePointStatus) -> Self {
        StatusNotificationRequest {
            connector_id,
            error_code: ChargePointErrorCode::NoError,
            info: None,
            status,
            timestamp: Some(Utc::now()),
            vendor_id: None,
            vendor_error_code: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusNotificationResponse {}

ocpp_action!(StatusNotificationRequest => StatusNotificationResponse, "StatusNotification");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tag: Option<String>,
    /// Energy register at stop (Wh)
    pub meter_stop: i32,
    pub timestamp: DateTime<Utc>,
    pub transaction_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_data: Option<Vec<MeterValue>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tag_info: Option<IdTagInfo>,
}

ocpp_action!(StopTransactionRequest => StopTransactionResponse, "StopTransaction", validate(req) {
    match &req.id_tag {
        Some(id_tag) => validation::validate_id_tag("idTag", id_tag),
        None => Ok(()),
    }
});
