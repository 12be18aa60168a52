//! Field constraints from the OCPP 1.6 CiString types

use ocpp_types::{OcppError, OcppResult};

pub const CI_STRING_20: usize = 20;
pub const CI_STRING_25: usize = 25;
pub const CI_STRING_50: usize = 50;
pub const CI_STRING_500: usize = 500;

/// Check a case-insensitive string against its maximum length
pub fn validate_ci_string(field: &str, value: &str, max_length: usize) -> OcppResult<()> {
    let length = value.chars().count();
    if length > max_length {
        return Err(OcppError::validation(
            field,
            format!("length {length} exceeds {max_length} characters"),
        ));
    }
    Ok(())
}

/// Id tags are non-empty CiString20 values
pub fn validate_id_tag(field: &str, value: &str) -> OcppResult<()> {
    if value.trim().is_empty() {
        return Err(OcppError::validation(field, "must not be empty"));
    }
    validate_ci_string(field, value, CI_STRING_20)
}

pub fn validate_connector_id(connector_id: u32, allow_zero: bool) -> OcppResult<()> {
    if connector_id == 0 && !allow_zero {
        return Err(OcppError::validation(
            "connectorId",
            "must be greater than 0",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v16j::{AuthorizeRequest, BootNotificationRequest};
    use crate::OcppAction;

    #[test]
    fn test_id_tag_limits() {
        assert!(validate_id_tag("idTag", "test-tag").is_ok());
        assert!(validate_id_tag("idTag", &"A".repeat(20)).is_ok());
        assert!(validate_id_tag("idTag", &"A".repeat(21)).is_err());
        assert!(validate_id_tag("idTag", "   ").is_err());
    }

    #[test]
    fn test_ci_string_counts_characters() {
        assert!(validate_ci_string("info", &"é".repeat(20), CI_STRING_20).is_ok());
    }

    #[test]
    fn test_connector_zero() {
        assert!(validate_connector_id(0, true).is_ok());
        assert!(validate_connector_id(0, false).is_err());
        assert!(validate_connector_id(2, false).is_ok());
    }

    #[test]
    fn test_authorize_request_validation() {
        let too_long = AuthorizeRequest {
            id_tag: "VERYLONGTAGTHATEXCEEDS20CHARACTERS".to_string(),
        };
        assert!(too_long.validate().is_err());
    }

    #[test]
    fn test_boot_notification_validation() {
        let request = BootNotificationRequest {
            charge_point_vendor: "Vendor".to_string(),
            charge_point_model: "Model".to_string(),
            ..Default::default()
        };
        assert!(request.validate().is_ok());

        let empty_vendor = BootNotificationRequest {
            charge_point_model: "Model".to_string(),
            ..Default::default()
        };
        assert!(empty_vendor.validate().is_err());
    }
}
