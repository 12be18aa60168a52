//! # Charge Point Configuration
//!
//! Everything the session needs is passed in through [`ChargePointConfig`];
//! there is no global state. Files may be TOML or JSON, chosen by
//! extension.

use crate::error::{ChargePointError, ChargePointResult};
use crate::router::RouterPolicy;
use ocpp_messages::v16j::BootNotificationRequest;
use ocpp_messages::{validation, OcppAction};
use ocpp_types::v16j::Reason;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargePointConfig {
    /// Identity appended to the central system URL
    pub charge_point_id: String,
    pub central_system_url: String,
    pub vendor_info: VendorInfo,
    pub connector_count: u32,
    /// Per-request response timeout
    pub request_timeout_secs: u64,
    /// BootNotification attempts answered with Pending before giving up
    pub boot_retries: u32,
    /// Used when the central system sends a non-positive interval
    pub default_heartbeat_interval_secs: u64,
    pub router_policy: RouterPolicy,
    pub demo: DemoConfig,
    pub reconnect: ReconnectConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VendorInfo {
    pub charge_point_vendor: String,
    pub charge_point_model: String,
    pub charge_point_serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub meter_type: Option<String>,
}

/// Parameters of the demonstration charge cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub connector_id: u32,
    pub id_tag: String,
    pub samples: u32,
    pub sample_interval_secs: u64,
    /// Energy register at transaction start (Wh)
    pub meter_start_wh: i32,
    /// Register increase per sample (Wh)
    pub meter_step_wh: i32,
    pub stop_reason: Reason,
}

/// Exponential backoff between session attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
    /// 0 retries forever
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter directive, e.g. `info` or `ocpp_cp=debug`
    pub level: String,
    pub format: LogFormat,
}

impl Default for ChargePointConfig {
    fn default() -> Self {
        Self {
            charge_point_id: "test-client".to_string(),
            central_system_url: "ws://45.32.156.36/steve/websocket/CentralSystemService".to_string(),
            vendor_info: VendorInfo::default(),
            connector_count: 1,
            request_timeout_secs: 30,
            boot_retries: 3,
            default_heartbeat_interval_secs: 300,
            router_policy: RouterPolicy::Strict,
            demo: DemoConfig::default(),
            reconnect: ReconnectConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for VendorInfo {
    fn default() -> Self {
        Self {
            charge_point_vendor: "OCPP-RS".to_string(),
            charge_point_model: "ocpp-cp".to_string(),
            charge_point_serial_number: None,
            firmware_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            meter_type: None,
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            connector_id: 1,
            id_tag: "test-tag".to_string(),
            samples: 5,
            sample_interval_secs: 5,
            meter_start_wh: 0,
            meter_step_wh: 10,
            stop_reason: Reason::EVDisconnected,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 1,
            max_delay_secs: 60,
            max_attempts: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl VendorInfo {
    pub fn boot_request(&self) -> BootNotificationRequest {
        BootNotificationRequest {
            charge_point_vendor: self.charge_point_vendor.clone(),
            charge_point_model: self.charge_point_model.clone(),
            charge_point_serial_number: self.charge_point_serial_number.clone(),
            firmware_version: self.firmware_version.clone(),
            meter_type: self.meter_type.clone(),
            ..Default::default()
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt `attempt` (1-based), doubling up to the cap
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let secs = self
            .initial_delay_secs
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_secs);
        Duration::from_secs(secs)
    }
}

impl ChargePointConfig {
    pub fn from_file(path: impl AsRef<Path>) -> ChargePointResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ChargePointError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(&content)
                .map_err(|e| ChargePointError::configuration(e.to_string()))?,
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| ChargePointError::configuration(e.to_string()))?,
            _ => {
                return Err(ChargePointError::configuration(
                    "unsupported configuration file format, use .toml or .json",
                ))
            }
        };
        Ok(config)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> ChargePointResult<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::to_string_pretty(self)
                .map_err(|e| ChargePointError::configuration(e.to_string()))?,
            Some("json") => serde_json::to_string_pretty(self)?,
            _ => {
                return Err(ChargePointError::configuration(
                    "unsupported configuration file format, use .toml or .json",
                ))
            }
        };
        std::fs::write(path, content).map_err(|e| {
            ChargePointError::configuration(format!("cannot write {}: {e}", path.display()))
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Central system URL with the charge point id as last path segment
    pub fn endpoint(&self) -> String {
        ocpp_transport::utils::create_websocket_url(&self.central_system_url, &self.charge_point_id)
    }

    pub fn validate(&self) -> ChargePointResult<()> {
        if self.charge_point_id.is_empty() {
            return Err(ChargePointError::validation("charge_point_id", "cannot be empty"));
        }
        if self.charge_point_id.contains('/') {
            return Err(ChargePointError::validation("charge_point_id", "cannot contain '/'"));
        }
        if !self.central_system_url.starts_with("ws://") && !self.central_system_url.starts_with("wss://") {
            return Err(ChargePointError::validation(
                "central_system_url",
                "must be a ws:// or wss:// URL",
            ));
        }
        if self.connector_count == 0 || self.connector_count > 100 {
            return Err(ChargePointError::validation("connector_count", "must be between 1 and 100"));
        }
        if self.request_timeout_secs == 0 {
            return Err(ChargePointError::validation("request_timeout_secs", "must be greater than 0"));
        }
        if self.demo.connector_id == 0 || self.demo.connector_id > self.connector_count {
            return Err(ChargePointError::validation(
                "demo.connector_id",
                format!("must be between 1 and {}", self.connector_count),
            ));
        }
        if self.reconnect.initial_delay_secs > self.reconnect.max_delay_secs {
            return Err(ChargePointError::validation(
                "reconnect.initial_delay_secs",
                "cannot exceed max_delay_secs",
            ));
        }

        validation::validate_id_tag("demo.id_tag", &self.demo.id_tag)?;
        self.vendor_info.boot_request().validate()?;
        Ok(())
    }
}
