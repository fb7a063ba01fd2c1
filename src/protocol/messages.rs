//! Payload types carried on the message bus
//!
//! All message kinds serialize to JSON with omit-if-zero field conventions:
//! optional and empty fields are skipped on the wire and default on decode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Uplink received from a device, published by the network on the device's
/// `up` address.
///
/// # Examples
/// ```
/// use lorabus::protocol::UplinkMessage;
///
/// let uplink = UplinkMessage {
///     app_id: "app".to_string(),
///     dev_id: "test".to_string(),
///     payload_raw: vec![0x01, 0x08],
///     ..Default::default()
/// };
/// let json = serde_json::to_string(&uplink).unwrap();
/// assert!(json.contains("payload_raw"));
/// assert!(!json.contains("metadata"));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UplinkMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dev_id: String,
    #[serde(default, skip_serializing_if = "is_zero_u8")]
    pub port: u8,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub counter: u32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub confirmed: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_retry: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload_raw: Vec<u8>,
    /// Decoded fields produced by the application's payload decoder.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload_fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Downlink scheduling mode relative to the device's downlink queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    #[default]
    Replace,
    First,
    Last,
}

impl ScheduleMode {
    fn is_default(&self) -> bool {
        *self == ScheduleMode::Replace
    }
}

/// Downlink queued by an application on the device's `down` address.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DownlinkMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dev_id: String,
    #[serde(default, skip_serializing_if = "is_zero_u8")]
    pub port: u8,
    #[serde(default, skip_serializing_if = "is_false")]
    pub confirmed: bool,
    #[serde(default, skip_serializing_if = "ScheduleMode::is_default")]
    pub schedule: ScheduleMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload_raw: Vec<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload_fields: Map<String, Value>,
}

/// Device activation, published on the `events.activations` address.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Activation {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dev_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_eui: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dev_eui: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dev_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Event scoped to one device, published on `events.<subtype>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceEvent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dev_id: String,
    /// Event subtype, mirrored in the address field (e.g. `down.scheduled`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Event scoped to one application.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApplicationEvent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Reception metadata attached to uplinks and activations by the network.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub frequency: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub modulation: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_rate: String,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub bit_rate: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub coding_rate: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gateways: Vec<GatewayMetadata>,
}

/// Per-gateway reception metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GatewayMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gtw_id: String,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub timestamp: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub channel: u32,
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub rssi: f64,
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub snr: f64,
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero_u8(v: &u8) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}
