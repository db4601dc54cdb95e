//! # Realtime Events
//!
//! Typed payloads pushed by the cloud over the realtime channel.
//!
//! ## Wire Shape
//! ```text
//! {
//!   "type": "device-state-changed",          ──► RealtimeEvent::DeviceStateChanged
//!   "data": {
//!     "locationId": "...",                    sub-location (room/zone)
//!     "rootLocationId": "...",                the gateway location (routing key)
//!     "deviceId": "...",
//!     "change":  { feature, stateName, value, lastUpdated },
//!     "changes": [ { ... }, { ... } ]         all changes carried by the event
//!   }
//! }
//!
//! { "type": "alarm-state-changed", "data": { "locationId": "...", "state": "ARMED_AWAY" } }
//! ```
//!
//! Any other `type` fails to decode. The realtime client counts that as a
//! decode failure instead of dropping the connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AlarmState, DeviceId, LocationId, StateValue};

// =============================================================================
// Event Envelope
// =============================================================================

/// A decoded realtime event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RealtimeEvent {
    #[serde(rename = "device-state-changed")]
    DeviceStateChanged(DeviceChange),

    #[serde(rename = "alarm-state-changed")]
    AlarmStateChanged(AlarmChange),
}

impl RealtimeEvent {
    /// Decodes one event from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Decodes one event from an already parsed JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// The location whose store this event must be applied to.
    pub fn location_id(&self) -> LocationId {
        match self {
            RealtimeEvent::DeviceStateChanged(change) => change.target_location(),
            RealtimeEvent::AlarmStateChanged(change) => change.location_id,
        }
    }

    /// Wire name of the event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            RealtimeEvent::DeviceStateChanged(_) => "device-state-changed",
            RealtimeEvent::AlarmStateChanged(_) => "alarm-state-changed",
        }
    }
}

// =============================================================================
// Device State Change
// =============================================================================

/// One or more feature state changes on a single device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceChange {
    /// Sub-location the device sits in.
    pub location_id: LocationId,

    /// Gateway location. Absent on older payloads, where `location_id` is
    /// already the gateway location.
    #[serde(default)]
    pub root_location_id: Option<LocationId>,

    pub device_id: DeviceId,

    #[serde(default)]
    pub gateway_id: Option<Uuid>,

    #[serde(default)]
    pub model_id: Option<Uuid>,

    /// The primary change.
    #[serde(default)]
    pub change: Option<FeatureChange>,

    /// Every change carried by the event (includes `change`).
    #[serde(default)]
    pub changes: Vec<FeatureChange>,

    #[serde(default)]
    pub partner_code: Option<i64>,
}

impl DeviceChange {
    /// The location used for routing and validation.
    pub fn target_location(&self) -> LocationId {
        self.root_location_id.unwrap_or(self.location_id)
    }

    /// All changes to apply: `changes` when present, else the single `change`.
    pub fn all_changes(&self) -> Vec<&FeatureChange> {
        if self.changes.is_empty() {
            self.change.iter().collect()
        } else {
            self.changes.iter().collect()
        }
    }
}

/// A single feature state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureChange {
    pub feature: String,

    pub state_name: String,

    #[serde(default)]
    pub value: Option<StateValue>,

    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl FeatureChange {
    /// `feature/state` path, used in logs and errors.
    pub fn path(&self) -> String {
        format!("{}/{}", self.feature, self.state_name)
    }
}

// =============================================================================
// Alarm State Change
// =============================================================================

/// The location's alarm state changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmChange {
    pub location_id: LocationId,

    pub state: AlarmState,

    /// Change instant if the cloud sent one. When absent, the receipt
    /// instant is used for ordering.
    #[serde(default, alias = "timestamp")]
    pub last_updated: Option<DateTime<Utc>>,

    #[serde(default)]
    pub user_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT_LOCATION: &str = "550e8400-e29b-41d4-a716-446655440100";

    const DEVICE_EVENT: &str = r#"{
        "type": "device-state-changed",
        "data": {
            "locationId": "c36ba8f1-3d5e-4a8e-9c0d-1e0f2a3b4c5d",
            "rootLocationId": "550e8400-e29b-41d4-a716-446655440100",
            "gatewayId": "6e5e3f0a-2b5c-4d7e-8f9a-0b1c2d3e4f5a",
            "deviceId": "d9016467-77b6-4b32-88ae-a6eb296cff9a",
            "modelId": "98257573-ae4d-4170-a8f2-83f337b4deb2",
            "change": {
                "feature": "alarm",
                "stateName": "alarm",
                "value": true,
                "lastUpdated": "2025-10-05T07:01:39.181Z"
            },
            "changes": [
                { "feature": "alarm", "stateName": "alarm", "value": true, "lastUpdated": "2025-10-05T07:01:39.181Z" },
                { "feature": "alarm", "stateName": "tamper", "value": false, "lastUpdated": "2025-10-05T07:01:39.181Z" }
            ],
            "partnerCode": 1234
        }
    }"#;

    #[test]
    fn test_decode_device_event() {
        let event = RealtimeEvent::from_json(DEVICE_EVENT).unwrap();
        assert_eq!(event.type_name(), "device-state-changed");
        assert_eq!(event.location_id(), ROOT_LOCATION.parse().unwrap());

        match event {
            RealtimeEvent::DeviceStateChanged(change) => {
                let changes = change.all_changes();
                assert_eq!(changes.len(), 2);
                assert_eq!(changes[0].path(), "alarm/alarm");
                assert_eq!(changes[0].value, Some(StateValue::Bool(true)));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_single_change_without_list() {
        let json = r#"{
            "type": "device-state-changed",
            "data": {
                "locationId": "550e8400-e29b-41d4-a716-446655440100",
                "deviceId": "d9016467-77b6-4b32-88ae-a6eb296cff9a",
                "change": { "feature": "battery", "stateName": "low", "value": true }
            }
        }"#;
        let event = RealtimeEvent::from_json(json).unwrap();
        assert_eq!(event.location_id(), ROOT_LOCATION.parse().unwrap());
        if let RealtimeEvent::DeviceStateChanged(change) = event {
            let changes = change.all_changes();
            assert_eq!(changes.len(), 1);
            assert!(changes[0].last_updated.is_none());
        }
    }

    #[test]
    fn test_decode_alarm_event() {
        let json = r#"{
            "type": "alarm-state-changed",
            "data": { "locationId": "550e8400-e29b-41d4-a716-446655440100", "state": "armed_night" }
        }"#;
        let event = RealtimeEvent::from_json(json).unwrap();
        assert_eq!(
            event,
            RealtimeEvent::AlarmStateChanged(AlarmChange {
                location_id: ROOT_LOCATION.parse().unwrap(),
                state: AlarmState::ArmedNight,
                last_updated: None,
                user_id: None,
            })
        );
    }

    #[test]
    fn test_unknown_event_type_fails() {
        let json = r#"{ "type": "firmware-updated", "data": {} }"#;
        assert!(RealtimeEvent::from_json(json).is_err());

        let json = r#"{ "type": "alarm-state-changed", "data": { "locationId": "550e8400-e29b-41d4-a716-446655440100", "state": "PANIC" } }"#;
        assert!(RealtimeEvent::from_json(json).is_err());
    }
}
