//! # Domain Types
//!
//! Payload types exchanged with the Homely cloud API.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Location     │   │  HomeResponse   │   │  TokenResponse  │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  location_id    │   │  location_id    │   │  access_token   │       │
//! │  │  name, role     │   │  alarm_state    │   │  refresh_token  │       │
//! │  │  gateway_serial │   │  devices[]      │   │  expires_in     │       │
//! │  └─────────────────┘   └────────┬────────┘   └─────────────────┘       │
//! │                                 │                                       │
//! │                        ┌────────▼────────┐                              │
//! │                        │     Device      │                              │
//! │                        │  features{}  ───┼──► Feature { states{} }      │
//! │                        └─────────────────┘          │                   │
//! │                                                     ▼                   │
//! │                                   SensorState { value, last_updated }   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Features and their states are kept as open maps (`"battery"` →
//! `"low"` → state) so new device models need no code change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ParseEnumError;

// =============================================================================
// Identifiers
// =============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                $name(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map($name)
            }
        }
    };
}

uuid_id!(
    /// Identifier of one alarm installation (location/gateway).
    LocationId
);

uuid_id!(
    /// Identifier of one device within a location.
    DeviceId
);

// =============================================================================
// Enumerations
// =============================================================================

/// Alarm state reported for a location.
///
/// The cloud is inconsistent about casing, so parsing upper-cases first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", try_from = "String")]
pub enum AlarmState {
    Disarmed,
    ArmedAway,
    ArmedNight,
    ArmedPartly,
    Breached,
    AlarmPending,
    AlarmStayPending,
    ArmedNightPending,
    ArmedAwayPending,
}

impl AlarmState {
    /// Returns the wire name (`ARMED_AWAY`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmState::Disarmed => "DISARMED",
            AlarmState::ArmedAway => "ARMED_AWAY",
            AlarmState::ArmedNight => "ARMED_NIGHT",
            AlarmState::ArmedPartly => "ARMED_PARTLY",
            AlarmState::Breached => "BREACHED",
            AlarmState::AlarmPending => "ALARM_PENDING",
            AlarmState::AlarmStayPending => "ALARM_STAY_PENDING",
            AlarmState::ArmedNightPending => "ARMED_NIGHT_PENDING",
            AlarmState::ArmedAwayPending => "ARMED_AWAY_PENDING",
        }
    }

    /// Returns true for any fully armed state.
    pub fn is_armed(&self) -> bool {
        matches!(
            self,
            AlarmState::ArmedAway | AlarmState::ArmedNight | AlarmState::ArmedPartly
        )
    }

    /// Returns true while the system is counting down to armed or alarm.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            AlarmState::AlarmPending
                | AlarmState::AlarmStayPending
                | AlarmState::ArmedNightPending
                | AlarmState::ArmedAwayPending
        )
    }

    /// Returns true when the alarm has been triggered.
    pub fn is_triggered(&self) -> bool {
        matches!(self, AlarmState::Breached)
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlarmState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DISARMED" => Ok(AlarmState::Disarmed),
            "ARMED_AWAY" => Ok(AlarmState::ArmedAway),
            "ARMED_NIGHT" => Ok(AlarmState::ArmedNight),
            "ARMED_PARTLY" => Ok(AlarmState::ArmedPartly),
            "BREACHED" => Ok(AlarmState::Breached),
            "ALARM_PENDING" => Ok(AlarmState::AlarmPending),
            "ALARM_STAY_PENDING" => Ok(AlarmState::AlarmStayPending),
            "ARMED_NIGHT_PENDING" => Ok(AlarmState::ArmedNightPending),
            "ARMED_AWAY_PENDING" => Ok(AlarmState::ArmedAwayPending),
            _ => Err(ParseEnumError::new("alarm state", s)),
        }
    }
}

impl TryFrom<String> for AlarmState {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// The account's role at a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", try_from = "String")]
pub enum UserRole {
    Admin,
    Owner,
}

impl FromStr for UserRole {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ADMIN" => Ok(UserRole::Admin),
            "OWNER" => Ok(UserRole::Owner),
            _ => Err(ParseEnumError::new("user role", s)),
        }
    }
}

impl TryFrom<String> for UserRole {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// =============================================================================
// Sensor State
// =============================================================================

/// A feature state value. Typed per feature by the cloud.
///
/// Variant order matters for untagged decoding: integers must be tried
/// before floats so `84` stays an integer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl StateValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Int(i) => Some(*i as f64),
            StateValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Bool(b) => write!(f, "{}", b),
            StateValue::Int(i) => write!(f, "{}", i),
            StateValue::Float(v) => write!(f, "{}", v),
            StateValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Bool(value)
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        StateValue::Int(value)
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        StateValue::Float(value)
    }
}

/// One feature state: a value and the instant the cloud last changed it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorState {
    #[serde(default)]
    pub value: Option<StateValue>,

    #[serde(default, rename = "lastUpdated")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl SensorState {
    pub fn new(value: impl Into<StateValue>, last_updated: DateTime<Utc>) -> Self {
        SensorState {
            value: Some(value.into()),
            last_updated: Some(last_updated),
        }
    }
}

/// A named group of states on a device (`alarm`, `battery`, `diagnostic`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(default)]
    pub states: BTreeMap<String, SensorState>,
}

// =============================================================================
// Device
// =============================================================================

/// A device with its metadata and feature states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Unique device identifier.
    pub id: DeviceId,

    /// User defined name.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub serial_number: Option<String>,

    /// Floor and room, if set.
    #[serde(default)]
    pub location: Option<String>,

    pub online: bool,

    pub model_id: Uuid,

    #[serde(default)]
    pub model_name: Option<String>,

    #[serde(default)]
    pub features: BTreeMap<String, Feature>,
}

impl Device {
    /// Looks up one state by feature and state name.
    pub fn state(&self, feature: &str, state: &str) -> Option<&SensorState> {
        self.features.get(feature)?.states.get(state)
    }

    pub(crate) fn state_mut(&mut self, feature: &str, state: &str) -> Option<&mut SensorState> {
        self.features.get_mut(feature)?.states.get_mut(state)
    }

    /// Display name, falling back to the serial number and then the id.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.serial_number.clone())
            .unwrap_or_else(|| self.id.to_string())
    }
}

// =============================================================================
// REST Responses
// =============================================================================

/// A location (gateway) the account has access to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub name: String,

    pub role: UserRole,

    pub user_id: Uuid,

    pub location_id: LocationId,

    #[serde(default, rename = "gatewayserial")]
    pub gateway_serial: Option<String>,

    #[serde(default)]
    pub partner_code: Option<i64>,
}

/// Full home snapshot for one location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HomeResponse {
    pub location_id: LocationId,

    #[serde(default, rename = "gatewayserial")]
    pub gateway_serial: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    pub alarm_state: AlarmState,

    #[serde(rename = "userRoleAtLocation")]
    pub user_role: UserRole,

    #[serde(default)]
    pub devices: Vec<Device>,
}

/// OAuth token response from the login and refresh endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,

    /// Access token lifetime in seconds.
    pub expires_in: u64,

    /// Refresh token lifetime in seconds (0 = not reported).
    #[serde(default)]
    pub refresh_expires_in: u64,

    pub refresh_token: String,

    #[serde(default = "default_token_type")]
    pub token_type: String,

    #[serde(default)]
    pub scope: String,

    #[serde(default)]
    pub session_state: Option<String>,

    #[serde(default, rename = "not-before-policy")]
    pub not_before_policy: Option<i64>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// Error body returned by the API on non-2xx responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub status_code: u16,
    pub message: ErrorMessage,
}

/// The API reports either a single message or a list of validation messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorMessage {
    One(String),
    Many(Vec<String>),
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorMessage::One(msg) => f.write_str(msg),
            ErrorMessage::Many(msgs) => f.write_str(&msgs.join("; ")),
        }
    }
}

// =============================================================================
// Monitored Location
// =============================================================================

/// A location as seen by the sync engine: identity, name and whether it is
/// currently mirrored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredLocation {
    pub id: LocationId,
    pub name: String,
    pub monitored: bool,
}
