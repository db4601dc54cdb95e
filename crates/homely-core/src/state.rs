//! # Home State Store
//!
//! In-memory mirror of one location: devices, their feature states and the
//! alarm state. Both REST snapshots and realtime events are merged here.
//!
//! ## Merge Rule
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Last Writer Wins (by event time)                     │
//! │                                                                         │
//! │   stored.last_updated   incoming.last_updated     result                │
//! │   ───────────────────   ─────────────────────     ──────────────────    │
//! │   None                  anything                  overwrite             │
//! │   Some(s)               Some(i), i > s            overwrite             │
//! │   Some(s)               Some(i), i == s           no-op (duplicate)     │
//! │   Some(s)               Some(i), i < s            no-op / OutOfOrder    │
//! │   Some(s)               None                      no-op                 │
//! │                                                                         │
//! │   Arrival order never matters:                                          │
//! │                                                                         │
//! │   snapshot(motion=false @100)                                           │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   event(motion=true @150)   ──► stored: true @150                       │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   snapshot(motion=false @120) ──► stored: true @150 (stale, ignored)    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Snapshots are merged field by field: a snapshot that is stale for one
//! state still updates every other state it is newer for.
//!
//! Every `apply_*` call validates first and mutates second, so an `Err`
//! always leaves the store exactly as it was.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{StateError, StateResult};
use crate::event::{AlarmChange, DeviceChange, RealtimeEvent};
use crate::types::{
    AlarmState, Device, DeviceId, HomeResponse, LocationId, SensorState, StateValue, UserRole,
};

// =============================================================================
// Update Policy
// =============================================================================

/// How the store reacts to events it cannot or should not apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePolicy {
    /// Drop events for unknown devices/states instead of failing with
    /// `MissingTarget`.
    pub ignore_missing_targets: bool,

    /// Drop events older than the stored value instead of failing with
    /// `OutOfOrder`.
    pub ignore_outdated_values: bool,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        UpdatePolicy {
            ignore_missing_targets: true,
            ignore_outdated_values: true,
        }
    }
}

impl UpdatePolicy {
    /// Fail on every anomaly.
    pub fn strict() -> Self {
        UpdatePolicy {
            ignore_missing_targets: false,
            ignore_outdated_values: false,
        }
    }
}

/// Returns true when a value stamped `incoming` may replace one stamped
/// `stored`.
pub fn supersedes(incoming: Option<DateTime<Utc>>, stored: Option<DateTime<Utc>>) -> bool {
    match (incoming, stored) {
        (_, None) => true,
        (Some(incoming), Some(stored)) => incoming > stored,
        (None, Some(_)) => false,
    }
}

// =============================================================================
// Change Records
// =============================================================================

/// Alarm state with the instant it was last changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmStatus {
    pub state: AlarmState,
    pub last_updated: Option<DateTime<Utc>>,
}

/// One observable mutation of the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateChange {
    Alarm {
        old: Option<AlarmState>,
        new: AlarmState,
        last_updated: DateTime<Utc>,
    },
    Feature {
        device_id: DeviceId,
        feature: String,
        state: String,
        old: Option<StateValue>,
        new: Option<StateValue>,
        last_updated: Option<DateTime<Utc>>,
    },
    Online {
        device_id: DeviceId,
        old: bool,
        new: bool,
    },
    DeviceAdded {
        device_id: DeviceId,
    },
    DeviceRemoved {
        device_id: DeviceId,
    },
}

impl StateChange {
    /// The device this change belongs to, `None` for the alarm.
    pub fn device_id(&self) -> Option<DeviceId> {
        match self {
            StateChange::Alarm { .. } => None,
            StateChange::Feature { device_id, .. }
            | StateChange::Online { device_id, .. }
            | StateChange::DeviceAdded { device_id }
            | StateChange::DeviceRemoved { device_id } => Some(*device_id),
        }
    }
}

/// All changes produced by one merge, tagged with their location.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeSet {
    pub location_id: LocationId,
    pub changes: Vec<StateChange>,
}

impl ChangeSet {
    pub fn new(location_id: LocationId, changes: Vec<StateChange>) -> Self {
        ChangeSet {
            location_id,
            changes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Devices whose entities need to be refreshed.
    pub fn devices(&self) -> BTreeSet<DeviceId> {
        self.changes.iter().filter_map(StateChange::device_id).collect()
    }

    pub fn alarm_changed(&self) -> bool {
        self.changes
            .iter()
            .any(|c| matches!(c, StateChange::Alarm { .. }))
    }
}

// =============================================================================
// Home State
// =============================================================================

/// Authoritative mirror of one location.
#[derive(Debug, Clone, Serialize)]
pub struct HomeState {
    location_id: LocationId,
    name: Option<String>,
    gateway_serial: Option<String>,
    user_role: Option<UserRole>,
    alarm: Option<AlarmStatus>,
    devices: BTreeMap<DeviceId, Device>,
    #[serde(skip)]
    policy: UpdatePolicy,
}

impl HomeState {
    /// Creates an empty store for `location_id`.
    pub fn new(location_id: LocationId, policy: UpdatePolicy) -> Self {
        HomeState {
            location_id,
            name: None,
            gateway_serial: None,
            user_role: None,
            alarm: None,
            devices: BTreeMap::new(),
            policy,
        }
    }

    /// Creates a store populated from a first snapshot.
    pub fn from_snapshot(
        snapshot: &HomeResponse,
        requested_at: DateTime<Utc>,
        policy: UpdatePolicy,
    ) -> Self {
        let mut state = HomeState::new(snapshot.location_id, policy);
        state.merge_snapshot(snapshot, requested_at);
        state
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn location_id(&self) -> LocationId {
        self.location_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn gateway_serial(&self) -> Option<&str> {
        self.gateway_serial.as_deref()
    }

    pub fn user_role(&self) -> Option<UserRole> {
        self.user_role
    }

    pub fn policy(&self) -> UpdatePolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: UpdatePolicy) {
        self.policy = policy;
    }

    /// True once a snapshot has been merged.
    pub fn is_populated(&self) -> bool {
        self.alarm.is_some()
    }

    pub fn alarm(&self) -> Option<&AlarmStatus> {
        self.alarm.as_ref()
    }

    pub fn alarm_state(&self) -> Option<AlarmState> {
        self.alarm.map(|a| a.state)
    }

    pub fn device(&self, device_id: &DeviceId) -> Option<&Device> {
        self.devices.get(device_id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn state(&self, device_id: &DeviceId, feature: &str, state: &str) -> Option<&SensorState> {
        self.devices.get(device_id)?.state(feature, state)
    }

    // =========================================================================
    // Snapshot Merge
    // =========================================================================

    /// Merges a full REST snapshot.
    ///
    /// `requested_at` is the instant the snapshot request was issued; the
    /// snapshot's alarm state carries no timestamp of its own and is ordered
    /// by it. Devices missing from the snapshot are removed.
    pub fn apply_snapshot(
        &mut self,
        snapshot: &HomeResponse,
        requested_at: DateTime<Utc>,
    ) -> StateResult<Vec<StateChange>> {
        if snapshot.location_id != self.location_id {
            return Err(StateError::LocationMismatch {
                expected: self.location_id,
                actual: snapshot.location_id,
            });
        }
        Ok(self.merge_snapshot(snapshot, requested_at))
    }

    fn merge_snapshot(
        &mut self,
        snapshot: &HomeResponse,
        requested_at: DateTime<Utc>,
    ) -> Vec<StateChange> {
        let mut changes = Vec::new();

        if snapshot.name.is_some() {
            self.name = snapshot.name.clone();
        }
        if snapshot.gateway_serial.is_some() {
            self.gateway_serial = snapshot.gateway_serial.clone();
        }
        self.user_role = Some(snapshot.user_role);

        if let Some(change) = self.merge_alarm(snapshot.alarm_state, requested_at) {
            changes.push(change);
        }

        let present: BTreeSet<DeviceId> = snapshot.devices.iter().map(|d| d.id).collect();
        let removed: Vec<DeviceId> = self
            .devices
            .keys()
            .filter(|id| !present.contains(id))
            .copied()
            .collect();
        for device_id in removed {
            self.devices.remove(&device_id);
            changes.push(StateChange::DeviceRemoved { device_id });
        }

        for incoming in &snapshot.devices {
            match self.devices.get_mut(&incoming.id) {
                Some(existing) => merge_device(existing, incoming, &mut changes),
                None => {
                    self.devices.insert(incoming.id, incoming.clone());
                    changes.push(StateChange::DeviceAdded {
                        device_id: incoming.id,
                    });
                }
            }
        }

        changes
    }

    /// Replaces the alarm state if `at` is newer. Returns a change only when
    /// the state value itself differs.
    fn merge_alarm(&mut self, state: AlarmState, at: DateTime<Utc>) -> Option<StateChange> {
        let old = match self.alarm {
            Some(stored) if !supersedes(Some(at), stored.last_updated) => return None,
            Some(stored) => Some(stored.state),
            None => None,
        };
        self.alarm = Some(AlarmStatus {
            state,
            last_updated: Some(at),
        });
        if old == Some(state) {
            return None;
        }
        Some(StateChange::Alarm {
            old,
            new: state,
            last_updated: at,
        })
    }

    // =========================================================================
    // Event Merge
    // =========================================================================

    /// Applies one realtime event.
    ///
    /// `received_at` orders events that carry no timestamp of their own
    /// (alarm changes).
    pub fn apply_event(
        &mut self,
        event: &RealtimeEvent,
        received_at: DateTime<Utc>,
    ) -> StateResult<Vec<StateChange>> {
        let target = event.location_id();
        if target != self.location_id {
            return Err(StateError::LocationMismatch {
                expected: self.location_id,
                actual: target,
            });
        }

        match event {
            RealtimeEvent::DeviceStateChanged(change) => self.apply_device_change(change),
            RealtimeEvent::AlarmStateChanged(change) => {
                self.apply_alarm_change(change, received_at)
            }
        }
    }

    fn apply_device_change(&mut self, event: &DeviceChange) -> StateResult<Vec<StateChange>> {
        let policy = self.policy;
        let device_id = event.device_id;

        let Some(device) = self.devices.get_mut(&device_id) else {
            if policy.ignore_missing_targets {
                return Ok(Vec::new());
            }
            return Err(StateError::MissingTarget {
                device_id,
                target: "device".to_string(),
            });
        };

        // Validate everything before touching the device.
        let mut accepted = Vec::new();
        for change in event.all_changes() {
            let Some(stored) = device.state(&change.feature, &change.state_name) else {
                if policy.ignore_missing_targets {
                    continue;
                }
                return Err(StateError::MissingTarget {
                    device_id,
                    target: change.path(),
                });
            };

            if supersedes(change.last_updated, stored.last_updated) {
                accepted.push(change);
                continue;
            }

            if let (Some(incoming), Some(stored_at)) = (change.last_updated, stored.last_updated) {
                if incoming < stored_at && !policy.ignore_outdated_values {
                    return Err(StateError::OutOfOrder {
                        target: format!("{}/{}", device_id, change.path()),
                        stored: stored_at,
                        incoming,
                    });
                }
            }
        }

        let mut changes = Vec::new();
        for change in accepted {
            let Some(stored) = device.state_mut(&change.feature, &change.state_name) else {
                continue;
            };
            // An event may carry the same state twice.
            if !supersedes(change.last_updated, stored.last_updated) {
                continue;
            }
            if let Some(record) = overwrite(
                device_id,
                &change.feature,
                &change.state_name,
                stored,
                change.value.clone(),
                change.last_updated,
            ) {
                changes.push(record);
            }
        }
        Ok(changes)
    }

    fn apply_alarm_change(
        &mut self,
        change: &AlarmChange,
        received_at: DateTime<Utc>,
    ) -> StateResult<Vec<StateChange>> {
        let at = change.last_updated.unwrap_or(received_at);

        if let Some(AlarmStatus {
            last_updated: Some(stored_at),
            ..
        }) = self.alarm
        {
            if at < stored_at && !self.policy.ignore_outdated_values {
                return Err(StateError::OutOfOrder {
                    target: "alarm".to_string(),
                    stored: stored_at,
                    incoming: at,
                });
            }
        }

        Ok(self.merge_alarm(change.state, at).into_iter().collect())
    }
}

/// Merges one snapshot device into the stored one. States the snapshot
/// does not mention are kept.
fn merge_device(existing: &mut Device, incoming: &Device, changes: &mut Vec<StateChange>) {
    let device_id = existing.id;

    if existing.online != incoming.online {
        changes.push(StateChange::Online {
            device_id,
            old: existing.online,
            new: incoming.online,
        });
        existing.online = incoming.online;
    }
    existing.name = incoming.name.clone();
    existing.serial_number = incoming.serial_number.clone();
    existing.location = incoming.location.clone();
    existing.model_id = incoming.model_id;
    existing.model_name = incoming.model_name.clone();

    for (feature_name, feature) in &incoming.features {
        let target = existing.features.entry(feature_name.clone()).or_default();
        for (state_name, state) in &feature.states {
            match target.states.get_mut(state_name) {
                Some(stored) => {
                    if !supersedes(state.last_updated, stored.last_updated) {
                        continue;
                    }
                    if let Some(record) = overwrite(
                        device_id,
                        feature_name,
                        state_name,
                        stored,
                        state.value.clone(),
                        state.last_updated,
                    ) {
                        changes.push(record);
                    }
                }
                None => {
                    target.states.insert(state_name.clone(), state.clone());
                    changes.push(StateChange::Feature {
                        device_id,
                        feature: feature_name.clone(),
                        state: state_name.clone(),
                        old: None,
                        new: state.value.clone(),
                        last_updated: state.last_updated,
                    });
                }
            }
        }
    }
}

/// Writes a value that already passed the ordering check. Returns a change
/// record only when the value differs.
fn overwrite(
    device_id: DeviceId,
    feature: &str,
    state: &str,
    stored: &mut SensorState,
    value: Option<StateValue>,
    last_updated: Option<DateTime<Utc>>,
) -> Option<StateChange> {
    stored.last_updated = last_updated;
    if stored.value == value {
        return None;
    }
    let old = std::mem::replace(&mut stored.value, value.clone());
    Some(StateChange::Feature {
        device_id,
        feature: feature.to_string(),
        state: state.to_string(),
        old,
        new: value,
        last_updated,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
