//! # Error Types
//!
//! Domain-specific error types for homely-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  homely-core errors (this file)                                        │
//! │  ├── StateError       - An update could not be applied to a HomeState  │
//! │  └── ParseEnumError   - Unknown alarm state / user role string         │
//! │                                                                         │
//! │  homely-sync errors (separate crate)                                   │
//! │  └── SyncError        - Network, auth, protocol, lifecycle failures    │
//! │                                                                         │
//! │  Flow: StateError → SyncError::State → coordinator → listener          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A `StateError` never leaves the store half-updated: validation happens
//! before the first write.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{DeviceId, LocationId};

// =============================================================================
// State Error
// =============================================================================

/// Failures while applying a snapshot or realtime event to a `HomeState`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    /// The update belongs to a different location than the store.
    ///
    /// ## When This Occurs
    /// - A realtime event is routed to the wrong location's store
    /// - A snapshot is fetched for one location and applied to another
    #[error("Update for location {actual} applied to store of location {expected}")]
    LocationMismatch {
        expected: LocationId,
        actual: LocationId,
    },

    /// The device, feature or state named by an event is not in the store.
    ///
    /// Only raised when missing targets are not ignored. Usually means a
    /// device was added in the cloud and the store needs a fresh snapshot.
    #[error("Can't find {target} on device {device_id}")]
    MissingTarget { device_id: DeviceId, target: String },

    /// The incoming value is older than the one already stored.
    ///
    /// Only raised in strict ordering mode.
    #[error("Outdated update for {target}: stored {stored}, incoming {incoming}")]
    OutOfOrder {
        target: String,
        stored: DateTime<Utc>,
        incoming: DateTime<Utc>,
    },
}

// =============================================================================
// Parse Error
// =============================================================================

/// A string did not match any known variant of a cloud enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown {kind}: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        ParseEnumError {
            kind,
            value: value.into(),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with StateError.
pub type StateResult<T> = Result<T, StateError>;
