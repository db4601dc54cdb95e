//! # homely-core: Models and State Store for Homely Sync
//!
//! Everything in this crate is pure: no network, no timers, no runtime.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Homely Sync Architecture                         │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Host (apps/homely-host)                      │   │
//! │  │         start / stop, change notifications, config file        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    homely-sync                                  │   │
//! │  │    tokens, REST, realtime client, health, coordinator           │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ homely-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   event   │  │   state   │  │   error   │  │   │
//! │  │   │  Device   │  │ Realtime  │  │ HomeState │  │StateError │  │   │
//! │  │   │ AlarmState│  │  Event    │  │  merges   │  │           │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO NETWORK • NO CLOCK READS • PURE FUNCTIONS        │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - REST payloads (Location, HomeResponse, Device, TokenResponse)
//! - [`event`] - Realtime event variants
//! - [`state`] - `HomeState` store with last-writer-wins merging
//! - [`error`] - Domain error types
//!
//! Callers pass the current instant in (`requested_at`, `received_at`);
//! the store never reads a clock.
//!
//! ## Example Usage
//!
//! ```rust
//! use homely_core::{HomeResponse, HomeState, RealtimeEvent, UpdatePolicy};
//! use chrono::{Duration, Utc};
//!
//! let snapshot: HomeResponse = serde_json::from_str(r#"{
//!     "locationId": "550e8400-e29b-41d4-a716-446655440100",
//!     "alarmState": "DISARMED",
//!     "userRoleAtLocation": "OWNER",
//!     "devices": []
//! }"#).unwrap();
//!
//! let requested_at = Utc::now() - Duration::seconds(5);
//! let mut home = HomeState::from_snapshot(&snapshot, requested_at, UpdatePolicy::default());
//!
//! let event = RealtimeEvent::from_json(r#"{
//!     "type": "alarm-state-changed",
//!     "data": { "locationId": "550e8400-e29b-41d4-a716-446655440100", "state": "ARMED_AWAY" }
//! }"#).unwrap();
//!
//! let changes = home.apply_event(&event, Utc::now()).unwrap();
//! assert_eq!(changes.len(), 1);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod event;
pub mod state;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{ParseEnumError, StateError, StateResult};
pub use event::{AlarmChange, DeviceChange, FeatureChange, RealtimeEvent};
pub use state::{supersedes, AlarmStatus, ChangeSet, HomeState, StateChange, UpdatePolicy};
pub use types::*;
