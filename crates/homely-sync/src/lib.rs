//! # homely-sync: Synchronization Engine for Homely Sync
//!
//! Keeps an in-memory mirror of every monitored Homely location current by
//! combining a realtime Socket.IO feed with adaptive REST polling.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Sync Engine Architecture                           │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 SyncCoordinator (Main Orchestrator)              │  │
//! │  │                                                                  │  │
//! │  │  Driven by the host through start / stop                        │  │
//! │  │  One location task per monitored location                       │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │  RestClient    │  │ RealtimeClient │  │  HomeState             │    │
//! │  │                │  │                │  │  (homely-core)         │    │
//! │  │ GET /locations │  │ Socket.IO over │  │                        │    │
//! │  │ GET /home/{id} │  │ WebSocket with │  │ Last-writer-wins merge │    │
//! │  │                │  │ backoff        │  │ of snapshots + events  │    │
//! │  └───────┬────────┘  └───────┬────────┘  └────────────────────────┘    │
//! │          │                   │                                          │
//! │          └─────────┬─────────┘                                          │
//! │                    ▼                                                    │
//! │           ┌────────────────┐        ┌────────────────────────┐         │
//! │           │  TokenManager  │        │  Health                │         │
//! │           │                │        │                        │         │
//! │           │ Login, refresh,│        │ Backoff, poll tiers,   │         │
//! │           │ re-login       │        │ refresh rate limit     │         │
//! │           └────────────────┘        └────────────────────────┘         │
//! │                                                                         │
//! │  NOTIFICATIONS (to the host via SyncListener):                         │
//! │  • emit_changes - entities whose value changed                         │
//! │  • emit_health  - realtime connection transitions                      │
//! │  • emit_error   - failures that need user action                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`coordinator`] - `SyncCoordinator`, location tasks, `SyncListener`
//! - [`realtime`] - Per-location realtime client with reconnect backoff
//! - [`protocol`] - Engine.IO / Socket.IO framing
//! - [`health`] - Connection health, backoff, polling and refresh policies
//! - [`api`] - REST client
//! - [`auth`] - Token manager
//! - [`config`] - Configuration (TOML + environment)
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use homely_sync::{HomelyConfig, SyncCoordinatorBuilder};
//!
//! let config = HomelyConfig::load(None)?;
//! let mut coordinator = SyncCoordinatorBuilder::new(config)
//!     .with_listener(listener)
//!     .build()?;
//!
//! coordinator.start().await?;
//! let alarm = coordinator.alarm_state(location_id);
//! coordinator.stop().await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod api;
pub mod auth;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod protocol;
pub mod realtime;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use api::{HomeApi, RestClient};
pub use auth::{AuthBackend, Credentials, HttpAuthBackend, TokenInfo, TokenManager, TokenProvider};
pub use config::{
    AccountConfig, ApiSettings, HomelyConfig, PollingSettings, RealtimeSettings, StoreSettings,
};
pub use coordinator::{
    CoordinatorState, NoOpListener, SyncCoordinator, SyncCoordinatorBuilder, SyncListener,
};
pub use error::{SyncError, SyncResult};
pub use health::{ConnectionHealth, ConnectionState, PollPolicy, ReconnectBackoff, RefreshLimiter};
pub use realtime::{RealtimeClient, RealtimeConfig, RealtimeSignal};
