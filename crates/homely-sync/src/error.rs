//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │ Authentication  │  │     Transport           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Authentication │  │  Network, Timeout       │ │
//! │  │  Missing creds  │  │    Failed       │  │  ConnectionFailed       │ │
//! │  │  InvalidUrl     │  │  AuthRejected   │  │  Disconnected           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │   REST / Proto  │  │     State       │  │     Lifecycle           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  RequestFailed  │  │  State(..)      │  │  UnknownLocation        │ │
//! │  │  Deserialization│  │  (homely-core)  │  │  NoValidLocations       │ │
//! │  │  UnexpectedFrame│  │                 │  │  NotRunning, Shutdown   │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only [`SyncError::is_user_visible`] errors reach the host's fault
//! reporting. Everything else is retried or logged where it happens.

use homely_core::{LocationId, StateError};
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Username or password not configured.
    #[error("Account credentials not configured")]
    MissingCredentials,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    // =========================================================================
    // Authentication Errors
    // =========================================================================
    /// Neither refresh nor re-login produced a token. Needs user action.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The auth endpoint rejected one login or refresh attempt.
    #[error("Authentication rejected ({status}): {message}")]
    AuthRejected { status: u16, message: String },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// HTTP request could not be sent or completed.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Realtime channel closed.
    #[error("Disconnected from realtime channel")]
    Disconnected,

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    // =========================================================================
    // REST / Protocol Errors
    // =========================================================================
    /// Non-2xx response from the REST API.
    #[error("Request failed ({status}): {message}")]
    RequestFailed { status: u16, message: String },

    /// 2xx response with an unusable body.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Realtime frame that does not fit the current connection phase.
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),

    // =========================================================================
    // State Errors
    // =========================================================================
    #[error(transparent)]
    State(#[from] StateError),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("Location {0} is not monitored")]
    UnknownLocation(LocationId),

    /// None of the selected locations belongs to the account.
    #[error("None of the selected locations is available for this account")]
    NoValidLocations,

    #[error("Coordinator is not running")]
    NotRunning,

    #[error("Sync coordinator is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::DeserializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Network(format!("request timed out: {}", err))
        } else if err.is_decode() {
            SyncError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            SyncError::RequestFailed {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => SyncError::Disconnected,
            WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            WsError::Http(response) => SyncError::ConnectionFailed(format!(
                "handshake rejected with HTTP {}",
                response.status()
            )),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried later without user action.
    ///
    /// ## Retryable Errors
    /// - Network failures and timeouts
    /// - Realtime disconnects
    /// - 5xx and 429 responses
    /// - A single rejected refresh (re-login may still succeed)
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(_)
            | SyncError::Timeout(_)
            | SyncError::ConnectionFailed(_)
            | SyncError::Disconnected
            | SyncError::WebSocketError(_)
            | SyncError::AuthRejected { .. } => true,
            SyncError::RequestFailed { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Returns true if the host must surface this error to the user.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            SyncError::AuthenticationFailed(_)
                | SyncError::MissingCredentials
                | SyncError::NoValidLocations
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingCredentials
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
        )
    }

    /// Returns true for 401 responses, which mean the held token is stale.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, SyncError::RequestFailed { status: 401, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::Network("reset".into()).is_retryable());
        assert!(SyncError::Disconnected.is_retryable());
        assert!(SyncError::Timeout(20).is_retryable());
        assert!(SyncError::RequestFailed {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());

        assert!(!SyncError::RequestFailed {
            status: 404,
            message: "not found".into()
        }
        .is_retryable());
        assert!(!SyncError::AuthenticationFailed("bad password".into()).is_retryable());
        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
    }

    #[test]
    fn test_user_visible_errors() {
        assert!(SyncError::AuthenticationFailed("rejected".into()).is_user_visible());
        assert!(SyncError::NoValidLocations.is_user_visible());

        assert!(!SyncError::Disconnected.is_user_visible());
        assert!(!SyncError::DeserializationFailed("bad".into()).is_user_visible());
        let state = StateError::LocationMismatch {
            expected: "550e8400-e29b-41d4-a716-446655440100".parse().unwrap(),
            actual: "d4fe152b-47ec-4011-b257-d5edf7668201".parse().unwrap(),
        };
        assert!(!SyncError::from(state).is_user_visible());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::RequestFailed {
            status: 401,
            message: "Unauthorized".into(),
        };
        assert_eq!(err.to_string(), "Request failed (401): Unauthorized");
        assert!(err.is_unauthorized());
        assert!(SyncError::MissingCredentials.is_config_error());
    }
}
