//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     HOMELY_USERNAME=me@example.com                                     │
//! │     HOMELY_LOCATIONS=550e8400-...,d4fe152b-...                         │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/homely/homely.toml (Linux)                               │
//! │     ~/Library/Application Support/io.homely.homely/homely.toml (macOS)  │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     Production cloud URLs, 30 s fallback polling                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # homely.toml
//! locations = ["550e8400-e29b-41d4-a716-446655440100"]
//!
//! [account]
//! username = "me@example.com"
//! password = "secret"
//!
//! [api]
//! base_url = "https://sdk.iotiliti.cloud/homely"
//! ws_url = "wss://sdk.iotiliti.cloud"
//!
//! [polling]
//! connected_interval_secs = 1800
//! fallback_interval_secs = 30
//! ```
//!
//! The file belongs to the host. The engine only ever reads it.

use homely_core::{LocationId, UpdatePolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::Credentials;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Account
// =============================================================================

/// Account credentials.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Cloud API Settings
// =============================================================================

/// Cloud endpoints and request behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    /// REST base URL (login, locations, home).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Realtime (Socket.IO) server URL.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Timeout for a single REST request (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// A token expiring within this margin is renewed first (seconds).
    #[serde(default = "default_refresh_margin")]
    pub token_refresh_margin_secs: u64,
}

fn default_base_url() -> String {
    "https://sdk.iotiliti.cloud/homely".to_string()
}

fn default_ws_url() -> String {
    "wss://sdk.iotiliti.cloud".to_string()
}

fn default_request_timeout() -> u64 {
    20
}

fn default_refresh_margin() -> u64 {
    30
}

impl Default for ApiSettings {
    fn default() -> Self {
        ApiSettings {
            base_url: default_base_url(),
            ws_url: default_ws_url(),
            request_timeout_secs: default_request_timeout(),
            token_refresh_margin_secs: default_refresh_margin(),
        }
    }
}

impl ApiSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn token_refresh_margin(&self) -> Duration {
        Duration::from_secs(self.token_refresh_margin_secs)
    }
}

// =============================================================================
// Realtime Settings
// =============================================================================

/// Realtime connection and reconnect backoff.
///
/// ## Backoff Schedule (defaults)
/// ```text
/// failure:   1     2     3      4      5      6 ...
/// delay:    30s   60s  120s   240s   300s   300s
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeSettings {
    /// Handshake timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Delay after the first consecutive failure (seconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,

    /// Backoff ceiling (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_initial_backoff() -> u64 {
    30
}

fn default_max_backoff() -> u64 {
    300
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        RealtimeSettings {
            connect_timeout_secs: default_connect_timeout(),
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

// =============================================================================
// Polling Settings
// =============================================================================

/// REST polling tiers.
///
/// ## Interval Selection
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  realtime connected, activity within activity_window  → connected (30m) │
/// │  realtime connected, silent beyond activity_window    → stale     (60s) │
/// │  realtime not connected                               → fallback  (30s) │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSettings {
    #[serde(default = "default_connected_interval")]
    pub connected_interval_secs: u64,

    #[serde(default = "default_fallback_interval")]
    pub fallback_interval_secs: u64,

    #[serde(default = "default_stale_interval")]
    pub stale_interval_secs: u64,

    /// How long a connected channel may stay silent and still count as
    /// healthy (seconds).
    #[serde(default = "default_activity_window")]
    pub activity_window_secs: u64,

    /// Minimum gap between two error-triggered refreshes (seconds).
    #[serde(default = "default_error_refresh_gap")]
    pub error_refresh_min_gap_secs: u64,
}

fn default_connected_interval() -> u64 {
    1800
}

fn default_fallback_interval() -> u64 {
    30
}

fn default_stale_interval() -> u64 {
    60
}

fn default_activity_window() -> u64 {
    120
}

fn default_error_refresh_gap() -> u64 {
    60
}

impl Default for PollingSettings {
    fn default() -> Self {
        PollingSettings {
            connected_interval_secs: default_connected_interval(),
            fallback_interval_secs: default_fallback_interval(),
            stale_interval_secs: default_stale_interval(),
            activity_window_secs: default_activity_window(),
            error_refresh_min_gap_secs: default_error_refresh_gap(),
        }
    }
}

// =============================================================================
// Store Settings
// =============================================================================

/// Update policy of every `HomeState`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_true")]
    pub ignore_missing_targets: bool,

    #[serde(default = "default_true")]
    pub ignore_outdated_values: bool,
}

fn default_true() -> bool {
    true
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            ignore_missing_targets: true,
            ignore_outdated_values: true,
        }
    }
}

impl StoreSettings {
    pub fn policy(&self) -> UpdatePolicy {
        UpdatePolicy {
            ignore_missing_targets: self.ignore_missing_targets,
            ignore_outdated_values: self.ignore_outdated_values,
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HomelyConfig {
    /// Selected (monitored) locations. Empty means every account location.
    #[serde(default)]
    pub locations: Vec<LocationId>,

    #[serde(default)]
    pub account: AccountConfig,

    #[serde(default)]
    pub api: ApiSettings,

    #[serde(default)]
    pub realtime: RealtimeSettings,

    #[serde(default)]
    pub polling: PollingSettings,

    #[serde(default)]
    pub store: StoreSettings,
}

impl HomelyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (homely.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if !self.account.username.is_empty() && self.account.password.is_empty() {
            return Err(SyncError::InvalidConfig(format!(
                "password missing for account {}",
                self.account.username
            )));
        }

        let base = url::Url::parse(&self.api.base_url)?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "API URL must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }

        let ws = url::Url::parse(&self.api.ws_url)?;
        if !matches!(ws.scheme(), "ws" | "wss" | "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "Realtime URL must start with ws:// or wss://, got: {}",
                self.api.ws_url
            )));
        }

        let intervals = [
            ("request_timeout_secs", self.api.request_timeout_secs),
            ("connect_timeout_secs", self.realtime.connect_timeout_secs),
            ("initial_backoff_secs", self.realtime.initial_backoff_secs),
            ("connected_interval_secs", self.polling.connected_interval_secs),
            ("fallback_interval_secs", self.polling.fallback_interval_secs),
            ("stale_interval_secs", self.polling.stale_interval_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(SyncError::InvalidConfig(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.realtime.max_backoff_secs < self.realtime.initial_backoff_secs {
            return Err(SyncError::InvalidConfig(
                "max_backoff_secs must not be lower than initial_backoff_secs".into(),
            ));
        }

        Ok(())
    }

    /// Returns the configured credentials.
    pub fn credentials(&self) -> SyncResult<Credentials> {
        if self.account.username.is_empty() || self.account.password.is_empty() {
            return Err(SyncError::MissingCredentials);
        }
        Ok(Credentials::new(
            self.account.username.clone(),
            self.account.password.clone(),
        ))
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(username) = lookup("HOMELY_USERNAME") {
            debug!(username = %username, "Overriding username from environment");
            self.account.username = username;
        }

        if let Some(password) = lookup("HOMELY_PASSWORD") {
            self.account.password = password;
        }

        if let Some(url) = lookup("HOMELY_API_URL") {
            debug!(url = %url, "Overriding API URL from environment");
            self.api.base_url = url;
        }

        if let Some(url) = lookup("HOMELY_WS_URL") {
            debug!(url = %url, "Overriding realtime URL from environment");
            self.api.ws_url = url;
        }

        if let Some(list) = lookup("HOMELY_LOCATIONS") {
            let mut locations = Vec::new();
            for raw in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match raw.parse::<LocationId>() {
                    Ok(id) => locations.push(id),
                    Err(_) => warn!(value = %raw, "Ignoring invalid location id in environment"),
                }
            }
            self.locations = locations;
        }

        if let Some(strict) = lookup("HOMELY_STRICT_UPDATES") {
            match strict.to_lowercase().as_str() {
                "1" | "true" | "yes" => {
                    self.store.ignore_missing_targets = false;
                    self.store.ignore_outdated_values = false;
                }
                "0" | "false" | "no" => {
                    self.store.ignore_missing_targets = true;
                    self.store.ignore_outdated_values = true;
                }
                _ => warn!(value = %strict, "Unknown HOMELY_STRICT_UPDATES value"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "homely", "homely")
            .map(|dirs| dirs.config_dir().join("homely.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = HomelyConfig::default();
        assert_eq!(config.api.base_url, "https://sdk.iotiliti.cloud/homely");
        assert_eq!(config.api.request_timeout(), Duration::from_secs(20));
        assert_eq!(config.realtime.initial_backoff_secs, 30);
        assert_eq!(config.realtime.max_backoff_secs, 300);
        assert_eq!(config.polling.connected_interval_secs, 1800);
        assert_eq!(config.store.policy(), UpdatePolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = HomelyConfig::default();

        config.api.ws_url = "ftp://example.com".to_string();
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.api.ws_url = "wss://example.com".to_string();
        config.polling.fallback_interval_secs = 0;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));

        config.polling.fallback_interval_secs = 30;
        config.realtime.max_backoff_secs = 10;
        assert!(config.validate().is_err());

        config.realtime.max_backoff_secs = 300;
        config.account.username = "me@example.com".to_string();
        assert!(config.validate().is_err());

        config.account.password = "secret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_credentials_required() {
        let mut config = HomelyConfig::default();
        assert!(matches!(config.credentials(), Err(SyncError::MissingCredentials)));

        config.account.username = "me@example.com".to_string();
        config.account.password = "secret".to_string();
        assert_eq!(config.credentials().unwrap().username(), "me@example.com");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("HOMELY_USERNAME", "env@example.com"),
            ("HOMELY_PASSWORD", "env-secret"),
            ("HOMELY_WS_URL", "ws://127.0.0.1:9000"),
            (
                "HOMELY_LOCATIONS",
                "550e8400-e29b-41d4-a716-446655440100, not-a-uuid",
            ),
            ("HOMELY_STRICT_UPDATES", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = HomelyConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.account.username, "env@example.com");
        assert_eq!(config.api.ws_url, "ws://127.0.0.1:9000");
        assert_eq!(config.locations.len(), 1);
        assert_eq!(config.store.policy(), UpdatePolicy::strict());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            locations = ["550e8400-e29b-41d4-a716-446655440100"]

            [account]
            username = "me@example.com"
            password = "secret"

            [polling]
            fallback_interval_secs = 15
        "#;
        let config: HomelyConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.locations.len(), 1);
        assert_eq!(config.polling.fallback_interval_secs, 15);
        assert_eq!(config.polling.connected_interval_secs, 1800);
        assert!(!format!("{:?}", config.account).contains("secret"));

        let rendered = toml::to_string_pretty(&config).unwrap();
        assert!(rendered.contains("[polling]"));
    }
}
