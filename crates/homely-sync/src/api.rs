//! # REST Client
//!
//! Typed wrapper over the Homely cloud HTTP API.
//!
//! ## Endpoints
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  POST /oauth/token        credentials      → TokenResponse  (auth.rs)  │
//! │  POST /oauth/refresh      refresh token    → TokenResponse  (auth.rs)  │
//! │  GET  /locations          bearer           → [Location]                │
//! │  GET  /home/{locationId}  bearer           → HomeResponse (snapshot)   │
//! │                                                                         │
//! │  non-2xx → { statusCode, message } → SyncError::RequestFailed          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A 401 invalidates the held token so the next request logs in again.

use async_trait::async_trait;
use homely_core::{ErrorResponse, HomeResponse, Location, LocationId};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::TokenProvider;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// API Seam
// =============================================================================

/// The read endpoints the coordinator needs.
#[async_trait]
pub trait HomeApi: Send + Sync {
    async fn list_locations(&self) -> SyncResult<Vec<Location>>;

    async fn get_home(&self, location_id: LocationId) -> SyncResult<HomeResponse>;
}

// =============================================================================
// Rest Client
// =============================================================================

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    tokens: Arc<dyn TokenProvider>,
    locations: RwLock<Vec<Location>>,
}

impl RestClient {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        tokens: Arc<dyn TokenProvider>,
    ) -> SyncResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(RestClient {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            tokens,
            locations: RwLock::new(Vec::new()),
        })
    }

    /// Locations from the last successful `list_locations` call.
    pub fn cached_locations(&self) -> Vec<Location> {
        self.locations
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Location id → name, from the cached location list.
    pub fn location_names(&self) -> HashMap<LocationId, String> {
        self.cached_locations()
            .into_iter()
            .map(|l| (l.location_id, l.name))
            .collect()
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> SyncResult<T> {
        let token = self.tokens.access_token().await?;
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "GET");

        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            warn!(url = %url, "Token rejected, invalidating");
            self.tokens.invalidate().await;
        }
        if !status.is_success() {
            return Err(response_error(response).await);
        }

        let bytes = response.bytes().await.map_err(|e| self.transport_error(e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::InvalidResponse(format!("{}: {}", path, e)))
    }

    fn transport_error(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout(self.timeout.as_secs())
        } else {
            SyncError::from(err)
        }
    }
}

#[async_trait]
impl HomeApi for RestClient {
    async fn list_locations(&self) -> SyncResult<Vec<Location>> {
        let locations: Vec<Location> = self.get_json("/locations").await?;
        if let Ok(mut guard) = self.locations.write() {
            *guard = locations.clone();
        }
        Ok(locations)
    }

    async fn get_home(&self, location_id: LocationId) -> SyncResult<HomeResponse> {
        let home: HomeResponse = self.get_json(&format!("/home/{}", location_id)).await?;
        if home.location_id != location_id {
            return Err(SyncError::InvalidResponse(format!(
                "requested home {} but received {}",
                location_id, home.location_id
            )));
        }
        Ok(home)
    }
}

/// Turns a non-2xx response into `RequestFailed`, using the API's
/// `{statusCode, message}` body when present.
pub(crate) async fn response_error(response: reqwest::Response) -> SyncError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(error) => error.message.to_string(),
        Err(_) if body.trim().is_empty() => status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string(),
        Err(_) => body,
    };
    SyncError::RequestFailed {
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homely_core::UserRole;

    struct StaticToken;

    #[async_trait]
    impl TokenProvider for StaticToken {
        async fn access_token(&self) -> SyncResult<String> {
            Ok("token".to_string())
        }

        async fn invalidate(&self) {}
    }

    #[test]
    fn test_location_names_from_cache() {
        let client = RestClient::new(
            "https://sdk.iotiliti.cloud/homely/",
            Duration::from_secs(20),
            Arc::new(StaticToken),
        )
        .unwrap();
        assert_eq!(client.base_url, "https://sdk.iotiliti.cloud/homely");
        assert!(client.location_names().is_empty());

        let location = Location {
            name: "Cabin".to_string(),
            role: UserRole::Owner,
            user_id: uuid::Uuid::nil(),
            location_id: "550e8400-e29b-41d4-a716-446655440100".parse().unwrap(),
            gateway_serial: None,
            partner_code: None,
        };
        *client.locations.write().unwrap() = vec![location.clone()];

        let names = client.location_names();
        assert_eq!(names.get(&location.location_id).map(String::as_str), Some("Cabin"));
    }
}
