//! # Token Manager
//!
//! Bearer token management for the Homely cloud API. Logs in with the
//! account credentials and renews the access token before it expires.
//!
//! ## Authentication Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Cloud Authentication Flow                          │
//! │                                                                         │
//! │  ┌────────────────┐                        ┌─────────────────┐         │
//! │  │  TokenManager  │                        │  Homely cloud   │         │
//! │  └───────┬────────┘                        └────────┬────────┘         │
//! │          │  1. POST /oauth/token                    │                  │
//! │          │     (username, password)                 │                  │
//! │          │─────────────────────────────────────────►│                  │
//! │          │  2. access + refresh token, expiry       │                  │
//! │          │◄─────────────────────────────────────────│                  │
//! │          │                                          │                  │
//! │          │  [Later: access token within margin of expiry]              │
//! │          │                                          │                  │
//! │          │  3. POST /oauth/refresh (refresh_token)  │                  │
//! │          │─────────────────────────────────────────►│                  │
//! │          │  4. new tokens                           │                  │
//! │          │◄─────────────────────────────────────────│                  │
//! │          │                                          │                  │
//! │          │  [Refresh rejected or refresh token expired]                │
//! │          │                                          │                  │
//! │          │  5. POST /oauth/token again (re-login)   │                  │
//! │          │─────────────────────────────────────────►│                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//! The token sits behind a `tokio::sync::RwLock`. Renewal happens under the
//! write lock with a second validity check, so concurrent callers wait for
//! one in-flight renewal and then reuse its result.

use async_trait::async_trait;
use homely_core::TokenResponse;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::response_error;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Credentials
// =============================================================================

/// Account username and password.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Token Info
// =============================================================================

/// Token information stored after authentication.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub access_token: String,
    /// When the access token expires (local monotonic time).
    pub expires_at: Instant,
    pub refresh_token: String,
    /// When the refresh token expires, if the server reported it.
    pub refresh_expires_at: Option<Instant>,
}

impl TokenInfo {
    pub fn from_response(response: TokenResponse, now: Instant) -> Self {
        let refresh_expires_at = (response.refresh_expires_in > 0)
            .then(|| now + Duration::from_secs(response.refresh_expires_in));
        TokenInfo {
            access_token: response.access_token,
            expires_at: now + Duration::from_secs(response.expires_in),
            refresh_token: response.refresh_token,
            refresh_expires_at,
        }
    }

    /// Check if the token is expired or about to expire.
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        Instant::now() + margin >= self.expires_at
    }

    /// Check if the refresh token can still be used.
    pub fn can_refresh(&self, margin: Duration) -> bool {
        match self.refresh_expires_at {
            Some(at) => Instant::now() + margin < at,
            None => true,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining_secs(&self) -> u64 {
        self.expires_at
            .saturating_duration_since(Instant::now())
            .as_secs()
    }
}

// =============================================================================
// Seams
// =============================================================================

/// The auth endpoints.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> SyncResult<TokenResponse>;

    async fn refresh(&self, refresh_token: &str) -> SyncResult<TokenResponse>;
}

/// Anything that can hand out a currently valid bearer token.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> SyncResult<String>;

    /// Drops the held token so the next call re-authenticates.
    async fn invalidate(&self);
}

// =============================================================================
// HTTP Backend
// =============================================================================

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// `AuthBackend` over the cloud's `/oauth` endpoints.
pub struct HttpAuthBackend {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAuthBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        HttpAuthBackend {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post_token<B: Serialize + Sync>(&self, path: &str, body: &B) -> SyncResult<TokenResponse> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.post(&url).json(body).send().await?;

        if !response.status().is_success() {
            return Err(match response_error(response).await {
                SyncError::RequestFailed { status, message } => {
                    SyncError::AuthRejected { status, message }
                }
                other => other,
            });
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::InvalidResponse(format!("token response: {}", e)))
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn login(&self, credentials: &Credentials) -> SyncResult<TokenResponse> {
        let body = LoginRequest {
            username: &credentials.username,
            password: &credentials.password,
        };
        self.post_token("/oauth/token", &body).await
    }

    async fn refresh(&self, refresh_token: &str) -> SyncResult<TokenResponse> {
        self.post_token("/oauth/refresh", &RefreshRequest { refresh_token })
            .await
    }
}

// =============================================================================
// Token Manager
// =============================================================================

/// One token manager per credential set.
pub struct TokenManager {
    backend: Arc<dyn AuthBackend>,
    credentials: RwLock<Option<Credentials>>,
    token: RwLock<Option<TokenInfo>>,
    refresh_margin: Duration,
}

impl TokenManager {
    pub fn new(backend: Arc<dyn AuthBackend>, refresh_margin: Duration) -> Self {
        TokenManager {
            backend,
            credentials: RwLock::new(None),
            token: RwLock::new(None),
            refresh_margin,
        }
    }

    /// Creates a manager that logs in lazily on the first token request.
    pub fn with_credentials(
        backend: Arc<dyn AuthBackend>,
        refresh_margin: Duration,
        credentials: Credentials,
    ) -> Self {
        TokenManager {
            backend,
            credentials: RwLock::new(Some(credentials)),
            token: RwLock::new(None),
            refresh_margin,
        }
    }

    /// Logs in and keeps the credentials for later re-logins.
    pub async fn login(&self, credentials: Credentials) -> SyncResult<()> {
        let mut guard = self.token.write().await;
        let token = self.do_login(&credentials).await?;
        info!(
            username = %credentials.username(),
            expires_in_secs = token.remaining_secs(),
            "Logged in to Homely cloud"
        );
        *guard = Some(token);
        *self.credentials.write().await = Some(credentials);
        Ok(())
    }

    /// Returns a token valid for at least the refresh margin.
    ///
    /// ## Flow
    /// 1. Cached token still valid: return it
    /// 2. Refresh token usable: refresh
    /// 3. Otherwise, or if refresh failed: re-login with stored credentials
    pub async fn get_access_token(&self) -> SyncResult<String> {
        {
            let guard = self.token.read().await;
            if let Some(token) = guard.as_ref() {
                if !token.needs_refresh(self.refresh_margin) {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let mut guard = self.token.write().await;

        // Another caller may have renewed while we waited for the lock.
        if let Some(token) = guard.as_ref() {
            if !token.needs_refresh(self.refresh_margin) {
                return Ok(token.access_token.clone());
            }

            if token.can_refresh(self.refresh_margin) {
                match self.backend.refresh(&token.refresh_token).await {
                    Ok(response) => {
                        let token = TokenInfo::from_response(response, Instant::now());
                        debug!(expires_in_secs = token.remaining_secs(), "Token refreshed");
                        let access_token = token.access_token.clone();
                        *guard = Some(token);
                        return Ok(access_token);
                    }
                    Err(e) => {
                        warn!(error = %e, "Token refresh failed, will log in again");
                    }
                }
            }
        }

        let credentials = self.credentials.read().await.clone().ok_or_else(|| {
            SyncError::AuthenticationFailed("no credentials to log in with".into())
        })?;
        let token = self.do_login(&credentials).await?;
        info!(expires_in_secs = token.remaining_secs(), "Logged in again");
        let access_token = token.access_token.clone();
        *guard = Some(token);
        Ok(access_token)
    }

    /// Drops the held token. Credentials are kept.
    pub async fn invalidate(&self) {
        *self.token.write().await = None;
        debug!("Token invalidated");
    }

    /// Drops token and credentials.
    pub async fn logout(&self) {
        *self.token.write().await = None;
        *self.credentials.write().await = None;
    }

    pub async fn is_authenticated(&self) -> bool {
        self.token
            .read()
            .await
            .as_ref()
            .map(|t| !t.is_expired())
            .unwrap_or(false)
    }

    pub async fn current_token(&self) -> Option<TokenInfo> {
        self.token.read().await.clone()
    }

    /// A rejected login means the credentials are wrong; anything else
    /// (network, 5xx) is passed through unchanged so callers can retry.
    async fn do_login(&self, credentials: &Credentials) -> SyncResult<TokenInfo> {
        match self.backend.login(credentials).await {
            Ok(response) => Ok(TokenInfo::from_response(response, Instant::now())),
            Err(SyncError::AuthRejected { status, message }) if status < 500 => Err(
                SyncError::AuthenticationFailed(format!("login rejected ({}): {}", status, message)),
            ),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl TokenProvider for TokenManager {
    async fn access_token(&self) -> SyncResult<String> {
        self.get_access_token().await
    }

    async fn invalidate(&self) {
        TokenManager::invalidate(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockBackend {
        logins: AtomicUsize,
        refreshes: AtomicUsize,
        reject_login: AtomicBool,
        reject_refresh: AtomicBool,
    }

    impl MockBackend {
        fn token(&self, prefix: &str, n: usize) -> TokenResponse {
            TokenResponse {
                access_token: format!("{}-{}", prefix, n),
                expires_in: 1800,
                refresh_expires_in: 3600,
                refresh_token: format!("refresh-{}", n),
                token_type: "bearer".to_string(),
                scope: String::new(),
                session_state: None,
                not_before_policy: None,
            }
        }
    }

    #[async_trait]
    impl AuthBackend for MockBackend {
        async fn login(&self, _credentials: &Credentials) -> SyncResult<TokenResponse> {
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            if self.reject_login.load(Ordering::SeqCst) {
                return Err(SyncError::AuthRejected {
                    status: 401,
                    message: "invalid credentials".into(),
                });
            }
            Ok(self.token("login", n))
        }

        async fn refresh(&self, _refresh_token: &str) -> SyncResult<TokenResponse> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.reject_refresh.load(Ordering::SeqCst) {
                return Err(SyncError::AuthRejected {
                    status: 400,
                    message: "invalid refresh token".into(),
                });
            }
            Ok(self.token("refresh", n))
        }
    }

    async fn manager() -> (Arc<MockBackend>, Arc<TokenManager>) {
        let backend = Arc::new(MockBackend::default());
        let manager = Arc::new(TokenManager::new(backend.clone(), Duration::from_secs(30)));
        manager
            .login(Credentials::new("me@example.com", "secret"))
            .await
            .unwrap();
        (backend, manager)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_token_reused() {
        let (backend, manager) = manager().await;

        assert_eq!(manager.get_access_token().await.unwrap(), "login-1");
        assert_eq!(manager.get_access_token().await.unwrap(), "login-1");
        assert_eq!(backend.logins.load(Ordering::SeqCst), 1);
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 0);
        assert!(manager.is_authenticated().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_before_expiry() {
        let (backend, manager) = manager().await;

        // 1800 s lifetime, 30 s margin.
        tokio::time::advance(Duration::from_secs(1775)).await;
        assert_eq!(manager.get_access_token().await.unwrap(), "refresh-1");
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(backend.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relogin_when_refresh_fails() {
        let (backend, manager) = manager().await;
        backend.reject_refresh.store(true, Ordering::SeqCst);

        tokio::time::advance(Duration::from_secs(1790)).await;
        assert_eq!(manager.get_access_token().await.unwrap(), "login-2");
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relogin_when_refresh_token_expired() {
        let (backend, manager) = manager().await;

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(manager.get_access_token().await.unwrap(), "login-2");
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authentication_failed_when_both_fail() {
        let (backend, manager) = manager().await;
        backend.reject_refresh.store(true, Ordering::SeqCst);
        backend.reject_login.store(true, Ordering::SeqCst);

        tokio::time::advance(Duration::from_secs(1790)).await;
        let err = manager.get_access_token().await.unwrap_err();
        assert!(matches!(err, SyncError::AuthenticationFailed(_)));
        assert!(err.is_user_visible());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_refresh() {
        let (backend, manager) = manager().await;
        tokio::time::advance(Duration::from_secs(1780)).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.get_access_token().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "refresh-1");
        }
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_login() {
        let (backend, manager) = manager().await;

        TokenProvider::invalidate(manager.as_ref()).await;
        assert!(!manager.is_authenticated().await);
        assert_eq!(manager.access_token().await.unwrap(), "login-2");
        assert_eq!(backend.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_login_with_credentials() {
        let backend = Arc::new(MockBackend::default());
        let manager = TokenManager::with_credentials(
            backend.clone(),
            Duration::from_secs(30),
            Credentials::new("me@example.com", "secret"),
        );
        assert!(!manager.is_authenticated().await);
        assert_eq!(manager.get_access_token().await.unwrap(), "login-1");
        assert_eq!(backend.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_credentials() {
        let manager = TokenManager::new(Arc::new(MockBackend::default()), Duration::from_secs(30));
        assert!(matches!(
            manager.get_access_token().await,
            Err(SyncError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let credentials = Credentials::new("me@example.com", "hunter2");
        let rendered = format!("{:?}", credentials);
        assert!(rendered.contains("me@example.com"));
        assert!(!rendered.contains("hunter2"));
    }
}
