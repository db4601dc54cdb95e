//! # Sync Coordinator
//!
//! Owns one `HomeState` and one `RealtimeClient` per monitored location and
//! runs the hybrid REST/realtime policy that keeps each mirror current.
//!
//! ## Coordinator Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       SyncCoordinator Architecture                      │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                        SyncCoordinator                           │  │
//! │  │                                                                  │  │
//! │  │  • Validates selected locations against the account             │  │
//! │  │  • Spawns one location task per monitored location              │  │
//! │  │  • Serves reads from the shared HomeState mirrors               │  │
//! │  │  • Init → Running → Stopped lifecycle                           │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │ one per location                        │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                        Location task                             │  │
//! │  │                                                                  │  │
//! │  │   select! {                                                      │  │
//! │  │     realtime signal  ──► HomeState::apply_event ──► listener     │  │
//! │  │     poll deadline    ──► GET /home ──► apply_snapshot            │  │
//! │  │     health change    ──► listener, new poll deadline             │  │
//! │  │     force refresh    ──► GET /home, reply to caller              │  │
//! │  │     shutdown         ──► stop realtime, exit                     │  │
//! │  │   }                                                              │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  ERROR ISOLATION                                                       │
//! │  ───────────────                                                       │
//! │  State errors and undecodable events never leave the location task.    │
//! │  They trigger at most one out-of-band refresh per 60 s. Only           │
//! │  AuthenticationFailed and NoValidLocations reach the listener.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use homely_core::{
    AlarmStatus, ChangeSet, Device, DeviceId, HomeState, Location, LocationId,
    MonitoredLocation, StateChange,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::api::{HomeApi, RestClient};
use crate::auth::{HttpAuthBackend, TokenManager, TokenProvider};
use crate::config::HomelyConfig;
use crate::error::{SyncError, SyncResult};
use crate::health::{ConnectionHealth, PollPolicy, RefreshLimiter};
use crate::realtime::{RealtimeClient, RealtimeConfig, RealtimeSignal};

/// Realtime signals buffered per location.
const SIGNAL_BUFFER: usize = 256;

type RefreshReply = oneshot::Sender<SyncResult<ChangeSet>>;

// =============================================================================
// Listener Trait
// =============================================================================

/// Host-side notification hook.
///
/// Called from location tasks; implementations must not block.
pub trait SyncListener: Send + Sync {
    /// Entities whose value changed in one merge.
    fn emit_changes(&self, changes: &ChangeSet);

    /// Realtime connection state transition of one location.
    fn emit_health(&self, location_id: LocationId, health: &ConnectionHealth);

    /// An error that needs user action.
    fn emit_error(&self, location_id: Option<LocationId>, error: &SyncError);
}

/// Listener that ignores everything.
pub struct NoOpListener;

impl SyncListener for NoOpListener {
    fn emit_changes(&self, _changes: &ChangeSet) {}
    fn emit_health(&self, _location_id: LocationId, _health: &ConnectionHealth) {}
    fn emit_error(&self, _location_id: Option<LocationId>, _error: &SyncError) {}
}

// =============================================================================
// Lifecycle
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordinatorState {
    #[default]
    Init,
    Running,
    Stopped,
}

// =============================================================================
// Sync Coordinator
// =============================================================================

pub struct SyncCoordinator {
    config: Arc<HomelyConfig>,
    api: Arc<dyn HomeApi>,
    tokens: Arc<dyn TokenProvider>,
    listener: Arc<dyn SyncListener>,
    poll_policy: PollPolicy,
    state: CoordinatorState,

    /// Account locations from the last `list_locations` call.
    available: Vec<Location>,

    locations: HashMap<LocationId, LocationRuntime>,
}

impl SyncCoordinator {
    pub fn new(
        config: HomelyConfig,
        api: Arc<dyn HomeApi>,
        tokens: Arc<dyn TokenProvider>,
        listener: Arc<dyn SyncListener>,
    ) -> Self {
        let poll_policy = PollPolicy::from_settings(&config.polling);
        SyncCoordinator {
            config: Arc::new(config),
            api,
            tokens,
            listener,
            poll_policy,
            state: CoordinatorState::Init,
            available: Vec::new(),
            locations: HashMap::new(),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Validates the selected locations and starts mirroring them.
    ///
    /// Unknown selected locations are dropped with a warning. Calling
    /// `start` while running is a no-op; a stopped coordinator can be
    /// started again.
    pub async fn start(&mut self) -> SyncResult<()> {
        if self.state == CoordinatorState::Running {
            debug!("Coordinator already running");
            return Ok(());
        }

        self.config.validate()?;
        info!("Starting sync coordinator");

        self.available = match self.api.list_locations().await {
            Ok(locations) => locations,
            Err(e) => return Err(self.surface(None, e)),
        };
        let selected = match self.resolve_selection(&self.config.locations) {
            Ok(selected) => selected,
            Err(e) => return Err(self.surface(None, e)),
        };

        self.state = CoordinatorState::Running;
        for location_id in selected {
            if let Err(e) = self.add_location(location_id).await {
                warn!(%location_id, error = %e, "Failed to start location");
            }
        }

        info!(locations = self.locations.len(), "Sync coordinator running");
        Ok(())
    }

    /// Tears every location down. Idempotent.
    pub async fn stop(&mut self) {
        if self.state != CoordinatorState::Running {
            self.state = CoordinatorState::Stopped;
            return;
        }

        info!("Stopping sync coordinator");
        let runtimes: Vec<_> = self.locations.drain().map(|(_, rt)| rt).collect();
        for runtime in runtimes {
            runtime.shutdown().await;
        }
        self.state = CoordinatorState::Stopped;
        info!("Sync coordinator stopped");
    }

    /// Fetches the initial snapshot and starts the realtime client of one
    /// location. No-op if the location is already monitored.
    pub async fn add_location(&mut self, location_id: LocationId) -> SyncResult<()> {
        self.ensure_running()?;
        if self.locations.contains_key(&location_id) {
            debug!(%location_id, "Location already monitored");
            return Ok(());
        }

        if !self.available.iter().any(|l| l.location_id == location_id) {
            self.available = self.api.list_locations().await?;
        }
        let name = self
            .available
            .iter()
            .find(|l| l.location_id == location_id)
            .map(|l| l.name.clone())
            .ok_or(SyncError::UnknownLocation(location_id))?;

        let mut home = HomeState::new(location_id, self.config.store.policy());
        let requested_at = Utc::now();
        let last_poll = match self.api.get_home(location_id).await {
            Ok(snapshot) => {
                let changes = home.apply_snapshot(&snapshot, requested_at)?;
                let changes = ChangeSet::new(location_id, changes);
                if !changes.is_empty() {
                    self.listener.emit_changes(&changes);
                }
                info!(%location_id, %name, devices = home.device_count(), "Initial snapshot loaded");
                Some(Instant::now())
            }
            Err(e) if e.is_user_visible() => return Err(self.surface(Some(location_id), e)),
            Err(e) => {
                warn!(%location_id, error = %e, "Initial snapshot failed, polling will retry");
                None
            }
        };

        let home = Arc::new(RwLock::new(home));
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);
        let realtime = RealtimeClient::new(
            RealtimeConfig::from_config(&self.config, location_id),
            self.tokens.clone(),
            signal_tx,
        );
        let health = realtime.subscribe_health();
        let (refresh_tx, refresh_rx) = mpsc::channel::<RefreshReply>(4);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let alive = Arc::new(AtomicBool::new(true));

        let worker = LocationWorker {
            location_id,
            api: self.api.clone(),
            home: home.clone(),
            listener: self.listener.clone(),
            poll_policy: self.poll_policy,
            limiter: RefreshLimiter::new(Duration::from_secs(
                self.config.polling.error_refresh_min_gap_secs,
            )),
            alive: alive.clone(),
            last_poll,
            auth_reported: false,
        };
        let handle = tokio::spawn(worker.run(realtime, signal_rx, refresh_rx, shutdown_rx));

        self.locations.insert(
            location_id,
            LocationRuntime {
                home,
                health,
                refresh_tx,
                shutdown_tx,
                handle: Some(handle),
                alive,
            },
        );
        Ok(())
    }

    /// Stops mirroring one location.
    pub async fn remove_location(&mut self, location_id: LocationId) -> SyncResult<()> {
        let runtime = self
            .locations
            .remove(&location_id)
            .ok_or(SyncError::UnknownLocation(location_id))?;
        runtime.shutdown().await;
        info!(%location_id, "Location removed");
        Ok(())
    }

    /// Replaces the monitored set. An empty list selects every account
    /// location.
    pub async fn reload_locations(&mut self, location_ids: &[LocationId]) -> SyncResult<()> {
        self.ensure_running()?;
        self.available = self.api.list_locations().await?;
        let wanted = match self.resolve_selection(location_ids) {
            Ok(wanted) => wanted,
            Err(e) => return Err(self.surface(None, e)),
        };

        let removed: Vec<LocationId> = self
            .locations
            .keys()
            .filter(|id| !wanted.contains(id))
            .copied()
            .collect();
        for location_id in removed {
            self.remove_location(location_id).await?;
        }

        for location_id in wanted {
            if let Err(e) = self.add_location(location_id).await {
                warn!(%location_id, error = %e, "Failed to add location");
            }
        }
        Ok(())
    }

    /// Account locations with their monitored flag.
    pub fn available_locations(&self) -> Vec<MonitoredLocation> {
        self.available
            .iter()
            .map(|l| MonitoredLocation {
                id: l.location_id,
                name: l.name.clone(),
                monitored: self.locations.contains_key(&l.location_id),
            })
            .collect()
    }

    pub fn monitored_locations(&self) -> Vec<LocationId> {
        let mut ids: Vec<_> = self.locations.keys().copied().collect();
        ids.sort();
        ids
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Copy of the merged state of one location.
    pub fn home_state(&self, location_id: LocationId) -> Option<HomeState> {
        self.locations
            .get(&location_id)
            .map(|rt| read_home(&rt.home).clone())
    }

    /// Looks a device up in one location, or in every monitored location.
    pub fn device_state(
        &self,
        device_id: &DeviceId,
        location_id: Option<LocationId>,
    ) -> Option<Device> {
        match location_id {
            Some(location_id) => self
                .locations
                .get(&location_id)
                .and_then(|rt| read_home(&rt.home).device(device_id).cloned()),
            None => self
                .locations
                .values()
                .find_map(|rt| read_home(&rt.home).device(device_id).cloned()),
        }
    }

    pub fn alarm_state(&self, location_id: LocationId) -> Option<AlarmStatus> {
        self.locations
            .get(&location_id)
            .and_then(|rt| read_home(&rt.home).alarm().copied())
    }

    pub fn health(&self, location_id: LocationId) -> Option<ConnectionHealth> {
        self.locations
            .get(&location_id)
            .map(|rt| rt.health.borrow().clone())
    }

    /// Interval the location's poller would use right now.
    pub fn poll_interval(&self, location_id: LocationId) -> Option<Duration> {
        self.locations.get(&location_id).map(|rt| {
            let health = rt.health.borrow();
            self.poll_policy.interval(&health, Instant::now())
        })
    }

    /// Fetches a snapshot now, outside the poll schedule.
    pub async fn force_refresh(&self, location_id: LocationId) -> SyncResult<ChangeSet> {
        let runtime = self
            .locations
            .get(&location_id)
            .ok_or(SyncError::UnknownLocation(location_id))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        runtime
            .refresh_tx
            .send(reply_tx)
            .await
            .map_err(|_| SyncError::ChannelError("location task stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| SyncError::ChannelError("refresh dropped".into()))?
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn ensure_running(&self) -> SyncResult<()> {
        match self.state {
            CoordinatorState::Running => Ok(()),
            _ => Err(SyncError::NotRunning),
        }
    }

    fn resolve_selection(&self, requested: &[LocationId]) -> SyncResult<Vec<LocationId>> {
        let selected: Vec<LocationId> = if requested.is_empty() {
            self.available.iter().map(|l| l.location_id).collect()
        } else {
            requested
                .iter()
                .filter(|id| {
                    let known = self.available.iter().any(|l| l.location_id == **id);
                    if !known {
                        warn!(location_id = %id, "Selected location not found on account, skipping");
                    }
                    known
                })
                .copied()
                .collect()
        };

        if selected.is_empty() {
            return Err(SyncError::NoValidLocations);
        }
        Ok(selected)
    }

    /// Reports user-visible errors to the listener and hands the error back.
    fn surface(&self, location_id: Option<LocationId>, err: SyncError) -> SyncError {
        if err.is_user_visible() {
            error!(?location_id, error = %err, "Sync error needs user action");
            self.listener.emit_error(location_id, &err);
        }
        err
    }
}

// =============================================================================
// Location Runtime
// =============================================================================

/// Coordinator-side handle of one location task.
struct LocationRuntime {
    home: Arc<RwLock<HomeState>>,
    health: watch::Receiver<ConnectionHealth>,
    refresh_tx: mpsc::Sender<RefreshReply>,
    shutdown_tx: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,

    /// Cleared before shutdown so in-flight refreshes are discarded.
    alive: Arc<AtomicBool>,
}

impl LocationRuntime {
    async fn shutdown(mut self) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(()).await;
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Location task ended abnormally");
            }
        }
    }
}

impl Drop for LocationRuntime {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

// =============================================================================
// Location Task
// =============================================================================

struct LocationWorker {
    location_id: LocationId,
    api: Arc<dyn HomeApi>,
    home: Arc<RwLock<HomeState>>,
    listener: Arc<dyn SyncListener>,
    poll_policy: PollPolicy,
    limiter: RefreshLimiter,
    alive: Arc<AtomicBool>,
    last_poll: Option<Instant>,

    /// Set once an auth failure was reported; cleared on connect.
    auth_reported: bool,
}

impl LocationWorker {
    async fn run(
        mut self,
        mut realtime: RealtimeClient,
        mut signals: mpsc::Receiver<RealtimeSignal>,
        mut refresh_rx: mpsc::Receiver<RefreshReply>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let location_id = self.location_id;
        let mut health_rx = realtime.subscribe_health();
        realtime.start();
        info!(%location_id, "Location task started");

        loop {
            let due = {
                let health = health_rx.borrow();
                let interval = self.poll_policy.interval(&health, Instant::now());
                self.last_poll
                    .map(|at| at + interval)
                    .unwrap_or_else(Instant::now)
            };

            tokio::select! {
                Some(signal) = signals.recv() => {
                    self.handle_signal(signal).await;
                }

                Ok(()) = health_rx.changed() => {
                    let health = health_rx.borrow_and_update().clone();
                    debug!(%location_id, state = %health.state, "Realtime health changed");
                    self.listener.emit_health(location_id, &health);
                }

                _ = sleep_until(due) => {
                    // Health may have moved since the deadline was set.
                    let now = Instant::now();
                    let interval = {
                        let health = health_rx.borrow();
                        self.poll_policy.interval(&health, now)
                    };
                    let is_due = self.last_poll.map(|at| at + interval <= now).unwrap_or(true);
                    if is_due {
                        debug!(%location_id, ?interval, "Scheduled poll");
                        if let Err(e) = self.refresh().await {
                            self.report_refresh_error(&e);
                        }
                    }
                }

                Some(reply) = refresh_rx.recv() => {
                    info!(%location_id, "Manual refresh");
                    let result = self.refresh().await;
                    let _ = reply.send(result);
                }

                _ = shutdown_rx.recv() => {
                    debug!(%location_id, "Location task received shutdown");
                    break;
                }
            }
        }

        self.alive.store(false, Ordering::SeqCst);
        // Unblocks a worker stuck sending into a full signal channel.
        drop(signals);
        realtime.stop().await;
        info!(%location_id, "Location task stopped");
    }

    async fn handle_signal(&mut self, signal: RealtimeSignal) {
        let location_id = self.location_id;
        match signal {
            RealtimeSignal::Event { event, received_at } => {
                let result = write_home(&self.home).apply_event(&event, received_at);
                match result {
                    Ok(changes) => {
                        self.publish(changes);
                    }
                    Err(e) => {
                        warn!(%location_id, event_type = event.type_name(), error = %e, "Realtime event rejected");
                        self.error_refresh("rejected event").await;
                    }
                }
            }

            RealtimeSignal::DecodeFailed { error } => {
                debug!(%location_id, %error, "Undecodable realtime event");
                self.error_refresh("undecodable event").await;
            }

            RealtimeSignal::Connected => {
                self.auth_reported = false;
                debug!(%location_id, "Realtime channel up");
            }

            RealtimeSignal::Disconnected { reason } => {
                debug!(%location_id, %reason, "Realtime channel down, polling compensates");
            }

            RealtimeSignal::AuthFailed { error } => {
                if !self.auth_reported {
                    self.auth_reported = true;
                    let err = SyncError::AuthenticationFailed(error);
                    error!(%location_id, error = %err, "Realtime authentication failed");
                    self.listener.emit_error(Some(location_id), &err);
                }
            }
        }
    }

    /// Out-of-band refresh after an anomaly, at most once per limiter window.
    async fn error_refresh(&mut self, reason: &str) {
        if !self.limiter.try_acquire(Instant::now()) {
            debug!(location_id = %self.location_id, reason, "Error-triggered refresh suppressed");
            return;
        }
        info!(location_id = %self.location_id, reason, "Refreshing after error");
        if let Err(e) = self.refresh().await {
            self.report_refresh_error(&e);
        }
    }

    async fn refresh(&mut self) -> SyncResult<ChangeSet> {
        let requested_at = Utc::now();
        let snapshot = self.api.get_home(self.location_id).await;
        self.last_poll = Some(Instant::now());

        if !self.alive.load(Ordering::SeqCst) {
            return Err(SyncError::ShuttingDown);
        }

        let snapshot = snapshot?;
        let changes = write_home(&self.home).apply_snapshot(&snapshot, requested_at)?;
        Ok(self.publish(changes))
    }

    fn publish(&self, changes: Vec<StateChange>) -> ChangeSet {
        let changes = ChangeSet::new(self.location_id, changes);
        if !changes.is_empty() {
            debug!(
                location_id = %self.location_id,
                count = changes.changes.len(),
                "State changed"
            );
            self.listener.emit_changes(&changes);
        }
        changes
    }

    fn report_refresh_error(&self, err: &SyncError) {
        if err.is_user_visible() {
            error!(location_id = %self.location_id, error = %err, "Refresh failed");
            self.listener.emit_error(Some(self.location_id), err);
        } else {
            warn!(location_id = %self.location_id, error = %err, "Refresh failed, keeping last known state");
        }
    }
}

fn read_home(home: &RwLock<HomeState>) -> RwLockReadGuard<'_, HomeState> {
    home.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_home(home: &RwLock<HomeState>) -> RwLockWriteGuard<'_, HomeState> {
    home.write().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for `SyncCoordinator`.
///
/// Without overrides the builder wires a `TokenManager` over the HTTP auth
/// endpoints (logging in lazily with the configured account) and a
/// `RestClient` sharing it.
pub struct SyncCoordinatorBuilder {
    config: HomelyConfig,
    api: Option<Arc<dyn HomeApi>>,
    tokens: Option<Arc<dyn TokenProvider>>,
    listener: Option<Arc<dyn SyncListener>>,
}

impl SyncCoordinatorBuilder {
    pub fn new(config: HomelyConfig) -> Self {
        SyncCoordinatorBuilder {
            config,
            api: None,
            tokens: None,
            listener: None,
        }
    }

    pub fn with_api(mut self, api: Arc<dyn HomeApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_tokens(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn SyncListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn build(self) -> SyncResult<SyncCoordinator> {
        let api_settings = &self.config.api;

        let tokens: Arc<dyn TokenProvider> = match self.tokens {
            Some(tokens) => tokens,
            None => {
                let backend = HttpAuthBackend::new(
                    api_settings.base_url.clone(),
                    api_settings.request_timeout(),
                )?;
                Arc::new(TokenManager::with_credentials(
                    Arc::new(backend),
                    api_settings.token_refresh_margin(),
                    self.config.credentials()?,
                ))
            }
        };

        let api: Arc<dyn HomeApi> = match self.api {
            Some(api) => api,
            None => Arc::new(RestClient::new(
                api_settings.base_url.clone(),
                api_settings.request_timeout(),
                tokens.clone(),
            )?),
        };

        let listener = self.listener.unwrap_or_else(|| Arc::new(NoOpListener));

        Ok(SyncCoordinator::new(self.config, api, tokens, listener))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use homely_core::{
        AlarmChange, AlarmState, DeviceChange, Feature, FeatureChange, HomeResponse,
        RealtimeEvent, SensorState, StateValue, UserRole,
    };
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use crate::health::ConnectionState;

    // -------------------------------------------------------------------------
    // Fixtures
    // -------------------------------------------------------------------------

    const HOME_A: &str = "550e8400-e29b-41d4-a716-446655440100";
    const HOME_B: &str = "550e8400-e29b-41d4-a716-446655440200";
    const UNKNOWN: &str = "550e8400-e29b-41d4-a716-446655440999";
    const D1: &str = "550e8400-e29b-41d4-a716-446655440001";

    fn id(s: &str) -> LocationId {
        s.parse().unwrap()
    }

    fn device_id() -> DeviceId {
        D1.parse().unwrap()
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn location(s: &str, name: &str) -> Location {
        Location {
            name: name.to_string(),
            role: UserRole::Owner,
            user_id: uuid::Uuid::nil(),
            location_id: id(s),
            gateway_serial: None,
            partner_code: None,
        }
    }

    fn home(s: &str, motion: bool, at: i64) -> HomeResponse {
        let mut states = BTreeMap::new();
        states.insert("alarm".to_string(), SensorState::new(motion, ts(at)));
        let mut features = BTreeMap::new();
        features.insert("alarm".to_string(), Feature { states });

        HomeResponse {
            location_id: id(s),
            gateway_serial: None,
            name: Some("Home".to_string()),
            alarm_state: AlarmState::Disarmed,
            user_role: UserRole::Owner,
            devices: vec![Device {
                id: device_id(),
                name: Some("Motion hallway".to_string()),
                serial_number: None,
                location: None,
                online: true,
                model_id: uuid::Uuid::nil(),
                model_name: None,
                features,
            }],
        }
    }

    fn motion_event(location: &str, motion: bool, at: i64) -> RealtimeEvent {
        let change = FeatureChange {
            feature: "alarm".to_string(),
            state_name: "alarm".to_string(),
            value: Some(StateValue::Bool(motion)),
            last_updated: Some(ts(at)),
        };
        RealtimeEvent::DeviceStateChanged(DeviceChange {
            location_id: id(location),
            root_location_id: None,
            device_id: device_id(),
            gateway_id: None,
            model_id: None,
            change: Some(change),
            changes: Vec::new(),
            partner_code: None,
        })
    }

    struct MockApi {
        locations: Vec<Location>,
        homes: Mutex<HashMap<LocationId, HomeResponse>>,
        home_calls: AtomicUsize,
    }

    impl MockApi {
        fn new() -> Arc<Self> {
            let mut homes = HashMap::new();
            homes.insert(id(HOME_A), home(HOME_A, false, 100));
            homes.insert(id(HOME_B), home(HOME_B, false, 100));
            Arc::new(MockApi {
                locations: vec![location(HOME_A, "Cabin"), location(HOME_B, "Flat")],
                homes: Mutex::new(homes),
                home_calls: AtomicUsize::new(0),
            })
        }

        fn set_home(&self, home: HomeResponse) {
            self.homes.lock().unwrap().insert(home.location_id, home);
        }

        fn calls(&self) -> usize {
            self.home_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HomeApi for MockApi {
        async fn list_locations(&self) -> SyncResult<Vec<Location>> {
            Ok(self.locations.clone())
        }

        async fn get_home(&self, location_id: LocationId) -> SyncResult<HomeResponse> {
            self.home_calls.fetch_add(1, Ordering::SeqCst);
            self.homes
                .lock()
                .unwrap()
                .get(&location_id)
                .cloned()
                .ok_or(SyncError::RequestFailed {
                    status: 404,
                    message: "not found".into(),
                })
        }
    }

    /// Keeps the realtime channel down without touching the network.
    struct OfflineTokens;

    #[async_trait]
    impl TokenProvider for OfflineTokens {
        async fn access_token(&self) -> SyncResult<String> {
            Err(SyncError::Network("offline".into()))
        }

        async fn invalidate(&self) {}
    }

    #[derive(Default)]
    struct RecordingListener {
        changes: Mutex<Vec<ChangeSet>>,
        health: Mutex<Vec<ConnectionState>>,
        errors: Mutex<Vec<String>>,
    }

    impl SyncListener for RecordingListener {
        fn emit_changes(&self, changes: &ChangeSet) {
            self.changes.lock().unwrap().push(changes.clone());
        }

        fn emit_health(&self, _location_id: LocationId, health: &ConnectionHealth) {
            self.health.lock().unwrap().push(health.state);
        }

        fn emit_error(&self, _location_id: Option<LocationId>, error: &SyncError) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    fn coordinator(
        locations: Vec<LocationId>,
        api: Arc<MockApi>,
        listener: Arc<RecordingListener>,
    ) -> SyncCoordinator {
        let config = HomelyConfig {
            locations,
            ..Default::default()
        };
        SyncCoordinatorBuilder::new(config)
            .with_api(api)
            .with_tokens(Arc::new(OfflineTokens))
            .with_listener(listener)
            .build()
            .unwrap()
    }

    fn worker(api: Arc<MockApi>, listener: Arc<RecordingListener>) -> LocationWorker {
        let snapshot = home(HOME_A, false, 100);
        LocationWorker {
            location_id: id(HOME_A),
            api,
            home: Arc::new(RwLock::new(HomeState::from_snapshot(
                &snapshot,
                ts(100),
                Default::default(),
            ))),
            listener,
            poll_policy: PollPolicy::default(),
            limiter: RefreshLimiter::new(Duration::from_secs(60)),
            alive: Arc::new(AtomicBool::new(true)),
            last_poll: None,
            auth_reported: false,
        }
    }

    fn motion(home: &RwLock<HomeState>) -> Option<bool> {
        read_home(home)
            .state(&device_id(), "alarm", "alarm")
            .and_then(|s| s.value.as_ref())
            .and_then(StateValue::as_bool)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_start_validates_selected_locations() {
        let api = MockApi::new();
        let listener = Arc::new(RecordingListener::default());
        let mut coordinator = coordinator(vec![id(HOME_A), id(UNKNOWN)], api.clone(), listener.clone());

        coordinator.start().await.unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::Running);
        assert_eq!(coordinator.monitored_locations(), vec![id(HOME_A)]);

        let available = coordinator.available_locations();
        assert_eq!(available.len(), 2);
        assert!(available.iter().any(|l| l.id == id(HOME_A) && l.monitored));
        assert!(available.iter().any(|l| l.id == id(HOME_B) && !l.monitored));

        // Initial snapshot populated the mirror and was announced.
        let state = coordinator.home_state(id(HOME_A)).unwrap();
        assert_eq!(state.device_count(), 1);
        assert_eq!(coordinator.alarm_state(id(HOME_A)).unwrap().state, AlarmState::Disarmed);
        assert!(!listener.changes.lock().unwrap().is_empty());

        coordinator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_valid_locations() {
        let api = MockApi::new();
        let listener = Arc::new(RecordingListener::default());
        let mut coordinator = coordinator(vec![id(UNKNOWN)], api, listener.clone());

        let err = coordinator.start().await.unwrap_err();
        assert!(matches!(err, SyncError::NoValidLocations));
        assert_eq!(coordinator.state(), CoordinatorState::Init);
        assert_eq!(listener.errors.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_selection_monitors_everything() {
        let api = MockApi::new();
        let mut coordinator = coordinator(Vec::new(), api, Arc::new(RecordingListener::default()));

        coordinator.start().await.unwrap();
        coordinator.start().await.unwrap();
        assert_eq!(coordinator.monitored_locations(), vec![id(HOME_A), id(HOME_B)]);

        // Scoped and unscoped device lookups.
        assert!(coordinator.device_state(&device_id(), Some(id(HOME_B))).is_some());
        assert!(coordinator.device_state(&device_id(), None).is_some());
        assert!(coordinator.device_state(&device_id(), Some(id(UNKNOWN))).is_none());

        coordinator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_tears_everything_down() {
        let api = MockApi::new();
        let mut coordinator = coordinator(vec![id(HOME_A)], api.clone(), Arc::new(RecordingListener::default()));

        coordinator.start().await.unwrap();
        coordinator.stop().await;
        coordinator.stop().await;

        assert_eq!(coordinator.state(), CoordinatorState::Stopped);
        assert!(coordinator.home_state(id(HOME_A)).is_none());

        let calls = api.calls();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(api.calls(), calls);

        assert!(matches!(
            coordinator.add_location(id(HOME_A)).await,
            Err(SyncError::NotRunning)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_and_remove_locations() {
        let api = MockApi::new();
        let mut coordinator = coordinator(vec![id(HOME_A)], api, Arc::new(RecordingListener::default()));
        coordinator.start().await.unwrap();

        coordinator.reload_locations(&[id(HOME_B)]).await.unwrap();
        assert_eq!(coordinator.monitored_locations(), vec![id(HOME_B)]);

        coordinator.remove_location(id(HOME_B)).await.unwrap();
        assert!(coordinator.monitored_locations().is_empty());
        assert!(matches!(
            coordinator.remove_location(id(HOME_B)).await,
            Err(SyncError::UnknownLocation(_))
        ));

        assert!(matches!(
            coordinator.reload_locations(&[id(UNKNOWN)]).await,
            Err(SyncError::NoValidLocations)
        ));
        coordinator.stop().await;
    }

    // -------------------------------------------------------------------------
    // Polling
    // -------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_fallback_polling_while_realtime_down() {
        let api = MockApi::new();
        let listener = Arc::new(RecordingListener::default());
        let mut coordinator = coordinator(vec![id(HOME_A)], api.clone(), listener.clone());
        coordinator.start().await.unwrap();
        assert_eq!(api.calls(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(coordinator.poll_interval(id(HOME_A)).unwrap() <= Duration::from_secs(30));
        assert_eq!(
            coordinator.health(id(HOME_A)).unwrap().state,
            ConnectionState::ReconnectWait
        );
        assert!(listener.health.lock().unwrap().contains(&ConnectionState::ReconnectWait));

        // A newer value shows up through polling alone.
        api.set_home(home(HOME_A, true, 200));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(api.calls(), 2);
        let state = coordinator.home_state(id(HOME_A)).unwrap();
        let value = state.state(&device_id(), "alarm", "alarm").unwrap();
        assert_eq!(value.value, Some(StateValue::Bool(true)));

        coordinator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_reports_changes() {
        let api = MockApi::new();
        let mut coordinator = coordinator(vec![id(HOME_A)], api.clone(), Arc::new(RecordingListener::default()));
        coordinator.start().await.unwrap();

        let unchanged = coordinator.force_refresh(id(HOME_A)).await.unwrap();
        assert!(unchanged.is_empty());

        api.set_home(home(HOME_A, true, 200));
        let changed = coordinator.force_refresh(id(HOME_A)).await.unwrap();
        assert_eq!(changed.devices().into_iter().collect::<Vec<_>>(), vec![device_id()]);

        assert!(matches!(
            coordinator.force_refresh(id(UNKNOWN)).await,
            Err(SyncError::UnknownLocation(_))
        ));
        coordinator.stop().await;
    }

    // -------------------------------------------------------------------------
    // Event ingestion
    // -------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_events_route_into_store() {
        let api = MockApi::new();
        let listener = Arc::new(RecordingListener::default());
        let mut worker = worker(api.clone(), listener.clone());

        worker
            .handle_signal(RealtimeSignal::Event {
                event: motion_event(HOME_A, true, 150),
                received_at: ts(151),
            })
            .await;
        assert_eq!(motion(&worker.home), Some(true));
        assert_eq!(listener.changes.lock().unwrap().len(), 1);

        // Stale re-snapshot does not revert the realtime value.
        api.set_home(home(HOME_A, false, 120));
        let changes = worker.refresh().await.unwrap();
        assert!(changes.is_empty());
        assert_eq!(motion(&worker.home), Some(true));

        worker
            .handle_signal(RealtimeSignal::Event {
                event: RealtimeEvent::AlarmStateChanged(AlarmChange {
                    location_id: id(HOME_A),
                    state: AlarmState::ArmedAway,
                    last_updated: None,
                    user_id: None,
                }),
                received_at: Utc::now() + chrono::Duration::seconds(1),
            })
            .await;
        assert_eq!(read_home(&worker.home).alarm_state(), Some(AlarmState::ArmedAway));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_event_isolated_and_refresh_rate_limited() {
        let api = MockApi::new();
        let listener = Arc::new(RecordingListener::default());
        let mut worker = worker(api.clone(), listener.clone());

        worker
            .handle_signal(RealtimeSignal::Event {
                event: motion_event(HOME_B, true, 150),
                received_at: ts(151),
            })
            .await;
        assert_eq!(motion(&worker.home), Some(false));
        assert_eq!(api.calls(), 1);
        assert!(listener.errors.lock().unwrap().is_empty());

        // Second anomaly inside the window is suppressed.
        tokio::time::advance(Duration::from_secs(10)).await;
        worker
            .handle_signal(RealtimeSignal::DecodeFailed {
                error: "unknown variant".into(),
            })
            .await;
        assert_eq!(api.calls(), 1);

        tokio::time::advance(Duration::from_secs(50)).await;
        worker
            .handle_signal(RealtimeSignal::DecodeFailed {
                error: "unknown variant".into(),
            })
            .await;
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_reported_once_per_outage() {
        let api = MockApi::new();
        let listener = Arc::new(RecordingListener::default());
        let mut worker = worker(api, listener.clone());

        for _ in 0..3 {
            worker
                .handle_signal(RealtimeSignal::AuthFailed {
                    error: "login rejected (401): invalid credentials".into(),
                })
                .await;
        }
        assert_eq!(listener.errors.lock().unwrap().len(), 1);

        worker.handle_signal(RealtimeSignal::Connected).await;
        worker
            .handle_signal(RealtimeSignal::AuthFailed {
                error: "login rejected (401): invalid credentials".into(),
            })
            .await;
        assert_eq!(listener.errors.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_after_teardown_is_discarded() {
        let api = MockApi::new();
        let listener = Arc::new(RecordingListener::default());
        let mut worker = worker(api.clone(), listener.clone());

        worker.alive.store(false, Ordering::SeqCst);
        api.set_home(home(HOME_A, true, 500));
        assert!(matches!(worker.refresh().await, Err(SyncError::ShuttingDown)));
        assert_eq!(motion(&worker.home), Some(false));
    }
}
