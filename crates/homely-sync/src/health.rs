//! # Connection Health
//!
//! Health record of one realtime connection and the policies derived
//! from it: reconnect backoff, REST polling interval and the rate limit on
//! error-triggered refreshes.
//!
//! ## Polling Decision
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Adaptive Polling                                  │
//! │                                                                         │
//! │   ConnectionHealth ──► PollPolicy::interval() ──► next poll deadline    │
//! │                                                                         │
//! │   state == Connected ──┬── activity within window ──► 30 min           │
//! │                        └── silent beyond window   ──► 60 s             │
//! │   anything else ─────────────────────────────────► 30 s                │
//! │                                                                         │
//! │   Recomputed on every health change and before every poll.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{PollingSettings, RealtimeSettings};

// =============================================================================
// Connection State
// =============================================================================

/// Realtime connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected (initial, or after `stop`).
    #[default]
    Disconnected,
    /// Handshake and subscribe in progress.
    Connecting,
    /// Subscribed to the location's events.
    Connected,
    /// Waiting for the backoff delay before the next attempt.
    ReconnectWait,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::ReconnectWait => write!(f, "reconnect_wait"),
        }
    }
}

// =============================================================================
// Health Record
// =============================================================================

/// Health of one realtime connection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectionHealth {
    pub state: ConnectionState,

    /// Failed attempts since the last successful connection.
    pub consecutive_failures: u32,

    /// When the next attempt is scheduled (only in `ReconnectWait`).
    pub next_reconnect_at: Option<Instant>,

    /// Delay chosen after the most recent failure.
    pub last_backoff: Option<Duration>,

    /// Last inbound frame of any kind.
    pub last_activity_at: Option<Instant>,

    /// Wall-clock time of the last successfully decoded event.
    pub last_event_at: Option<DateTime<Utc>>,

    /// Most recent connection error, for diagnostics.
    pub last_error: Option<String>,
}

impl ConnectionHealth {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Connected and heard from within `window`.
    pub fn is_active(&self, window: Duration, now: Instant) -> bool {
        self.is_connected()
            && self
                .last_activity_at
                .map(|at| now.saturating_duration_since(at) <= window)
                .unwrap_or(false)
    }
}

// =============================================================================
// Reconnect Backoff
// =============================================================================

/// Exponential reconnect backoff without jitter: `min(ceiling, initial * 2^(n-1))`
/// after the n-th consecutive failure.
pub struct ReconnectBackoff {
    inner: ExponentialBackoff,
    initial: Duration,
    ceiling: Duration,
    failures: u32,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(initial);
        ReconnectBackoff {
            inner: ExponentialBackoff {
                initial_interval: initial,
                current_interval: initial,
                max_interval: ceiling,
                multiplier: 2.0,
                randomization_factor: 0.0,
                max_elapsed_time: None, // Never give up
                ..Default::default()
            },
            initial,
            ceiling,
            failures: 0,
        }
    }

    pub fn from_settings(settings: &RealtimeSettings) -> Self {
        Self::new(
            Duration::from_secs(settings.initial_backoff_secs),
            Duration::from_secs(settings.max_backoff_secs),
        )
    }

    /// Records one failure and returns the delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.inner.next_backoff().unwrap_or(self.ceiling);
        // Whole milliseconds; the crate's interval arithmetic works in f64 nanos.
        Duration::from_millis(delay.as_millis() as u64).min(self.ceiling)
    }

    /// Delay after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.ceiling, |delay| delay.min(self.ceiling))
    }

    /// Called on every successful connection.
    pub fn reset(&mut self) {
        self.inner.reset();
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl std::fmt::Debug for ReconnectBackoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectBackoff")
            .field("initial", &self.initial)
            .field("ceiling", &self.ceiling)
            .field("failures", &self.failures)
            .finish()
    }
}

// =============================================================================
// Poll Policy
// =============================================================================

/// Chooses the REST polling interval from connection health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub connected: Duration,
    pub stale: Duration,
    pub fallback: Duration,
    pub activity_window: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from_settings(&PollingSettings::default())
    }
}

impl PollPolicy {
    pub fn from_settings(settings: &PollingSettings) -> Self {
        PollPolicy {
            connected: Duration::from_secs(settings.connected_interval_secs),
            stale: Duration::from_secs(settings.stale_interval_secs),
            fallback: Duration::from_secs(settings.fallback_interval_secs),
            activity_window: Duration::from_secs(settings.activity_window_secs),
        }
    }

    /// Activity is any inbound frame, Engine.IO pings included, so a quiet
    /// home on a live link keeps the long interval. The stale tier covers a
    /// link that went silent while still counted as connected: servers that
    /// never ping, or the gap before the ping-timeout deadline drops it.
    pub fn interval(&self, health: &ConnectionHealth, now: Instant) -> Duration {
        if !health.is_connected() {
            self.fallback
        } else if health.is_active(self.activity_window, now) {
            self.connected
        } else {
            self.stale
        }
    }
}

// =============================================================================
// Refresh Limiter
// =============================================================================

/// Allows at most one error-triggered refresh per `min_gap`.
#[derive(Debug, Clone)]
pub struct RefreshLimiter {
    min_gap: Duration,
    last: Option<Instant>,
}

impl RefreshLimiter {
    pub fn new(min_gap: Duration) -> Self {
        RefreshLimiter { min_gap, last: None }
    }

    /// Returns true and records `now` if a refresh may run.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last {
            if now.saturating_duration_since(last) < self.min_gap {
                return false;
            }
        }
        self.last = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = ReconnectBackoff::from_settings(&RealtimeSettings::default());
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![30, 60, 120, 240, 300, 300]);
        assert_eq!(backoff.failures(), 6);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), secs(30));
        assert_eq!(backoff.next_delay(), secs(60));
    }

    #[test]
    fn test_backoff_matches_formula() {
        let mut backoff = ReconnectBackoff::new(secs(1), secs(64));
        for n in 1..=10u32 {
            let delay = backoff.next_delay();
            assert_eq!(delay, backoff.delay_for(n), "failure {}", n);
        }
    }

    #[test]
    fn test_backoff_formula() {
        let backoff = ReconnectBackoff::new(secs(30), secs(300));
        for n in 1..=40u32 {
            let expected = (30u64 << (n - 1).min(20)).min(300);
            assert_eq!(backoff.delay_for(n), secs(expected), "failure {}", n);
        }
        assert_eq!(backoff.delay_for(u32::MAX), secs(300));
        assert_eq!(backoff.delay_for(0), Duration::ZERO);
    }

    #[test]
    fn test_poll_interval_tiers() {
        let policy = PollPolicy::default();
        let now = Instant::now() + secs(3600);

        let disconnected = ConnectionHealth::default();
        assert!(policy.interval(&disconnected, now) <= secs(30));

        let waiting = ConnectionHealth {
            state: ConnectionState::ReconnectWait,
            consecutive_failures: 3,
            ..Default::default()
        };
        assert!(policy.interval(&waiting, now) <= secs(30));

        let active = ConnectionHealth {
            state: ConnectionState::Connected,
            last_activity_at: Some(now - secs(10)),
            ..Default::default()
        };
        assert!(policy.interval(&active, now) >= secs(1500));

        let silent = ConnectionHealth {
            state: ConnectionState::Connected,
            last_activity_at: Some(now - secs(600)),
            ..Default::default()
        };
        assert_eq!(policy.interval(&silent, now), secs(60));
    }

    #[test]
    fn test_pings_keep_quiet_link_on_long_interval() {
        let policy = PollPolicy::default();
        let now = Instant::now() + secs(3600);

        // No event for an hour, but a ping 25 s ago.
        let quiet = ConnectionHealth {
            state: ConnectionState::Connected,
            last_activity_at: Some(now - secs(25)),
            last_event_at: None,
            ..Default::default()
        };
        assert_eq!(policy.interval(&quiet, now), secs(1800));

        // Never heard anything since connecting.
        let mute = ConnectionHealth {
            state: ConnectionState::Connected,
            ..Default::default()
        };
        assert_eq!(policy.interval(&mute, now), secs(60));
    }

    #[test]
    fn test_refresh_limiter() {
        let mut limiter = RefreshLimiter::new(secs(60));
        let start = Instant::now();

        assert!(limiter.try_acquire(start));
        assert!(!limiter.try_acquire(start + secs(1)));
        assert!(!limiter.try_acquire(start + secs(59)));
        assert!(limiter.try_acquire(start + secs(60)));
        assert!(!limiter.try_acquire(start + secs(90)));
        assert!(limiter.try_acquire(start + secs(121)));
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::ReconnectWait.to_string(), "reconnect_wait");
    }
}
