//! # Realtime Client
//!
//! One persistent Socket.IO connection per location, with deterministic
//! exponential backoff between attempts.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Realtime Connection States                           │
//! │                                                                         │
//! │  ┌────────────┐    start()      ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │ ◄──────────────┐        │
//! │  └────────────┘                 └─────┬──────┘                │        │
//! │        ▲                              │                       │        │
//! │        │            subscribed (40)   │   failure (token,     │        │
//! │        │                        ┌─────┴─────┐  timeout, 44)   │        │
//! │        │                        ▼           ▼                 │        │
//! │        │              ┌────────────┐  ┌──────────────┐        │        │
//! │        │              │ Connected  │  │ReconnectWait │ ───────┘        │
//! │        │              └─────┬──────┘  └──────────────┘  delay elapsed  │
//! │        │                    │               ▲                          │
//! │        │                    └───────────────┘                          │
//! │        │                   disconnect / protocol error                 │
//! │        │                                                                │
//! │        └──────────── stop() from any state                              │
//! │                                                                         │
//! │  BACKOFF (defaults)                                                    │
//! │  ──────────────────                                                    │
//! │  Failure 1: 30s    Failure 2: 60s    Failure 3: 120s                   │
//! │  Failure 4: 240s   Failure 5+: 300s  (reset on every connect)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The owner receives [`RealtimeSignal`]s over an mpsc channel and reads the
//! [`ConnectionHealth`] record through a `watch` channel. State transitions
//! notify watchers; per-frame activity updates are written silently.

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use homely_core::{LocationId, RealtimeEvent};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::auth::TokenProvider;
use crate::config::HomelyConfig;
use crate::error::{SyncError, SyncResult};
use crate::health::{ConnectionHealth, ConnectionState, ReconnectBackoff};
use crate::protocol::{socket_url, Frame, OpenPayload, Packet, EVENT_NAME};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for one location's realtime client.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub location_id: LocationId,

    /// Realtime server base URL (`wss://sdk.iotiliti.cloud`).
    pub ws_url: String,

    /// Upper bound for connect + Socket.IO handshake.
    pub connect_timeout: Duration,

    pub initial_backoff: Duration,

    pub max_backoff: Duration,
}

impl RealtimeConfig {
    pub fn from_config(config: &HomelyConfig, location_id: LocationId) -> Self {
        RealtimeConfig {
            location_id,
            ws_url: config.api.ws_url.clone(),
            connect_timeout: Duration::from_secs(config.realtime.connect_timeout_secs),
            initial_backoff: Duration::from_secs(config.realtime.initial_backoff_secs),
            max_backoff: Duration::from_secs(config.realtime.max_backoff_secs),
        }
    }
}

// =============================================================================
// Signals
// =============================================================================

/// Notifications from the client to its owner.
#[derive(Debug, Clone)]
pub enum RealtimeSignal {
    /// Subscribed to the location's events.
    Connected,

    /// An established connection was lost.
    Disconnected { reason: String },

    /// A decoded event.
    Event {
        event: RealtimeEvent,
        received_at: chrono::DateTime<Utc>,
    },

    /// An inbound event could not be decoded and was dropped.
    DecodeFailed { error: String },

    /// No token could be obtained for a connection attempt.
    AuthFailed { error: String },
}

// =============================================================================
// Realtime Client
// =============================================================================

struct RunningTask {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Handle owning the background connection task of one location.
///
/// ## Usage
/// ```rust,ignore
/// let (signal_tx, mut signals) = mpsc::channel(64);
/// let mut client = RealtimeClient::new(config, tokens, signal_tx);
/// client.start();
///
/// while let Some(signal) = signals.recv().await {
///     // route events to the HomeState
/// }
///
/// client.stop().await;
/// ```
pub struct RealtimeClient {
    config: RealtimeConfig,
    tokens: Arc<dyn TokenProvider>,
    signals: mpsc::Sender<RealtimeSignal>,
    health: Arc<watch::Sender<ConnectionHealth>>,
    task: Option<RunningTask>,
}

impl RealtimeClient {
    pub fn new(
        config: RealtimeConfig,
        tokens: Arc<dyn TokenProvider>,
        signals: mpsc::Sender<RealtimeSignal>,
    ) -> Self {
        let (health, _) = watch::channel(ConnectionHealth::default());
        RealtimeClient {
            config,
            tokens,
            signals,
            health: Arc::new(health),
            task: None,
        }
    }

    pub fn location_id(&self) -> LocationId {
        self.config.location_id
    }

    /// Starts connecting in the background. No-op while already running.
    pub fn start(&mut self) {
        if self.is_running() {
            debug!(location_id = %self.config.location_id, "Realtime client already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let worker = Worker {
            config: self.config.clone(),
            tokens: self.tokens.clone(),
            signals: self.signals.clone(),
            health: self.health.clone(),
        };
        let handle = tokio::spawn(worker.run(shutdown_rx));
        self.task = Some(RunningTask {
            shutdown_tx,
            handle,
        });
    }

    /// Closes the connection, cancels any pending reconnect and waits for
    /// the background task to finish.
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.shutdown_tx.send(()).await;
            if let Err(e) = task.handle.await {
                warn!(location_id = %self.config.location_id, error = %e, "Realtime task ended abnormally");
            }
        }
        self.health.send_modify(|h| {
            h.state = ConnectionState::Disconnected;
            h.next_reconnect_at = None;
        });
    }

    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    /// Latest health record.
    pub fn health(&self) -> ConnectionHealth {
        self.health.borrow().clone()
    }

    /// Receiver notified on every state transition.
    pub fn subscribe_health(&self) -> watch::Receiver<ConnectionHealth> {
        self.health.subscribe()
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.handle.abort();
        }
    }
}

// =============================================================================
// Background Worker
// =============================================================================

enum LoopExit {
    /// Server closed the connection.
    Closed,
    /// Owner asked us to stop (or went away).
    Shutdown,
}

struct Worker {
    config: RealtimeConfig,
    tokens: Arc<dyn TokenProvider>,
    signals: mpsc::Sender<RealtimeSignal>,
    health: Arc<watch::Sender<ConnectionHealth>>,
}

impl Worker {
    /// Main connection loop.
    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        let location_id = self.config.location_id;
        info!(%location_id, url = %self.config.ws_url, "Realtime client starting");

        let mut backoff = ReconnectBackoff::new(self.config.initial_backoff, self.config.max_backoff);

        loop {
            self.health.send_modify(|h| {
                h.state = ConnectionState::Connecting;
                h.next_reconnect_at = None;
            });

            let attempt = tokio::select! {
                result = self.connect() => result,
                _ = shutdown_rx.recv() => break,
            };

            let error = match attempt {
                Ok((stream, open)) => {
                    backoff.reset();
                    let now = Instant::now();
                    self.health.send_modify(|h| {
                        h.state = ConnectionState::Connected;
                        h.consecutive_failures = 0;
                        h.last_activity_at = Some(now);
                        h.last_error = None;
                    });
                    info!(%location_id, "Realtime connected");
                    if !self.signal(RealtimeSignal::Connected, &mut shutdown_rx).await {
                        break;
                    }

                    let reason = match self.connection_loop(stream, &open, &mut shutdown_rx).await {
                        Ok(LoopExit::Shutdown) => break,
                        Ok(LoopExit::Closed) => "closed by server".to_string(),
                        Err(e) => e.to_string(),
                    };
                    warn!(%location_id, %reason, "Realtime disconnected");
                    if !self
                        .signal(RealtimeSignal::Disconnected { reason: reason.clone() }, &mut shutdown_rx)
                        .await
                    {
                        break;
                    }
                    reason
                }
                Err(e) => {
                    warn!(%location_id, error = %e, "Realtime connection attempt failed");
                    if let SyncError::AuthenticationFailed(_) = e {
                        if !self
                            .signal(RealtimeSignal::AuthFailed { error: e.to_string() }, &mut shutdown_rx)
                            .await
                        {
                            break;
                        }
                    }
                    e.to_string()
                }
            };

            let delay = backoff.next_delay();
            let wake_at = Instant::now() + delay;
            let failures = backoff.failures();
            self.health.send_modify(|h| {
                h.state = ConnectionState::ReconnectWait;
                h.consecutive_failures = failures;
                h.next_reconnect_at = Some(wake_at);
                h.last_backoff = Some(delay);
                h.last_error = Some(error);
            });
            debug!(%location_id, ?delay, failures, "Waiting before reconnect");

            tokio::select! {
                _ = sleep_until(wake_at) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        self.health.send_modify(|h| {
            h.state = ConnectionState::Disconnected;
            h.next_reconnect_at = None;
        });
        info!(%location_id, "Realtime client stopped");
    }

    /// Token, WebSocket upgrade and Socket.IO subscribe.
    async fn connect(&self) -> SyncResult<(WsStream, OpenPayload)> {
        let token = self.tokens.access_token().await?;
        let url = socket_url(&self.config.ws_url, self.config.location_id, &token)?;

        let mut request = url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| SyncError::ConnectionFailed("token is not a valid header value".into()))?;
        let location = HeaderValue::from_str(&self.config.location_id.to_string())
            .map_err(|_| SyncError::ConnectionFailed("invalid location header".into()))?;
        request.headers_mut().insert(header::AUTHORIZATION, bearer);
        request
            .headers_mut()
            .insert(HeaderName::from_static("locationid"), location);

        let limit = self.config.connect_timeout;
        let handshake = async {
            let (mut stream, response) = connect_async(request).await?;
            debug!(status = ?response.status(), "WebSocket handshake complete");
            let open = self.subscribe(&mut stream).await?;
            Ok::<_, SyncError>((stream, open))
        };

        match timeout(limit, handshake).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(limit.as_secs())),
        }
    }

    /// Engine.IO open, then Socket.IO namespace connect.
    async fn subscribe(&self, stream: &mut WsStream) -> SyncResult<OpenPayload> {
        let mut open: Option<OpenPayload> = None;

        while let Some(message) = stream.next().await {
            let text = match message? {
                WsMessage::Text(text) => text,
                WsMessage::Close(_) => return Err(SyncError::Disconnected),
                _ => continue,
            };

            match Frame::parse(&text)? {
                Frame::Open(payload) => {
                    debug!(sid = %payload.sid, "Engine.IO session opened");
                    stream
                        .send(WsMessage::Text(Frame::connect().encode().into()))
                        .await?;
                    open = Some(payload);
                }
                Frame::Ping(data) => {
                    stream
                        .send(WsMessage::Text(Frame::Pong(data).encode().into()))
                        .await?;
                }
                Frame::Message(Packet::Connect(_)) => {
                    return open.ok_or_else(|| {
                        SyncError::UnexpectedFrame("namespace connect before open".into())
                    });
                }
                Frame::Message(Packet::ConnectError(data)) => {
                    // Usually an expired or revoked token.
                    self.tokens.invalidate().await;
                    return Err(SyncError::ConnectionFailed(format!(
                        "subscription rejected: {}",
                        data
                    )));
                }
                Frame::Close | Frame::Message(Packet::Disconnect) => {
                    return Err(SyncError::Disconnected)
                }
                other => debug!(?other, "Ignoring frame during handshake"),
            }
        }

        Err(SyncError::Disconnected)
    }

    /// Reads frames until the connection ends or shutdown is requested.
    async fn connection_loop(
        &self,
        stream: WsStream,
        open: &OpenPayload,
        shutdown_rx: &mut mpsc::Receiver<()>,
    ) -> SyncResult<LoopExit> {
        let (mut write, mut read) = stream.split();

        // Engine.IO: no ping within interval + timeout means the link is dead.
        let liveness = (open.ping_interval > 0)
            .then(|| Duration::from_millis(open.ping_interval + open.ping_timeout));
        let mut deadline = liveness.map(|d| Instant::now() + d);

        loop {
            let dead = async {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                message = read.next() => {
                    let message = match message {
                        Some(message) => message?,
                        None => return Ok(LoopExit::Closed),
                    };

                    let now = Instant::now();
                    self.health.send_if_modified(|h| {
                        h.last_activity_at = Some(now);
                        false
                    });
                    deadline = liveness.map(|d| now + d);

                    match message {
                        WsMessage::Text(text) => match Frame::parse(&text) {
                            Ok(Frame::Ping(data)) => {
                                write.send(WsMessage::Text(Frame::Pong(data).encode().into())).await?;
                            }
                            Ok(Frame::Close) | Ok(Frame::Message(Packet::Disconnect)) => {
                                return Ok(LoopExit::Closed);
                            }
                            Ok(Frame::Message(Packet::Event { name, args })) => {
                                if !self.deliver(&name, args, shutdown_rx).await {
                                    return Ok(LoopExit::Shutdown);
                                }
                            }
                            Ok(other) => debug!(?other, "Ignoring frame"),
                            Err(e) => {
                                warn!(error = %e, "Dropping malformed frame");
                                if !self.signal(RealtimeSignal::DecodeFailed { error: e.to_string() }, shutdown_rx).await {
                                    return Ok(LoopExit::Shutdown);
                                }
                            }
                        },
                        WsMessage::Ping(data) => {
                            write.send(WsMessage::Pong(data)).await?;
                        }
                        WsMessage::Close(frame) => {
                            debug!(?frame, "Received close frame");
                            return Ok(LoopExit::Closed);
                        }
                        _ => {}
                    }
                }

                _ = dead => {
                    return Err(SyncError::Timeout(liveness.map(|d| d.as_secs()).unwrap_or_default()));
                }

                _ = shutdown_rx.recv() => {
                    info!(location_id = %self.config.location_id, "Shutdown signal received, closing connection");
                    let _ = write.send(WsMessage::Text(Frame::Message(Packet::Disconnect).encode().into())).await;
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(LoopExit::Shutdown);
                }
            }
        }
    }

    /// Decodes one Socket.IO event and hands it to the owner. Returns false
    /// once the owner is gone or shutdown was requested.
    async fn deliver(
        &self,
        name: &str,
        args: Vec<Value>,
        shutdown_rx: &mut mpsc::Receiver<()>,
    ) -> bool {
        if name != EVENT_NAME {
            debug!(name, "Ignoring Socket.IO event");
            return true;
        }

        let Some(payload) = args.into_iter().next() else {
            return self
                .signal(
                    RealtimeSignal::DecodeFailed {
                        error: "event without payload".into(),
                    },
                    shutdown_rx,
                )
                .await;
        };

        match RealtimeEvent::from_value(payload) {
            Ok(event) => {
                let received_at = Utc::now();
                self.health.send_if_modified(|h| {
                    h.last_event_at = Some(received_at);
                    false
                });
                debug!(event_type = event.type_name(), "Received event");
                self.signal(RealtimeSignal::Event { event, received_at }, shutdown_rx)
                    .await
            }
            Err(e) => {
                warn!(error = %e, "Dropping undecodable event");
                self.signal(RealtimeSignal::DecodeFailed { error: e.to_string() }, shutdown_rx)
                    .await
            }
        }
    }

    /// Sends one signal to the owner. A full channel must not keep the
    /// worker from seeing shutdown, so the send races the shutdown channel.
    async fn signal(&self, signal: RealtimeSignal, shutdown_rx: &mut mpsc::Receiver<()>) -> bool {
        tokio::select! {
            sent = self.signals.send(signal) => {
                if sent.is_err() {
                    debug!(location_id = %self.config.location_id, "Signal receiver dropped");
                    return false;
                }
                true
            }
            _ = shutdown_rx.recv() => {
                debug!(location_id = %self.config.location_id, "Shutdown while delivering signal");
                false
            }
        }
    }
}
