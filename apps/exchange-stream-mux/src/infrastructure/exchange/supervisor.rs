//! Connection Supervisor
//!
//! Owns one logical channel's socket: connects (with a fresh bearer token on
//! the private channel), reconnects with backoff, drains inbound frames into
//! the component registry, and keeps the server-side subscription in step with
//! the ledger.
//!
//! # State Machine
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> CONNECTED -> DISCONNECTED -> CONNECTING ...
//!                     |                                          |
//!                     +------- retry budget exhausted -------> ERROR
//! ```
//!
//! ERROR is left only through [`ConnectionSupervisor::restart`].
//!
//! # Tasks
//!
//! Each supervisor runs two tasks: [`run_connection`](ConnectionSupervisor::run_connection)
//! (connect, read loop, backoff) and [`run_reconciler`](ConnectionSupervisor::run_reconciler)
//! (one subscription frame in flight at a time, coalescing changes that
//! arrive meanwhile). The health monitor calls
//! [`check_health`](ConnectionSupervisor::check_health) periodically.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;

use super::auth::{self, AuthError};
use super::codec::{AdminResponse, CodecError, Inbound, ProtocolCodec};
use super::heartbeat::{HeartbeatConfig, HeartbeatState};
use super::rate_gate::{GateAction, RateGate, RateGateError};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{
    CredentialProvider, Frame, FrameSink, FrameStream, Transport, TransportConnection,
    TransportError,
};
use crate::application::services::ComponentRegistry;
use crate::domain::streaming::{LogicalChannel, StreamEvent};
use crate::domain::subscription::SubscriptionLedger;
use crate::infrastructure::metrics::{self, ReconcileOutcome};

// =============================================================================
// Error Types
// =============================================================================

/// A reconciliation pass that did not reach the wire.
#[derive(Debug, thiserror::Error)]
pub enum ReconciliationError {
    /// Frame could not be composed.
    #[error("failed to compose subscription frame: {0}")]
    Codec(#[from] CodecError),

    /// No send quota.
    #[error("send quota unavailable: {0}")]
    RateGate(#[from] RateGateError),

    /// Socket write failed.
    #[error("failed to send subscription frame: {0}")]
    Transport(#[from] TransportError),
}

/// Errors from the `LIST_SUBSCRIPTIONS` round-trip.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// Channel has no open socket.
    #[error("channel is not connected")]
    NotConnected,

    /// No reply before the deadline.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The connection went away before a reply arrived.
    #[error("connection dropped before reply")]
    Dropped,

    /// Request could not be composed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// No send quota.
    #[error(transparent)]
    RateGate(#[from] RateGateError),

    /// Socket write failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// =============================================================================
// State
// =============================================================================

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No socket.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Socket open.
    Connected,
    /// Retry budget exhausted; waiting for a restart.
    Error,
}

impl ConnectionState {
    /// Uppercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-channel connection record. Only the owning supervisor writes it.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    /// Channel this record describes.
    pub channel: LogicalChannel,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Whether a socket is currently held.
    pub has_socket: bool,
    /// When the current socket opened.
    pub connected_at: Option<DateTime<Utc>>,
    /// Arrival time of the last inbound frame.
    pub last_inbound_at: Option<DateTime<Utc>>,
    /// Failures since the last successful connection.
    pub consecutive_errors: u32,
    /// Most recent failure.
    pub last_error: Option<String>,
    /// Parked waiting for a usable credential.
    pub credential_blocked: bool,
}

impl ConnectionRecord {
    const fn new(channel: LogicalChannel) -> Self {
        Self {
            channel,
            state: ConnectionState::Disconnected,
            has_socket: false,
            connected_at: None,
            last_inbound_at: None,
            consecutive_errors: 0,
            last_error: None,
            credential_blocked: false,
        }
    }
}

/// Snapshot for the operational query.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    /// Channel.
    pub channel: LogicalChannel,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Seconds since the current socket opened.
    pub uptime_secs: Option<i64>,
    /// Data events received.
    pub messages_received: u64,
    /// Inbound frames dropped by the codec.
    pub protocol_errors: u64,
    /// Reconnect attempts scheduled.
    pub reconnects: u64,
    /// Subscription frames confirmed sent.
    pub reconciliations_sent: u64,
    /// Failed reconciliation passes.
    pub reconciliation_failures: u64,
    /// Kinds with at least one live owner.
    pub active_subscriptions: usize,
    /// Failures since the last successful connection.
    pub consecutive_errors: u32,
    /// Most recent failure.
    pub last_error: Option<String>,
    /// Parked waiting for a credential.
    pub credential_blocked: bool,
    /// Arrival time of the last inbound frame.
    pub last_inbound_at: Option<DateTime<Utc>>,
    /// 0 (down) to 1 (healthy).
    pub health_score: f64,
}

/// How a connected session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionEnd {
    /// Shutdown.
    Cancelled,
    /// Health check or restart asked for a fresh socket.
    Requested,
    /// Exchange rejected the credential mid-session.
    AuthRejected,
    /// Peer closed the socket or the read failed.
    Lost(String),
}

#[derive(Debug, Default)]
struct Counters {
    messages_received: AtomicU64,
    protocol_errors: AtomicU64,
    reconnects: AtomicU64,
    reconciliations_sent: AtomicU64,
    reconciliation_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Per-supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// WebSocket endpoint.
    pub url: String,
    /// Prefix for the subscription ticket.
    pub ticket_prefix: String,
    /// Backoff and retry budget.
    pub reconnect: ReconnectConfig,
    /// Health check thresholds.
    pub heartbeat: HeartbeatConfig,
    /// Delay before retrying a failed reconciliation pass.
    pub reconcile_retry: Duration,
}

/// Shared collaborators handed to each supervisor.
#[derive(Clone)]
pub struct SupervisorDeps {
    /// Socket factory.
    pub transport: Arc<dyn Transport>,
    /// Token source for the private channel.
    pub credentials: Arc<dyn CredentialProvider>,
    /// Shared connect/send quota.
    pub gate: RateGate,
    /// Desired subscriptions.
    pub ledger: Arc<SubscriptionLedger>,
    /// Event consumers.
    pub registry: Arc<ComponentRegistry>,
    /// Wire codec.
    pub codec: ProtocolCodec,
}

// =============================================================================
// Supervisor
// =============================================================================

/// Supervises one logical channel.
pub struct ConnectionSupervisor {
    channel: LogicalChannel,
    settings: SupervisorSettings,
    deps: SupervisorDeps,
    ticket: String,
    record: RwLock<ConnectionRecord>,
    sink: tokio::sync::Mutex<Option<Box<dyn FrameSink>>>,
    activity: HeartbeatState,
    session: Mutex<Option<CancellationToken>>,
    admin_waiters: Mutex<Vec<oneshot::Sender<AdminResponse>>>,
    counters: Counters,
    reconcile: Notify,
    wake: Notify,
    restart: Notify,
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("channel", &self.channel)
            .field("ticket", &self.ticket)
            .field("record", &*self.record.read())
            .finish_non_exhaustive()
    }
}

impl ConnectionSupervisor {
    /// Create a supervisor. Nothing runs until its tasks are spawned.
    #[must_use]
    pub fn new(channel: LogicalChannel, settings: SupervisorSettings, deps: SupervisorDeps) -> Self {
        let ticket = format!(
            "{}-{}-{}",
            settings.ticket_prefix,
            channel,
            uuid::Uuid::new_v4().simple()
        );
        Self {
            channel,
            settings,
            deps,
            ticket,
            record: RwLock::new(ConnectionRecord::new(channel)),
            sink: tokio::sync::Mutex::new(None),
            activity: HeartbeatState::new(),
            session: Mutex::new(None),
            admin_waiters: Mutex::new(Vec::new()),
            counters: Counters::default(),
            reconcile: Notify::new(),
            wake: Notify::new(),
            restart: Notify::new(),
        }
    }

    /// Channel this supervisor owns.
    #[must_use]
    pub const fn channel(&self) -> LogicalChannel {
        self.channel
    }

    /// Ticket sent with every outbound request.
    #[must_use]
    pub fn ticket(&self) -> &str {
        &self.ticket
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.record.read().state
    }

    /// Copy of the connection record.
    #[must_use]
    pub fn record(&self) -> ConnectionRecord {
        self.record.read().clone()
    }

    /// Ask the reconciler for a pass. Repeated calls before it runs coalesce.
    pub fn notify_changed(&self) {
        self.reconcile.notify_one();
    }

    /// Drop the current socket; the connection task reconnects without
    /// backoff.
    pub fn request_reconnect(&self) {
        if let Some(token) = self.session.lock().as_ref() {
            token.cancel();
        }
    }

    /// Leave ERROR with a fresh retry budget, unpark a credential-blocked
    /// channel, or cycle an open socket.
    pub fn restart(&self) {
        let record = self.record();
        match record.state {
            ConnectionState::Error => {
                tracing::info!(channel = %self.channel, "Restarting channel from ERROR");
                self.restart.notify_one();
            }
            ConnectionState::Disconnected if record.credential_blocked => {
                self.wake.notify_one();
            }
            _ => self.request_reconnect(),
        }
    }

    // =========================================================================
    // Connection Task
    // =========================================================================

    /// Connect, serve, and reconnect until cancelled.
    pub async fn run_connection(self: Arc<Self>, cancel: CancellationToken) {
        let mut policy = ReconnectPolicy::new(self.settings.reconnect.clone());

        while !cancel.is_cancelled() {
            let headers = if self.channel.requires_auth() {
                match auth::fresh_headers(self.deps.credentials.as_ref()).await {
                    Ok(headers) => headers,
                    Err(e) => {
                        self.park(&e);
                        if !wait_or_cancel(&self.wake, &cancel).await {
                            break;
                        }
                        continue;
                    }
                }
            } else {
                Vec::new()
            };

            self.update(|r| {
                r.state = ConnectionState::Connecting;
                r.credential_blocked = false;
            });

            let permit = match self.deps.gate.acquire(GateAction::Connect).await {
                Ok(permit) => permit,
                Err(RateGateError::Closed) => break,
                Err(e) => {
                    // Quota exhaustion is not a connection failure.
                    tracing::warn!(channel = %self.channel, error = %e, "Connect deferred");
                    if !sleep_or_cancel(self.settings.reconnect.initial_delay, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            tracing::info!(
                channel = %self.channel,
                url = %self.settings.url,
                attempt = policy.attempt_count() + 1,
                "Connecting"
            );

            let connected = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = self.deps.transport.connect(&self.settings.url, &headers) => result,
            };

            let failure = match connected {
                Ok(connection) => {
                    permit.commit();
                    policy.reset();
                    match self.serve(connection, &cancel).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Requested => continue,
                        SessionEnd::AuthRejected => {
                            if !self.refresh_or_park(&cancel).await {
                                break;
                            }
                            continue;
                        }
                        SessionEnd::Lost(reason) => reason,
                    }
                }
                Err(e) => {
                    // A failed handshake leaves the connect quota untouched.
                    drop(permit);
                    if e == TransportError::Unauthorized
                        && self.channel.requires_auth()
                        && !self.refresh_or_park(&cancel).await
                    {
                        break;
                    }
                    e.to_string()
                }
            };

            self.update(|r| {
                r.state = ConnectionState::Disconnected;
                r.consecutive_errors = r.consecutive_errors.saturating_add(1);
                r.last_error = Some(failure.clone());
            });

            if let Some(delay) = policy.record_failure() {
                Counters::bump(&self.counters.reconnects);
                metrics::record_reconnect(self.channel);
                tracing::info!(
                    channel = %self.channel,
                    attempt = policy.attempt_count(),
                    delay_ms = delay.as_millis(),
                    error = %failure,
                    "Reconnecting"
                );
                if !sleep_or_cancel(delay, &cancel).await {
                    break;
                }
            } else {
                tracing::error!(
                    channel = %self.channel,
                    attempts = policy.attempt_count(),
                    error = %failure,
                    "Retry budget exhausted"
                );
                self.update(|r| r.state = ConnectionState::Error);
                if !wait_or_cancel(&self.restart, &cancel).await {
                    break;
                }
                policy.reset();
            }
        }

        if self.state() != ConnectionState::Error {
            self.update(|r| r.state = ConnectionState::Disconnected);
        }
        tracing::debug!(channel = %self.channel, "Connection task stopped");
    }

    async fn serve(&self, connection: TransportConnection, cancel: &CancellationToken) -> SessionEnd {
        let session = cancel.child_token();
        *self.session.lock() = Some(session.clone());

        self.on_connected(connection.sink).await;
        let end = self.read_loop(connection.stream, cancel, &session).await;

        *self.session.lock() = None;
        self.on_disconnected(&end).await;
        end
    }

    async fn on_connected(&self, sink: Box<dyn FrameSink>) {
        *self.sink.lock().await = Some(sink);
        self.activity.reset();
        self.update(|r| {
            r.state = ConnectionState::Connected;
            r.has_socket = true;
            r.connected_at = Some(Utc::now());
            r.consecutive_errors = 0;
            r.last_error = None;
        });
        tracing::info!(channel = %self.channel, "Connected");

        // A new socket has no subscriptions yet.
        if !self.deps.ledger.reset_baseline(self.channel) {
            tracing::debug!(channel = %self.channel, "Nothing to subscribe on new socket");
        }
    }

    async fn on_disconnected(&self, end: &SessionEnd) {
        self.update(|r| {
            r.state = ConnectionState::Disconnected;
            r.has_socket = false;
            r.connected_at = None;
        });

        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink
            && let Err(e) = sink.close().await
        {
            tracing::debug!(channel = %self.channel, error = %e, "Close failed");
        }

        // Pending queries resolve as dropped.
        self.admin_waiters.lock().clear();

        tracing::info!(channel = %self.channel, reason = ?end, "Disconnected");
    }

    async fn read_loop(
        &self,
        mut stream: Box<dyn FrameStream>,
        cancel: &CancellationToken,
        session: &CancellationToken,
    ) -> SessionEnd {
        loop {
            let frame = tokio::select! {
                biased;
                () = cancel.cancelled() => return SessionEnd::Cancelled,
                () = session.cancelled() => return SessionEnd::Requested,
                frame = stream.next_frame() => frame,
            };

            match frame {
                Some(Ok(Frame::Text(text))) => {
                    self.activity.record_inbound();
                    self.record.write().last_inbound_at = Some(Utc::now());
                    if let Some(end) = self.handle_text(&text) {
                        return end;
                    }
                }
                Some(Ok(Frame::Pong)) => self.activity.record_pong(),
                Some(Ok(Frame::Closed)) | None => {
                    return SessionEnd::Lost("closed by peer".to_string());
                }
                Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
            }
        }
    }

    fn handle_text(&self, text: &str) -> Option<SessionEnd> {
        match self.deps.codec.decode(text) {
            Ok(Inbound::Event(payload)) => {
                let event = StreamEvent::new(payload, Utc::now());
                Counters::bump(&self.counters.messages_received);
                metrics::record_frame_received(self.channel, event.kind);
                self.deps.registry.dispatch(&event);
                None
            }
            Ok(Inbound::Admin(response)) => {
                let waiters = std::mem::take(&mut *self.admin_waiters.lock());
                tracing::debug!(
                    channel = %self.channel,
                    method = %response.method,
                    waiters = waiters.len(),
                    "Admin response"
                );
                for waiter in waiters {
                    let _ = waiter.send(response.clone());
                }
                None
            }
            Ok(Inbound::KeepAlive) => {
                self.activity.record_pong();
                None
            }
            Err(e) => {
                Counters::bump(&self.counters.protocol_errors);
                metrics::record_protocol_error(self.channel, e.label());

                if self.channel.requires_auth() && e.is_auth_fault() {
                    tracing::warn!(channel = %self.channel, error = %e, "Credential rejected");
                    return Some(SessionEnd::AuthRejected);
                }

                if matches!(e, CodecError::UnknownKind(_)) {
                    tracing::debug!(channel = %self.channel, error = %e, "Dropped frame");
                } else {
                    tracing::warn!(channel = %self.channel, error = %e, "Dropped frame");
                    self.record.write().last_error = Some(e.to_string());
                }
                None
            }
        }
    }

    /// Returns false if cancelled while parked.
    async fn refresh_or_park(&self, cancel: &CancellationToken) -> bool {
        if self.deps.credentials.force_refresh().await {
            tracing::info!(channel = %self.channel, "Credential refreshed");
            return true;
        }
        self.park(&AuthError::Rejected);
        wait_or_cancel(&self.wake, cancel).await
    }

    fn park(&self, reason: &AuthError) {
        tracing::info!(
            channel = %self.channel,
            reason = reason.as_str(),
            "Channel parked until a credential is available"
        );
        self.update(|r| {
            r.state = ConnectionState::Disconnected;
            r.credential_blocked = true;
            r.last_error = Some(reason.to_string());
        });
    }

    // =========================================================================
    // Reconciliation Task
    // =========================================================================

    /// Run reconciliation passes on demand until cancelled.
    ///
    /// A failed pass is retried after `reconcile_retry`, never immediately.
    pub async fn run_reconciler(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = self.reconcile.notified() => {}
            }

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = self.reconcile_once() => result,
            };

            if let Err(e) = result {
                Counters::bump(&self.counters.reconciliation_failures);
                metrics::record_reconciliation(self.channel, ReconcileOutcome::Failed);
                tracing::warn!(
                    channel = %self.channel,
                    error = %e,
                    retry_ms = self.settings.reconcile_retry.as_millis(),
                    "Reconciliation failed"
                );
                if !sleep_or_cancel(self.settings.reconcile_retry, &cancel).await {
                    break;
                }
                self.reconcile.notify_one();
            }
        }
        tracing::debug!(channel = %self.channel, "Reconciler stopped");
    }

    /// One pass: send the live set if it diverges from what the socket has.
    ///
    /// Does nothing while disconnected; the baseline reset on connect
    /// schedules a pass.
    ///
    /// # Errors
    ///
    /// Returns `ReconciliationError` if the frame could not be composed or
    /// sent. Pending snapshots go back to the ledger.
    pub async fn reconcile_once(&self) -> Result<(), ReconciliationError> {
        if self.state() != ConnectionState::Connected {
            return Ok(());
        }
        let ledger = &self.deps.ledger;
        let Some(plan) = ledger.plan(self.channel) else {
            return Ok(());
        };

        if plan.is_empty() {
            ledger.commit(&plan);
            metrics::record_reconciliation(self.channel, ReconcileOutcome::Withdrawn);
            metrics::set_subscriptions(self.channel, 0);
            tracing::debug!(channel = %self.channel, "All streams withdrawn");
            return Ok(());
        }

        for (kind, diff) in ledger.classify(self.channel) {
            tracing::debug!(
                channel = %self.channel,
                kind = %kind,
                existing = diff.existing.len(),
                added = diff.added.len(),
                withdrawn = diff.withdrawn.len(),
                "Reconciling"
            );
        }

        let streams = plan.streams();
        let text = match self.deps.codec.encode(&self.ticket, &streams) {
            Ok(text) => text,
            Err(e) => {
                ledger.abandon(plan);
                return Err(e.into());
            }
        };

        let permit = match self.deps.gate.acquire(GateAction::Send).await {
            Ok(permit) => permit,
            Err(e) => {
                ledger.abandon(plan);
                return Err(e.into());
            }
        };

        match self.send_text(text).await {
            Ok(()) => {
                permit.commit();
                ledger.commit(&plan);
                Counters::bump(&self.counters.reconciliations_sent);
                metrics::record_reconciliation(self.channel, ReconcileOutcome::Sent);
                metrics::set_subscriptions(self.channel, ledger.active_count(self.channel));
                tracing::info!(
                    channel = %self.channel,
                    kinds = streams.len(),
                    "Subscription frame sent"
                );
                Ok(())
            }
            Err(e) => {
                drop(permit);
                ledger.abandon(plan);
                if e != TransportError::Closed {
                    self.request_reconnect();
                }
                Err(e.into())
            }
        }
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::Closed)?;
        sink.send(text).await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Ask the exchange which subscriptions this socket holds.
    ///
    /// # Errors
    ///
    /// Returns `QueryError` if the channel is down, the request cannot be
    /// sent, or no reply arrives within `timeout`.
    pub async fn list_subscriptions(&self, timeout: Duration) -> Result<AdminResponse, QueryError> {
        if self.state() != ConnectionState::Connected {
            return Err(QueryError::NotConnected);
        }

        let text = self.deps.codec.encode_list_subscriptions(&self.ticket)?;
        let permit = self.deps.gate.acquire(GateAction::Send).await?;

        // Registered before sending so a fast reply cannot be missed.
        let (tx, rx) = oneshot::channel();
        self.admin_waiters.lock().push(tx);

        if let Err(e) = self.send_text(text).await {
            drop((permit, rx));
            self.prune_waiters();
            return Err(match e {
                TransportError::Closed => QueryError::NotConnected,
                e => e.into(),
            });
        }
        permit.commit();

        let result = tokio::time::timeout(timeout, rx).await;
        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(QueryError::Dropped),
            Err(_) => {
                self.prune_waiters();
                Err(QueryError::Timeout(timeout))
            }
        }
    }

    /// Drop waiters whose caller has gone away.
    fn prune_waiters(&self) {
        self.admin_waiters.lock().retain(|waiter| !waiter.is_closed());
    }

    /// Operational snapshot.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        let record = self.record();
        let active_subscriptions = self.deps.ledger.active_count(self.channel);
        let messages_received = Counters::get(&self.counters.messages_received);
        let protocol_errors = Counters::get(&self.counters.protocol_errors);

        let health_score = match record.state {
            ConnectionState::Connected => {
                let staleness = if active_subscriptions == 0 {
                    0.0
                } else {
                    ratio(
                        self.activity.time_since_inbound().as_secs_f64(),
                        self.settings.heartbeat.stale_after.as_secs_f64(),
                    )
                };
                #[allow(clippy::cast_precision_loss)]
                let errors = ratio(
                    protocol_errors as f64,
                    (messages_received + protocol_errors) as f64,
                );
                health_score(staleness, errors)
            }
            ConnectionState::Connecting => 0.25,
            ConnectionState::Disconnected | ConnectionState::Error => 0.0,
        };

        ChannelStatus {
            channel: self.channel,
            state: record.state,
            uptime_secs: record
                .connected_at
                .map(|at| (Utc::now() - at).num_seconds()),
            messages_received,
            protocol_errors,
            reconnects: Counters::get(&self.counters.reconnects),
            reconciliations_sent: Counters::get(&self.counters.reconciliations_sent),
            reconciliation_failures: Counters::get(&self.counters.reconciliation_failures),
            active_subscriptions,
            consecutive_errors: record.consecutive_errors,
            last_error: record.last_error,
            credential_blocked: record.credential_blocked,
            last_inbound_at: record.last_inbound_at,
            health_score,
        }
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// One health check, called by the monitor.
    ///
    /// Idle sockets are probed with a ping; sockets carrying subscriptions
    /// must have received something within `stale_after`. A parked private
    /// channel is woken once a token is available.
    pub async fn check_health(&self) {
        let record = self.record();
        match record.state {
            ConnectionState::Error | ConnectionState::Connecting => return,
            ConnectionState::Disconnected => {
                if record.credential_blocked
                    && self.deps.credentials.get_valid_token().await.is_some()
                {
                    tracing::info!(channel = %self.channel, "Credential available; waking channel");
                    self.wake.notify_one();
                }
                return;
            }
            ConnectionState::Connected => {}
        }

        if self.channel.requires_auth() && self.deps.credentials.get_valid_token().await.is_none() {
            tracing::warn!(channel = %self.channel, "Credential lost; closing channel");
            self.request_reconnect();
            return;
        }

        if self.deps.ledger.active_count(self.channel) == 0 {
            if !self.probe().await {
                tracing::warn!(channel = %self.channel, "Ping unanswered; reconnecting");
                self.request_reconnect();
            }
            return;
        }

        let silent = self.activity.time_since_inbound();
        if silent > self.settings.heartbeat.stale_after {
            tracing::warn!(
                channel = %self.channel,
                silent_ms = silent.as_millis(),
                "No inbound data; reconnecting"
            );
            self.request_reconnect();
        }
    }

    async fn probe(&self) -> bool {
        let pong = self.activity.pong_received();
        tokio::pin!(pong);
        pong.as_mut().enable();

        {
            let mut guard = self.sink.lock().await;
            let Some(sink) = guard.as_mut() else {
                return false;
            };
            if let Err(e) = sink.ping().await {
                tracing::debug!(channel = %self.channel, error = %e, "Ping failed");
                return false;
            }
        }
        self.activity.mark_ping_sent();

        tokio::time::timeout(self.settings.heartbeat.pong_timeout, pong)
            .await
            .is_ok()
    }

    fn update(&self, f: impl FnOnce(&mut ConnectionRecord)) {
        let (before, after) = {
            let mut record = self.record.write();
            let before = record.state;
            f(&mut record);
            (before, record.state)
        };
        if before != after {
            metrics::set_connection_state(self.channel, after);
            tracing::debug!(channel = %self.channel, from = %before, to = %after, "State change");
        }
    }
}

/// Returns false if cancelled first.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

/// Returns false if cancelled first.
async fn wait_or_cancel(notify: &Notify, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = notify.notified() => true,
    }
}

fn ratio(part: f64, whole: f64) -> f64 {
    if whole <= 0.0 {
        0.0
    } else {
        (part / whole).clamp(0.0, 1.0)
    }
}

fn health_score(staleness: f64, error_ratio: f64) -> f64 {
    0.3f64.mul_add(-error_ratio, 0.5f64.mul_add(-staleness, 1.0)).clamp(0.0, 1.0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{BearerToken, MockCredentialProvider};
    use crate::domain::streaming::{ComponentId, DataKind};
    use crate::infrastructure::exchange::auth::StaticCredentials;
    use crate::infrastructure::exchange::codec::WireFormat;
    use crate::infrastructure::exchange::rate_gate::RateGateConfig;
    use crate::infrastructure::transport::MockTransport;

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            url: "wss://mock/websocket/v1".to_string(),
            ticket_prefix: "test".to_string(),
            reconnect: ReconnectConfig::new(
                Duration::from_secs(1),
                Duration::from_secs(30),
                2.0,
                0.0,
                5,
            ),
            heartbeat: HeartbeatConfig::default(),
            reconcile_retry: Duration::from_secs(1),
        }
    }

    fn supervisor(
        channel: LogicalChannel,
        transport: &MockTransport,
        credentials: Arc<dyn CredentialProvider>,
    ) -> (Arc<ConnectionSupervisor>, Arc<SubscriptionLedger>) {
        let ledger = Arc::new(SubscriptionLedger::new());
        let deps = SupervisorDeps {
            transport: Arc::new(transport.clone()),
            credentials,
            gate: RateGate::new(RateGateConfig::default()),
            ledger: Arc::clone(&ledger),
            registry: Arc::new(ComponentRegistry::new()),
            codec: ProtocolCodec::new(WireFormat::Default),
        };
        let sup = Arc::new(ConnectionSupervisor::new(channel, settings(), deps));
        let weak = Arc::downgrade(&sup);
        ledger.set_listener(Arc::new(move |_| {
            if let Some(sup) = weak.upgrade() {
                sup.notify_changed();
            }
        }));
        (sup, ledger)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn health_score_bounds() {
        assert!((health_score(0.0, 0.0) - 1.0).abs() < f64::EPSILON);
        assert!((health_score(1.0, 1.0) - 0.2).abs() < 1e-9);
        assert!((health_score(1.0, 0.0) - 0.5).abs() < 1e-9);
        assert!(ratio(5.0, 0.0).abs() < f64::EPSILON);
        assert!((ratio(10.0, 5.0) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ticket_carries_prefix_and_channel() {
        let transport = MockTransport::new();
        let (sup, _) = supervisor(
            LogicalChannel::Public,
            &transport,
            Arc::new(StaticCredentials::new(None)),
        );
        assert!(sup.ticket().starts_with("test-public-"));
        assert_eq!(sup.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_sends_live_set() {
        let transport = MockTransport::new();
        let (sup, ledger) = supervisor(
            LogicalChannel::Public,
            &transport,
            Arc::new(StaticCredentials::new(None)),
        );
        ledger.register(&ComponentId::new("a"), DataKind::Ticker, ["KRW-BTC"]);

        let cancel = CancellationToken::new();
        let conn = tokio::spawn(Arc::clone(&sup).run_connection(cancel.clone()));
        let rec = tokio::spawn(Arc::clone(&sup).run_reconciler(cancel.clone()));

        transport.wait_for_sends(1).await;
        assert_eq!(sup.state(), ConnectionState::Connected);

        let sent: serde_json::Value = serde_json::from_str(&transport.sent()[0]).unwrap();
        assert_eq!(sent[1]["type"], "ticker");
        assert_eq!(sent[1]["codes"], serde_json::json!(["KRW-BTC"]));
        assert_eq!(sup.status().reconciliations_sent, 1);

        cancel.cancel();
        conn.await.unwrap();
        rec.await.unwrap();
        assert_eq!(sup.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_enters_error_until_restart() {
        let transport = MockTransport::new();
        for _ in 0..5 {
            transport.fail_next_connect(TransportError::Connect("refused".into()));
        }
        let (sup, _) = supervisor(
            LogicalChannel::Public,
            &transport,
            Arc::new(StaticCredentials::new(None)),
        );

        let cancel = CancellationToken::new();
        let conn = tokio::spawn(Arc::clone(&sup).run_connection(cancel.clone()));

        // Delays 1 + 2 + 4 + 8 seconds between the five attempts.
        tokio::time::sleep(Duration::from_secs(16)).await;
        settle().await;
        assert_eq!(sup.state(), ConnectionState::Error);
        assert_eq!(transport.connect_attempts().len(), 5);
        assert_eq!(sup.status().reconnects, 4);

        sup.restart();
        transport.wait_for_connections(1).await;
        settle().await;
        assert_eq!(sup.state(), ConnectionState::Connected);

        cancel.cancel();
        conn.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn private_channel_parks_without_token() {
        let transport = MockTransport::new();
        let credentials = Arc::new(StaticCredentials::new(None));
        let (sup, _) = supervisor(LogicalChannel::Private, &transport, credentials.clone());

        let cancel = CancellationToken::new();
        let conn = tokio::spawn(Arc::clone(&sup).run_connection(cancel.clone()));
        settle().await;

        assert!(sup.record().credential_blocked);
        assert!(transport.connect_attempts().is_empty());

        credentials.set(BearerToken::new("tok"));
        sup.check_health().await;
        transport.wait_for_connections(1).await;

        let attempt = &transport.connect_attempts()[0];
        assert!(
            attempt
                .headers
                .contains(&("Authorization".to_string(), "Bearer tok".to_string()))
        );

        cancel.cancel();
        conn.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_and_admin_replies() {
        let transport = MockTransport::new();
        let (sup, _) = supervisor(
            LogicalChannel::Public,
            &transport,
            Arc::new(StaticCredentials::new(None)),
        );
        let cancel = CancellationToken::new();
        let conn = tokio::spawn(Arc::clone(&sup).run_connection(cancel.clone()));
        transport.wait_for_connections(1).await;
        settle().await;

        let query = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.list_subscriptions(Duration::from_secs(5)).await })
        };
        transport.wait_for_sends(1).await;
        assert!(transport.sent()[0].contains("LIST_SUBSCRIPTIONS"));

        transport.push_inbound(
            r#"{"method":"LIST_SUBSCRIPTIONS","result":[{"type":"ticker","codes":["KRW-BTC"]}]}"#,
        );
        let response = query.await.unwrap().unwrap();
        assert_eq!(response.result[0].codes, vec!["KRW-BTC".to_string()]);

        transport.push_inbound(r#"{"status":"UP"}"#);
        transport.push_inbound("not json");
        settle().await;
        assert_eq!(sup.status().protocol_errors, 1);
        assert_eq!(sup.state(), ConnectionState::Connected);

        cancel.cancel();
        conn.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_socket_without_pong_is_replaced() {
        let transport = MockTransport::new();
        transport.set_auto_pong(false);
        let (sup, _) = supervisor(
            LogicalChannel::Public,
            &transport,
            Arc::new(StaticCredentials::new(None)),
        );
        let cancel = CancellationToken::new();
        let conn = tokio::spawn(Arc::clone(&sup).run_connection(cancel.clone()));
        transport.wait_for_connections(1).await;
        settle().await;

        sup.check_health().await;
        transport.wait_for_connections(2).await;
        assert_eq!(transport.ping_count(), 1);

        cancel.cancel();
        conn.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn query_fails_fast_when_disconnected() {
        let transport = MockTransport::new();
        let (sup, _) = supervisor(
            LogicalChannel::Public,
            &transport,
            Arc::new(StaticCredentials::new(None)),
        );
        assert!(matches!(
            sup.list_subscriptions(Duration::from_secs(1)).await,
            Err(QueryError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_handshake_leaves_connect_quota_untouched() {
        let transport = MockTransport::new();
        transport.fail_next_connect(TransportError::Connect("refused".into()));
        let (sup, _) = supervisor(
            LogicalChannel::Public,
            &transport,
            Arc::new(StaticCredentials::new(None)),
        );
        let gate = sup.deps.gate.clone();

        let cancel = CancellationToken::new();
        let conn = tokio::spawn(Arc::clone(&sup).run_connection(cancel.clone()));
        settle().await;

        assert_eq!(transport.connect_attempts().len(), 1);
        assert_eq!(gate.committed_in_window(GateAction::Connect), 0);
        assert_eq!(gate.stats().released, 1);

        // The retry after backoff succeeds and is counted.
        transport.wait_for_connections(1).await;
        settle().await;
        assert_eq!(gate.committed_in_window(GateAction::Connect), 1);

        cancel.cancel();
        conn.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_subscribed_socket_is_replaced() {
        let transport = MockTransport::new();
        let (sup, ledger) = supervisor(
            LogicalChannel::Public,
            &transport,
            Arc::new(StaticCredentials::new(None)),
        );
        ledger.register(&ComponentId::new("a"), DataKind::Ticker, ["KRW-BTC"]);

        let cancel = CancellationToken::new();
        let conn = tokio::spawn(Arc::clone(&sup).run_connection(cancel.clone()));
        let rec = tokio::spawn(Arc::clone(&sup).run_reconciler(cancel.clone()));
        transport.wait_for_sends(1).await;

        // Within stale_after nothing happens.
        tokio::time::sleep(Duration::from_secs(30)).await;
        sup.check_health().await;
        settle().await;
        assert_eq!(transport.connection_count(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        sup.check_health().await;
        transport.wait_for_connections(2).await;
        transport.wait_for_sends(2).await;

        // Subscribed sockets are judged by inbound data, not pings.
        assert_eq!(transport.ping_count(), 0);
        let sent = transport.sent();
        assert_eq!(sent[0], sent[1]);
        assert_eq!(sup.state(), ConnectionState::Connected);

        cancel.cancel();
        conn.await.unwrap();
        rec.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn private_channel_closes_when_token_disappears() {
        let transport = MockTransport::new();
        let credentials = Arc::new(StaticCredentials::new(Some(BearerToken::new("tok"))));
        let (sup, _) = supervisor(LogicalChannel::Private, &transport, credentials.clone());

        let cancel = CancellationToken::new();
        let conn = tokio::spawn(Arc::clone(&sup).run_connection(cancel.clone()));
        transport.wait_for_connections(1).await;
        settle().await;
        assert_eq!(sup.state(), ConnectionState::Connected);

        credentials.clear();
        sup.check_health().await;
        settle().await;

        let record = sup.record();
        assert_eq!(record.state, ConnectionState::Disconnected);
        assert!(record.credential_blocked);
        assert!(!record.has_socket);
        assert_eq!(transport.connect_attempts().len(), 1);

        cancel.cancel();
        conn.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn auth_error_frame_parks_when_refresh_fails() {
        let transport = MockTransport::new();
        let mut credentials = MockCredentialProvider::new();
        credentials
            .expect_get_valid_token()
            .returning(|| Some(BearerToken::new("tok")));
        credentials.expect_force_refresh().times(1).returning(|| false);
        let (sup, _) = supervisor(LogicalChannel::Private, &transport, Arc::new(credentials));

        let cancel = CancellationToken::new();
        let conn = tokio::spawn(Arc::clone(&sup).run_connection(cancel.clone()));
        transport.wait_for_connections(1).await;
        settle().await;

        assert!(transport.push_inbound(
            r#"{"error":{"name":"INVALID_AUTH","message":"bad token"}}"#
        ));
        settle().await;

        let record = sup.record();
        assert_eq!(record.state, ConnectionState::Disconnected);
        assert!(record.credential_blocked);
        assert_eq!(sup.status().protocol_errors, 1);

        // Parked: no reconnect however long we wait.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.connect_attempts().len(), 1);

        cancel.cancel();
        conn.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_handshake_retries_with_refreshed_token() {
        let transport = MockTransport::new();
        transport.fail_next_connect(TransportError::Unauthorized);
        let mut credentials = MockCredentialProvider::new();
        let mut minted = 0;
        credentials.expect_get_valid_token().returning(move || {
            minted += 1;
            Some(BearerToken::new(format!("t{minted}")))
        });
        credentials.expect_force_refresh().times(1).returning(|| true);
        let (sup, _) = supervisor(LogicalChannel::Private, &transport, Arc::new(credentials));

        let cancel = CancellationToken::new();
        let conn = tokio::spawn(Arc::clone(&sup).run_connection(cancel.clone()));
        transport.wait_for_connections(1).await;
        settle().await;

        let attempts = transport.connect_attempts();
        assert_eq!(attempts.len(), 2);
        assert!(
            attempts[1]
                .headers
                .contains(&("Authorization".to_string(), "Bearer t2".to_string()))
        );
        assert!(!sup.record().credential_blocked);
        assert_eq!(sup.state(), ConnectionState::Connected);
        assert_eq!(sup.deps.gate.committed_in_window(GateAction::Connect), 1);

        cancel.cancel();
        conn.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_requeues_snapshot_and_waits_before_retry() {
        let transport = MockTransport::new();
        transport.fail_next_send(TransportError::Send("broken pipe".into()));
        let (sup, ledger) = supervisor(
            LogicalChannel::Public,
            &transport,
            Arc::new(StaticCredentials::new(None)),
        );
        ledger.request_snapshot(DataKind::Trade, ["KRW-ETH"]);

        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();
        let conn = tokio::spawn(Arc::clone(&sup).run_connection(cancel.clone()));
        let rec = tokio::spawn(Arc::clone(&sup).run_reconciler(cancel.clone()));

        // The failed write replaces the socket; the snapshot waits for the retry.
        transport.wait_for_connections(2).await;
        settle().await;
        assert!(transport.sent().is_empty());
        assert_eq!(ledger.stats().pending_snapshots, 1);
        assert_eq!(sup.status().reconciliation_failures, 1);

        tokio::time::advance(Duration::from_millis(900)).await;
        settle().await;
        assert!(transport.sent().is_empty());

        transport.wait_for_sends(1).await;
        assert!(started.elapsed() >= Duration::from_secs(1));
        let frame: serde_json::Value = serde_json::from_str(&transport.sent()[0]).unwrap();
        assert_eq!(frame[1]["type"], "trade");
        assert_eq!(frame[1]["codes"], serde_json::json!(["KRW-ETH"]));
        assert_eq!(frame[1]["is_only_snapshot"], true);
        assert_eq!(ledger.stats().pending_snapshots, 0);

        cancel.cancel();
        conn.await.unwrap();
        rec.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_query_leaves_no_waiter_behind() {
        let transport = MockTransport::new();
        let (sup, _) = supervisor(
            LogicalChannel::Public,
            &transport,
            Arc::new(StaticCredentials::new(None)),
        );
        let cancel = CancellationToken::new();
        let conn = tokio::spawn(Arc::clone(&sup).run_connection(cancel.clone()));
        transport.wait_for_connections(1).await;
        settle().await;

        transport.fail_next_send(TransportError::Send("broken pipe".into()));
        let result = sup.list_subscriptions(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(QueryError::Transport(_))));
        assert!(sup.admin_waiters.lock().is_empty());

        let result = sup.list_subscriptions(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(QueryError::Timeout(_))));
        assert!(sup.admin_waiters.lock().is_empty());

        cancel.cancel();
        conn.await.unwrap();
    }
}
