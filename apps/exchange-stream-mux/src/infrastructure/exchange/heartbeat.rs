//! Heartbeat and Health Monitoring
//!
//! Tracks inbound activity per connection and runs the periodic health check
//! over every supervisor. Idle connections are probed with a ping; busy
//! connections are judged by how recently a frame arrived.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::supervisor::ConnectionSupervisor;

/// Configuration for health checking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between health checks.
    pub check_interval: Duration,
    /// How long an idle-connection ping may wait for its pong.
    pub pong_timeout: Duration,
    /// Silence after which a connection with subscriptions is stale.
    pub stale_after: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            stale_after: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(check_interval: Duration, pong_timeout: Duration, stale_after: Duration) -> Self {
        Self {
            check_interval,
            pong_timeout,
            stale_after,
        }
    }
}

/// Activity state of one connection, shared with its read loop.
#[derive(Debug)]
pub struct HeartbeatState {
    last_inbound: RwLock<Instant>,
    last_pong: RwLock<Instant>,
    waiting_for_pong: AtomicBool,
    pong: Notify,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_inbound: RwLock::new(Instant::now()),
            last_pong: RwLock::new(Instant::now()),
            waiting_for_pong: AtomicBool::new(false),
            pong: Notify::new(),
        }
    }

    /// Record that any frame arrived.
    pub fn record_inbound(&self) {
        *self.last_inbound.write() = Instant::now();
    }

    /// Record a pong or keepalive acknowledgement.
    pub fn record_pong(&self) {
        let now = Instant::now();
        *self.last_pong.write() = now;
        *self.last_inbound.write() = now;
        self.waiting_for_pong.store(false, Ordering::SeqCst);
        self.pong.notify_waiters();
    }

    /// Mark that we're waiting for a pong.
    pub fn mark_ping_sent(&self) {
        self.waiting_for_pong.store(true, Ordering::SeqCst);
    }

    /// Check if we're currently waiting for a pong.
    #[must_use]
    pub fn is_waiting_for_pong(&self) -> bool {
        self.waiting_for_pong.load(Ordering::SeqCst)
    }

    /// Time since the last inbound frame of any type.
    #[must_use]
    pub fn time_since_inbound(&self) -> Duration {
        self.last_inbound.read().elapsed()
    }

    /// Time since the last pong.
    #[must_use]
    pub fn time_since_pong(&self) -> Duration {
        self.last_pong.read().elapsed()
    }

    /// Future resolving on the next pong. Enable it before sending the ping.
    pub fn pong_received(&self) -> Notified<'_> {
        self.pong.notified()
    }

    /// Reset state for new connection.
    pub fn reset(&self) {
        let now = Instant::now();
        *self.last_inbound.write() = now;
        *self.last_pong.write() = now;
        self.waiting_for_pong.store(false, Ordering::SeqCst);
    }
}

/// Periodic health check over all supervisors.
pub struct HealthMonitor {
    interval: Duration,
    supervisors: Vec<Arc<ConnectionSupervisor>>,
    cancel: CancellationToken,
}

impl HealthMonitor {
    /// Create a monitor.
    #[must_use]
    pub const fn new(
        interval: Duration,
        supervisors: Vec<Arc<ConnectionSupervisor>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            interval,
            supervisors,
            cancel,
        }
    }

    /// Run until cancelled. The first check happens one interval after start.
    pub async fn run(self) {
        let start = Instant::now() + self.interval;
        let mut interval = tokio::time::interval_at(start, self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Health monitor cancelled");
                    break;
                }
                _ = interval.tick() => {
                    for supervisor in &self.supervisors {
                        tokio::select! {
                            () = self.cancel.cancelled() => return,
                            () = supervisor.check_health() => {}
                        }
                    }
                }
            }
        }
    }
}
