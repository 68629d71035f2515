//! Rate Gate
//!
//! Two-phase token gate for rate-limited socket operations.
//!
//! A caller first [`reserve`](RateGate::reserve)s a slot, performs the
//! guarded action, and only then [`commit`](Permit::commit)s. Quota is
//! consumed on commit; a permit dropped without commit just releases its
//! reservation. Outstanding reservations count against the quota so that
//! concurrent callers cannot overshoot while their actions are in flight.
//!
//! Each action class carries one or more sliding windows, all of which must
//! have room before a reservation is granted.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Action classes with separate quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateAction {
    /// Opening a socket.
    Connect,
    /// Sending a frame on an open socket.
    Send,
}

impl GateAction {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Send => "send",
        }
    }
}

impl fmt::Display for GateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// At most `limit` actions in any `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaWindow {
    /// Maximum actions per period.
    pub limit: u32,
    /// Window length.
    pub period: Duration,
}

impl QuotaWindow {
    /// Create a window.
    #[must_use]
    pub const fn new(limit: u32, period: Duration) -> Self {
        Self { limit, period }
    }
}

/// Rate gate configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateGateConfig {
    /// Windows applied to socket opens.
    pub connect_windows: Vec<QuotaWindow>,
    /// Windows applied to frame sends.
    pub send_windows: Vec<QuotaWindow>,
    /// How long a connect reservation may wait.
    pub connect_timeout: Duration,
    /// How long a send reservation may wait.
    pub send_timeout: Duration,
}

impl Default for RateGateConfig {
    fn default() -> Self {
        Self {
            connect_windows: vec![QuotaWindow::new(5, Duration::from_secs(1))],
            send_windows: vec![
                QuotaWindow::new(5, Duration::from_secs(1)),
                QuotaWindow::new(100, Duration::from_secs(60)),
            ],
            connect_timeout: Duration::from_secs(3),
            send_timeout: Duration::from_secs(15),
        }
    }
}

impl RateGateConfig {
    const fn timeout(&self, action: GateAction) -> Duration {
        match action {
            GateAction::Connect => self.connect_timeout,
            GateAction::Send => self.send_timeout,
        }
    }
}

/// Rate gate errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateGateError {
    /// No slot opened before the timeout.
    #[error("Rate limit exhausted for {action} after {waited:?}")]
    Exhausted {
        /// Action that was refused.
        action: GateAction,
        /// Time spent waiting.
        waited: Duration,
    },

    /// The gate was closed during shutdown.
    #[error("Rate gate closed")]
    Closed,

    /// The gate could not evaluate the request.
    #[error("Rate gate internal failure: {0}")]
    Internal(String),
}

// =============================================================================
// Buckets
// =============================================================================

#[derive(Debug)]
struct Bucket {
    windows: Vec<QuotaWindow>,
    history: VecDeque<Instant>,
    reserved: u32,
}

impl Bucket {
    fn new(windows: Vec<QuotaWindow>) -> Self {
        Self {
            windows,
            history: VecDeque::new(),
            reserved: 0,
        }
    }

    fn prune(&mut self, now: Instant) {
        let Some(longest) = self.windows.iter().map(|w| w.period).max() else {
            self.history.clear();
            return;
        };
        while let Some(oldest) = self.history.front() {
            if now.saturating_duration_since(*oldest) >= longest {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    /// `Ok` if every window has room, otherwise the earliest instant at which
    /// committed history alone would make room (`None` if only a released
    /// reservation can help).
    fn check(&self, now: Instant) -> Result<(), Option<Instant>> {
        let mut wake: Option<Instant> = None;
        let mut blocked = false;
        let mut needs_release = false;

        for window in &self.windows {
            let in_window: Vec<Instant> = self
                .history
                .iter()
                .copied()
                .filter(|t| now.saturating_duration_since(*t) < window.period)
                .collect();
            let used = u32::try_from(in_window.len()).unwrap_or(u32::MAX);

            if used.saturating_add(self.reserved) < window.limit {
                continue;
            }
            blocked = true;

            if self.reserved >= window.limit {
                needs_release = true;
                continue;
            }

            // Entries that must age out before one more slot fits.
            let excess = used.saturating_add(self.reserved) + 1 - window.limit;
            let idx = usize::try_from(excess).unwrap_or(usize::MAX).saturating_sub(1);
            if let Some(t) = in_window.get(idx) {
                let at = *t + window.period;
                wake = Some(wake.map_or(at, |w| w.max(at)));
            }
        }

        if !blocked {
            return Ok(());
        }
        Err(if needs_release { None } else { wake })
    }
}

#[derive(Debug)]
struct GateState {
    connect: Bucket,
    send: Bucket,
    closed: bool,
}

impl GateState {
    fn bucket(&mut self, action: GateAction) -> &mut Bucket {
        match action {
            GateAction::Connect => &mut self.connect,
            GateAction::Send => &mut self.send,
        }
    }
}

#[derive(Debug, Default)]
struct GateCounters {
    granted: AtomicU64,
    committed: AtomicU64,
    released: AtomicU64,
    exhausted: AtomicU64,
    bypassed: AtomicU64,
}

#[derive(Debug)]
struct Inner {
    config: RateGateConfig,
    state: Mutex<GateState>,
    changed: Notify,
    counters: GateCounters,
}

impl Inner {
    fn settle(&self, action: GateAction, committed: bool) {
        {
            let mut state = self.state.lock();
            let bucket = state.bucket(action);
            bucket.reserved = bucket.reserved.saturating_sub(1);
            if committed {
                bucket.history.push_back(Instant::now());
            }
        }

        let counter = if committed {
            &self.counters.committed
        } else {
            &self.counters.released
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.changed.notify_waiters();
    }
}

// =============================================================================
// Rate Gate
// =============================================================================

/// Shared quota gate. Cloning shares the underlying quota.
#[derive(Debug, Clone)]
pub struct RateGate {
    inner: Arc<Inner>,
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new(RateGateConfig::default())
    }
}

impl RateGate {
    /// Create a gate.
    #[must_use]
    pub fn new(config: RateGateConfig) -> Self {
        let state = GateState {
            connect: Bucket::new(config.connect_windows.clone()),
            send: Bucket::new(config.send_windows.clone()),
            closed: false,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
                changed: Notify::new(),
                counters: GateCounters::default(),
            }),
        }
    }

    /// Wait for a slot, up to the action's timeout.
    ///
    /// # Errors
    ///
    /// - `Exhausted` if no slot opened in time (quota untouched)
    /// - `Closed` if the gate was closed
    /// - `Internal` if the deadline could not be computed
    pub async fn reserve(&self, action: GateAction) -> Result<Permit, RateGateError> {
        let timeout = self.inner.config.timeout(action);
        let started = Instant::now();
        let deadline = started
            .checked_add(timeout)
            .ok_or_else(|| RateGateError::Internal(format!("timeout overflow: {timeout:?}")))?;

        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(RateGateError::Closed);
                }
                let now = Instant::now();
                let bucket = state.bucket(action);
                bucket.prune(now);
                match bucket.check(now) {
                    Ok(()) => {
                        bucket.reserved += 1;
                        self.inner.counters.granted.fetch_add(1, Ordering::Relaxed);
                        return Ok(Permit::new(Arc::clone(&self.inner), action));
                    }
                    Err(wake) => wake,
                }
            };

            let now = Instant::now();
            if now >= deadline {
                self.inner.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                metrics::record_rate_gate_exhausted(action);
                warn!(action = %action, waited_ms = timeout.as_millis(), "Rate gate exhausted");
                return Err(RateGateError::Exhausted {
                    action,
                    waited: now - started,
                });
            }

            let until = wake.map_or(deadline, |w| w.min(deadline));
            debug!(action = %action, wait_ms = (until - now).as_millis(), "Waiting for rate gate");

            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(until) => {}
            }
        }
    }

    /// Like [`reserve`](Self::reserve), but an internal failure yields an
    /// unthrottled permit instead of an error.
    ///
    /// # Errors
    ///
    /// Returns `Exhausted` or `Closed` unchanged.
    pub async fn acquire(&self, action: GateAction) -> Result<Permit, RateGateError> {
        match self.reserve(action).await {
            Err(RateGateError::Internal(reason)) => {
                self.inner.counters.bypassed.fetch_add(1, Ordering::Relaxed);
                metrics::record_rate_gate_bypassed(action);
                warn!(action = %action, reason = %reason, "Rate gate failed, proceeding unthrottled");
                Ok(Permit::unthrottled(action))
            }
            other => other,
        }
    }

    /// Refuse all further reservations and wake every waiter.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.changed.notify_waiters();
    }

    /// Committed actions still inside the longest window.
    #[must_use]
    pub fn committed_in_window(&self, action: GateAction) -> usize {
        let mut state = self.inner.state.lock();
        let bucket = state.bucket(action);
        bucket.prune(Instant::now());
        bucket.history.len()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> RateGateStats {
        let c = &self.inner.counters;
        RateGateStats {
            granted: c.granted.load(Ordering::Relaxed),
            committed: c.committed.load(Ordering::Relaxed),
            released: c.released.load(Ordering::Relaxed),
            exhausted: c.exhausted.load(Ordering::Relaxed),
            bypassed: c.bypassed.load(Ordering::Relaxed),
        }
    }
}

/// Rate gate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RateGateStats {
    /// Reservations granted.
    pub granted: u64,
    /// Permits committed.
    pub committed: u64,
    /// Permits dropped without commit.
    pub released: u64,
    /// Reservations that timed out.
    pub exhausted: u64,
    /// Unthrottled permits handed out.
    pub bypassed: u64,
}

// =============================================================================
// Permit
// =============================================================================

/// A reserved slot. Commit after the guarded action succeeds.
#[must_use = "dropping a permit releases the reservation without consuming quota"]
pub struct Permit {
    gate: Option<Arc<Inner>>,
    action: GateAction,
}

impl Permit {
    fn new(gate: Arc<Inner>, action: GateAction) -> Self {
        Self {
            gate: Some(gate),
            action,
        }
    }

    /// A permit that is not backed by any quota.
    pub const fn unthrottled(action: GateAction) -> Self {
        Self { gate: None, action }
    }

    /// Whether this permit bypasses the gate.
    #[must_use]
    pub const fn is_unthrottled(&self) -> bool {
        self.gate.is_none()
    }

    /// Action class this permit was granted for.
    #[must_use]
    pub const fn action(&self) -> GateAction {
        self.action
    }

    /// Consume quota for the completed action.
    pub fn commit(mut self) {
        if let Some(gate) = self.gate.take() {
            gate.settle(self.action, true);
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.settle(self.action, false);
        }
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("action", &self.action)
            .field("unthrottled", &self.is_unthrottled())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_with(connect: QuotaWindow, timeout: Duration) -> RateGate {
        RateGate::new(RateGateConfig {
            connect_windows: vec![connect],
            connect_timeout: timeout,
            ..RateGateConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn grants_immediately_under_quota() {
        let gate = RateGate::default();
        let start = Instant::now();

        for _ in 0..5 {
            gate.reserve(GateAction::Send).await.unwrap().commit();
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(gate.committed_in_window(GateAction::Send), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_window_to_slide() {
        let gate = RateGate::default();
        for _ in 0..5 {
            gate.reserve(GateAction::Send).await.unwrap().commit();
        }

        let start = Instant::now();
        let permit = gate.reserve(GateAction::Send).await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(1));
        permit.commit();
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_permits_never_consume_quota() {
        let gate = RateGate::default();

        for _ in 0..20 {
            let permit = gate.reserve(GateAction::Send).await.unwrap();
            drop(permit);
        }

        assert_eq!(gate.committed_in_window(GateAction::Send), 0);
        let stats = gate.stats();
        assert_eq!(stats.granted, 20);
        assert_eq!(stats.released, 20);
        assert_eq!(stats.committed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_surfaces_exhausted_without_advancing_quota() {
        let gate = gate_with(
            QuotaWindow::new(2, Duration::from_secs(60)),
            Duration::from_secs(3),
        );
        for _ in 0..2 {
            gate.reserve(GateAction::Connect).await.unwrap().commit();
        }

        let start = Instant::now();
        let err = gate.reserve(GateAction::Connect).await.unwrap_err();

        assert!(matches!(err, RateGateError::Exhausted { action: GateAction::Connect, .. }));
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(gate.committed_in_window(GateAction::Connect), 2);
        assert_eq!(gate.stats().exhausted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn outstanding_reservations_block_until_released() {
        let gate = gate_with(
            QuotaWindow::new(1, Duration::from_secs(1)),
            Duration::from_secs(3),
        );
        let held = gate.reserve(GateAction::Connect).await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.reserve(GateAction::Connect).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let permit = waiter.await.unwrap().unwrap();
        assert!(!permit.is_unthrottled());
    }

    #[tokio::test(start_paused = true)]
    async fn action_classes_are_independent() {
        let gate = gate_with(
            QuotaWindow::new(1, Duration::from_secs(60)),
            Duration::from_secs(3),
        );
        gate.reserve(GateAction::Connect).await.unwrap().commit();

        let start = Instant::now();
        gate.reserve(GateAction::Send).await.unwrap().commit();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn minute_window_applies_alongside_second_window() {
        let gate = RateGate::new(RateGateConfig {
            send_windows: vec![
                QuotaWindow::new(5, Duration::from_secs(1)),
                QuotaWindow::new(6, Duration::from_secs(60)),
            ],
            send_timeout: Duration::from_secs(120),
            ..RateGateConfig::default()
        });

        for _ in 0..6 {
            gate.reserve(GateAction::Send).await.unwrap().commit();
        }

        let start = Instant::now();
        gate.reserve(GateAction::Send).await.unwrap().commit();
        assert!(start.elapsed() >= Duration::from_secs(59));
    }

    #[tokio::test]
    async fn close_rejects_reservations() {
        let gate = RateGate::default();
        gate.close();

        assert_eq!(
            gate.reserve(GateAction::Send).await.unwrap_err(),
            RateGateError::Closed
        );
    }

    #[tokio::test]
    async fn internal_failure_degrades_to_unthrottled() {
        let gate = gate_with(QuotaWindow::new(5, Duration::from_secs(1)), Duration::MAX);

        assert!(matches!(
            gate.reserve(GateAction::Connect).await,
            Err(RateGateError::Internal(_))
        ));

        let permit = gate.acquire(GateAction::Connect).await.unwrap();
        assert!(permit.is_unthrottled());
        permit.commit();

        assert_eq!(gate.stats().bypassed, 1);
        assert_eq!(gate.committed_in_window(GateAction::Connect), 0);
    }
}
