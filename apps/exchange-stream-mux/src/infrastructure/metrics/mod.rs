//! Prometheus Metrics Module
//!
//! Exposes multiplexer metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: inbound frames per channel and kind, protocol errors
//! - **Connections**: per-channel state and reconnect attempts
//! - **Reconciliation**: subscription frames sent and failed
//! - **Rate gate**: exhausted and bypassed reservations
//! - **Consumers**: registered components and dispatch latency
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! functions are no-ops until [`init_metrics`] installs the recorder.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::streaming::{DataKind, LogicalChannel};
use crate::infrastructure::exchange::rate_gate::GateAction;
use crate::infrastructure::exchange::supervisor::ConnectionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling it again returns the already installed handle.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed (e.g. another
/// global recorder is already set).
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "stream_mux_frames_received_total",
        "Total data frames received from the exchange"
    );
    describe_counter!(
        "stream_mux_protocol_errors_total",
        "Total inbound frames dropped by the codec"
    );

    describe_gauge!(
        "stream_mux_connection_state",
        "Connection state per channel (0=disconnected, 1=connecting, 2=connected, 3=error)"
    );
    describe_counter!(
        "stream_mux_reconnects_total",
        "Total reconnection attempts"
    );

    describe_counter!(
        "stream_mux_reconciliations_total",
        "Subscription frames by outcome"
    );
    describe_gauge!(
        "stream_mux_subscriptions",
        "Data kinds with at least one live owner"
    );

    describe_counter!(
        "stream_mux_rate_gate_exhausted_total",
        "Reservations that timed out waiting for quota"
    );
    describe_counter!(
        "stream_mux_rate_gate_bypassed_total",
        "Actions that proceeded unthrottled after a gate failure"
    );

    describe_gauge!(
        "stream_mux_components",
        "Registered consumer components"
    );
    describe_histogram!(
        "stream_mux_dispatch_seconds",
        "Time to fan out one event to matching consumers"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome label for reconciliation passes.
#[derive(Debug, Clone, Copy)]
pub enum ReconcileOutcome {
    /// Frame sent and baseline committed.
    Sent,
    /// Everything withdrawn; baseline committed without sending.
    Withdrawn,
    /// Pass failed and will be retried.
    Failed,
}

impl ReconcileOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Withdrawn => "withdrawn",
            Self::Failed => "failed",
        }
    }
}

/// Record an inbound data frame.
pub fn record_frame_received(channel: LogicalChannel, kind: DataKind) {
    counter!(
        "stream_mux_frames_received_total",
        "channel" => channel.as_str(),
        "kind" => kind.as_wire()
    )
    .increment(1);
}

/// Record a frame dropped by the codec.
pub fn record_protocol_error(channel: LogicalChannel, error_type: &'static str) {
    counter!(
        "stream_mux_protocol_errors_total",
        "channel" => channel.as_str(),
        "error_type" => error_type
    )
    .increment(1);
}

/// Update the connection state gauge.
pub fn set_connection_state(channel: LogicalChannel, state: ConnectionState) {
    let value = match state {
        ConnectionState::Disconnected => 0.0,
        ConnectionState::Connecting => 1.0,
        ConnectionState::Connected => 2.0,
        ConnectionState::Error => 3.0,
    };
    gauge!("stream_mux_connection_state", "channel" => channel.as_str()).set(value);
}

/// Record a reconnection attempt.
pub fn record_reconnect(channel: LogicalChannel) {
    counter!("stream_mux_reconnects_total", "channel" => channel.as_str()).increment(1);
}

/// Record a reconciliation pass.
pub fn record_reconciliation(channel: LogicalChannel, outcome: ReconcileOutcome) {
    counter!(
        "stream_mux_reconciliations_total",
        "channel" => channel.as_str(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Update the live subscription gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(channel: LogicalChannel, count: usize) {
    gauge!("stream_mux_subscriptions", "channel" => channel.as_str()).set(count as f64);
}

/// Record a timed-out reservation.
pub fn record_rate_gate_exhausted(action: GateAction) {
    counter!("stream_mux_rate_gate_exhausted_total", "action" => action.as_str()).increment(1);
}

/// Record an unthrottled permit.
pub fn record_rate_gate_bypassed(action: GateAction) {
    counter!("stream_mux_rate_gate_bypassed_total", "action" => action.as_str()).increment(1);
}

/// Update the registered component gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_components(count: usize) {
    gauge!("stream_mux_components").set(count as f64);
}

/// Record fan-out duration for one event.
pub fn record_dispatch_duration(kind: DataKind, duration: Duration) {
    histogram!("stream_mux_dispatch_seconds", "kind" => kind.as_wire())
        .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_outcome_as_str() {
        assert_eq!(ReconcileOutcome::Sent.as_str(), "sent");
        assert_eq!(ReconcileOutcome::Withdrawn.as_str(), "withdrawn");
        assert_eq!(ReconcileOutcome::Failed.as_str(), "failed");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_frame_received(LogicalChannel::Public, DataKind::Ticker);
        record_protocol_error(LogicalChannel::Private, "malformed");
        set_connection_state(LogicalChannel::Public, ConnectionState::Connected);
        record_rate_gate_exhausted(GateAction::Send);
        set_subscriptions(LogicalChannel::Public, 3);
    }
}
