//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, channel status reporting, and Prometheus
//! metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON status of every channel
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (public channel connected)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /subscriptions/{channel}` - Live `LIST_SUBSCRIPTIONS` round-trip

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{MuxStatus, Orchestrator};
use crate::domain::streaming::LogicalChannel;
use crate::infrastructure::exchange::supervisor::{ChannelStatus, ConnectionState, QueryError};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Channel and counter details.
    #[serde(flatten)]
    pub mux: MuxStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Some systems degraded but functional.
    Degraded,
    /// Critical systems unavailable.
    Unhealthy,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    orchestrator: Arc<Orchestrator>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, orchestrator: Arc<Orchestrator>, cancel: CancellationToken) -> Self {
        Self {
            port,
            orchestrator,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.orchestrator);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Routes served by [`HealthServer`].
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/subscriptions/{channel}", get(subscriptions_handler))
        .with_state(orchestrator)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(mux): State<Arc<Orchestrator>>) -> impl IntoResponse {
    let status = mux.status();
    let overall = determine_health_status(&status.channels);
    let status_code = match overall {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    let response = HealthResponse {
        status: overall,
        version: env!("CARGO_PKG_VERSION").to_string(),
        current_time: Utc::now(),
        mux: status,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(mux): State<Arc<Orchestrator>>) -> impl IntoResponse {
    let public = mux.channel_status(LogicalChannel::Public);
    if public.state == ConnectionState::Connected {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

async fn subscriptions_handler(
    State(mux): State<Arc<Orchestrator>>,
    Path(channel): Path<String>,
) -> Response {
    let channel: LogicalChannel = match channel.parse() {
        Ok(channel) => channel,
        Err(e) => return error_response(StatusCode::NOT_FOUND, &e),
    };

    match mux.list_subscriptions(channel).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            let code = match e {
                QueryError::NotConnected | QueryError::Dropped => StatusCode::SERVICE_UNAVAILABLE,
                QueryError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                QueryError::RateGate(_) => StatusCode::TOO_MANY_REQUESTS,
                QueryError::Codec(_) | QueryError::Transport(_) => StatusCode::BAD_GATEWAY,
            };
            error_response(code, &e)
        }
    }
}

fn error_response(code: StatusCode, error: &dyn std::fmt::Display) -> Response {
    (
        code,
        Json(ErrorBody {
            error: error.to_string(),
        }),
    )
        .into_response()
}

/// Healthy when every channel that is not parked is connected; unhealthy
/// when any channel is in ERROR or nothing is connected.
fn determine_health_status(channels: &[ChannelStatus]) -> HealthStatus {
    if channels.iter().any(|c| c.state == ConnectionState::Error) {
        return HealthStatus::Unhealthy;
    }

    let expected: Vec<&ChannelStatus> = channels.iter().filter(|c| !c.credential_blocked).collect();
    let connected = expected
        .iter()
        .filter(|c| c.state == ConnectionState::Connected)
        .count();

    match connected {
        0 => HealthStatus::Unhealthy,
        n if n == expected.len() => HealthStatus::Healthy,
        _ => HealthStatus::Degraded,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::MuxConfig;
    use crate::infrastructure::exchange::auth::NoCredentials;
    use crate::infrastructure::transport::MockTransport;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        router(Orchestrator::new(
            MuxConfig::default(),
            Arc::new(MockTransport::new()),
            Arc::new(NoCredentials),
        ))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn channel(channel: LogicalChannel, state: ConnectionState, blocked: bool) -> ChannelStatus {
        ChannelStatus {
            channel,
            state,
            uptime_secs: None,
            messages_received: 0,
            protocol_errors: 0,
            reconnects: 0,
            reconciliations_sent: 0,
            reconciliation_failures: 0,
            active_subscriptions: 0,
            consecutive_errors: 0,
            last_error: None,
            credential_blocked: blocked,
            last_inbound_at: None,
            health_score: 0.0,
        }
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn parked_private_channel_does_not_degrade() {
        let status = determine_health_status(&[
            channel(LogicalChannel::Public, ConnectionState::Connected, false),
            channel(LogicalChannel::Private, ConnectionState::Disconnected, true),
        ]);
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[test]
    fn partial_connection_is_degraded() {
        let status = determine_health_status(&[
            channel(LogicalChannel::Public, ConnectionState::Connected, false),
            channel(LogicalChannel::Private, ConnectionState::Connecting, false),
        ]);
        assert_eq!(status, HealthStatus::Degraded);
    }

    #[test]
    fn error_state_is_unhealthy() {
        let status = determine_health_status(&[
            channel(LogicalChannel::Public, ConnectionState::Error, false),
            channel(LogicalChannel::Private, ConnectionState::Connected, false),
        ]);
        assert_eq!(status, HealthStatus::Unhealthy);
    }

    #[test]
    fn nothing_connected_is_unhealthy() {
        let status = determine_health_status(&[
            channel(LogicalChannel::Public, ConnectionState::Disconnected, false),
            channel(LogicalChannel::Private, ConnectionState::Disconnected, true),
        ]);
        assert_eq!(status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        assert_eq!(get(app(), "/healthz").await, (StatusCode::OK, "OK".to_string()));
    }

    #[tokio::test]
    async fn not_ready_before_start() {
        let (status, _) = get(app(), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn health_reports_every_channel() {
        let (status, body) = get(app(), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let body: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["channels"].as_array().unwrap().len(), 2);
        assert_eq!(body["channels"][0]["state"], "DISCONNECTED");
    }

    #[tokio::test]
    async fn subscription_query_maps_errors() {
        let (status, _) = get(app(), "/subscriptions/margin").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = get(app(), "/subscriptions/public").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("error"));
    }
}
