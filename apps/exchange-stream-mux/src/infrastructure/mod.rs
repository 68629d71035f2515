//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Exchange protocol, connection supervision, and rate limiting.
pub mod exchange;

/// WebSocket and in-memory transports.
pub mod transport;

/// Configuration from environment variables.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
