#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Exchange Stream Mux - Multiplexed Exchange WebSocket Client
//!
//! Keeps many independently registered consumer components supplied with
//! live market and account data over one WebSocket connection per logical
//! channel (public market data, private account data), within the
//! exchange's request-rate limits.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types and bookkeeping
//!   - `streaming`: Channels, data kinds, stream specs, decoded events
//!   - `subscription`: Ledger of desired versus reconciled subscriptions
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Transport and credential interfaces
//!   - `services`: Component registry and the orchestrator
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `exchange`: Codec, rate gate, connection supervisors, health checks
//!   - `transport`: WebSocket client and in-memory double
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!                 subscribe()          change          subscription frame
//! Component ──────────────► Ledger ───────────► Reconciler ─────────────► Exchange
//!     ▲                                                                       │
//!     │ StreamEvent                                                           │
//!     └──────── Registry ◄──────── Codec ◄──────── Read loop ◄────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{
    CandleInterval, ComponentId, DataKind, DecodedEvent, Freshness, LogicalChannel, StreamEvent,
    StreamMode, StreamSpec, Symbol,
};
pub use domain::subscription::{LedgerStats, SubscriptionLedger};

// Ports
pub use application::ports::{BearerToken, CredentialProvider, Transport, TransportError};

// Services
pub use application::services::{
    ComponentRegistry, MuxStatus, Orchestrator, StreamConsumer, SubscribeError,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, MuxConfig};

// Exchange adapters
pub use infrastructure::exchange::{
    ChannelStatus, ConnectionState, NoCredentials, QueryError, StaticCredentials, WireFormat,
};

// Transports
pub use infrastructure::transport::{MockTransport, WebSocketTransport};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
