//! Exchange WebSocket Adapters
//!
//! Everything that speaks the exchange protocol:
//!
//! - **codec** / **compact**: subscription frames out, typed events in
//! - **rate_gate**: shared connect/send quota
//! - **supervisor**: one socket per logical channel, with reconnection and
//!   subscription reconciliation
//! - **heartbeat** / **reconnect**: health checks and backoff
//! - **auth**: bearer handshake headers for the private channel

pub mod auth;
pub mod codec;
pub mod compact;
pub mod heartbeat;
pub mod rate_gate;
pub mod reconnect;
pub mod supervisor;

pub use auth::{AuthError, NoCredentials, StaticCredentials};
pub use codec::{ActiveSubscription, AdminResponse, CodecError, Inbound, ProtocolCodec, WireFormat};
pub use heartbeat::{HealthMonitor, HeartbeatConfig, HeartbeatState};
pub use rate_gate::{GateAction, Permit, QuotaWindow, RateGate, RateGateConfig, RateGateError};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use supervisor::{
    ChannelStatus, ConnectionRecord, ConnectionState, ConnectionSupervisor, QueryError,
    ReconciliationError,
};
