//! Transport Adapters
//!
//! Implementations of the [`Transport`](crate::application::ports::Transport)
//! port: the production WebSocket client and an in-memory double.

pub mod mock;
pub mod websocket;

pub use mock::{ConnectAttempt, MockTransport};
pub use websocket::WebSocketTransport;
