//! Configuration Module
//!
//! Environment-driven configuration for the multiplexer.

mod settings;

pub use settings::{
    ConfigError, EndpointSettings, MuxConfig, RateLimitSettings, ServerSettings,
    WebSocketSettings, parse_symbols,
};
