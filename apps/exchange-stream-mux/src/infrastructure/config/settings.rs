//! Multiplexer Configuration Settings
//!
//! Configuration types for the multiplexer, loaded from `STREAM_MUX_*`
//! environment variables. Unparseable numbers fall back to their defaults;
//! an unknown wire format, an empty endpoint, or a zero health interval or
//! quota is an error.

use std::time::Duration;

use crate::infrastructure::exchange::codec::WireFormat;
use crate::infrastructure::exchange::heartbeat::HeartbeatConfig;
use crate::infrastructure::exchange::rate_gate::{QuotaWindow, RateGateConfig};
use crate::infrastructure::exchange::reconnect::ReconnectConfig;

/// WebSocket endpoints per logical channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSettings {
    /// Market data endpoint.
    pub public_url: String,
    /// Account data endpoint (bearer-authenticated).
    pub private_url: String,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            public_url: "wss://api.upbit.com/websocket/v1".to_string(),
            private_url: "wss://api.upbit.com/websocket/v1/private".to_string(),
        }
    }
}

/// WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Interval between health checks.
    pub heartbeat_interval: Duration,
    /// How long an idle-socket ping waits for its pong.
    pub pong_timeout: Duration,
    /// Silence after which a socket with subscriptions is replaced.
    pub stale_after: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Fraction of each delay randomized.
    pub reconnect_jitter: f64,
    /// Failed attempts before the channel enters ERROR (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Delay before retrying a failed subscription send.
    pub reconcile_retry: Duration,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            stale_after: Duration::from_secs(60),
            reconnect_delay_initial: Duration::from_secs(1),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            reconnect_jitter: 0.1,
            max_reconnect_attempts: 10,
            reconcile_retry: Duration::from_secs(1),
        }
    }
}

/// Exchange request quotas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSettings {
    /// Connects allowed per second.
    pub connect_per_second: u32,
    /// Messages allowed per second.
    pub send_per_second: u32,
    /// Messages allowed per minute.
    pub send_per_minute: u32,
    /// Longest a connect waits for quota.
    pub connect_timeout: Duration,
    /// Longest a send waits for quota.
    pub send_timeout: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            connect_per_second: 5,
            send_per_second: 5,
            send_per_minute: 100,
            connect_timeout: Duration::from_secs(3),
            send_timeout: Duration::from_secs(15),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8082 }
    }
}

/// Complete multiplexer configuration.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Endpoints.
    pub endpoints: EndpointSettings,
    /// Connection behavior.
    pub websocket: WebSocketSettings,
    /// Request quotas.
    pub rate_limits: RateLimitSettings,
    /// Server ports.
    pub server: ServerSettings,
    /// Prefix of the per-channel subscription ticket.
    pub ticket_prefix: String,
    /// Requested outbound payload format.
    pub format: WireFormat,
    /// Bound on waiting for tasks during shutdown.
    pub shutdown_timeout: Duration,
    /// Bound on `LIST_SUBSCRIPTIONS` round-trips.
    pub query_timeout: Duration,
    /// Market codes the demo binary subscribes to at startup.
    pub initial_symbols: Vec<String>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            endpoints: EndpointSettings::default(),
            websocket: WebSocketSettings::default(),
            rate_limits: RateLimitSettings::default(),
            server: ServerSettings::default(),
            ticket_prefix: "stream-mux".to_string(),
            format: WireFormat::Default,
            shutdown_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(5),
            initial_symbols: Vec::new(),
        }
    }
}

impl MuxConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but unusable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but unusable.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Env(&get);

        let endpoints = EndpointSettings {
            public_url: env.url("STREAM_MUX_PUBLIC_URL", defaults.endpoints.public_url)?,
            private_url: env.url("STREAM_MUX_PRIVATE_URL", defaults.endpoints.private_url)?,
        };

        let ws = defaults.websocket;
        let websocket = WebSocketSettings {
            heartbeat_interval: env.nonzero_secs(
                "STREAM_MUX_HEARTBEAT_INTERVAL_SECS",
                ws.heartbeat_interval,
            )?,
            pong_timeout: env.nonzero_secs("STREAM_MUX_PONG_TIMEOUT_SECS", ws.pong_timeout)?,
            stale_after: env.nonzero_secs("STREAM_MUX_STALE_AFTER_SECS", ws.stale_after)?,
            reconnect_delay_initial: env.millis(
                "STREAM_MUX_RECONNECT_DELAY_INITIAL_MS",
                ws.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.secs(
                "STREAM_MUX_RECONNECT_DELAY_MAX_SECS",
                ws.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: env.parse(
                "STREAM_MUX_RECONNECT_DELAY_MULTIPLIER",
                ws.reconnect_delay_multiplier,
            ),
            reconnect_jitter: env.parse("STREAM_MUX_RECONNECT_JITTER", ws.reconnect_jitter),
            max_reconnect_attempts: env.parse(
                "STREAM_MUX_MAX_RECONNECT_ATTEMPTS",
                ws.max_reconnect_attempts,
            ),
            reconcile_retry: env.millis("STREAM_MUX_RECONCILE_RETRY_MS", ws.reconcile_retry),
        };

        let rl = defaults.rate_limits;
        let rate_limits = RateLimitSettings {
            connect_per_second: env.nonzero(
                "STREAM_MUX_CONNECT_PER_SECOND",
                rl.connect_per_second,
            )?,
            send_per_second: env.nonzero("STREAM_MUX_SEND_PER_SECOND", rl.send_per_second)?,
            send_per_minute: env.nonzero("STREAM_MUX_SEND_PER_MINUTE", rl.send_per_minute)?,
            connect_timeout: env.millis("STREAM_MUX_CONNECT_TIMEOUT_MS", rl.connect_timeout),
            send_timeout: env.millis("STREAM_MUX_SEND_TIMEOUT_MS", rl.send_timeout),
        };

        let server = ServerSettings {
            health_port: env.parse("STREAM_MUX_HEALTH_PORT", defaults.server.health_port),
        };

        let format = match get("STREAM_MUX_FORMAT") {
            Some(raw) => WireFormat::from_str_case_insensitive(&raw).ok_or_else(|| {
                ConfigError::InvalidValue {
                    key: "STREAM_MUX_FORMAT".to_string(),
                    value: raw,
                }
            })?,
            None => defaults.format,
        };

        let ticket_prefix = get("STREAM_MUX_TICKET_PREFIX")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.ticket_prefix);

        let initial_symbols = get("STREAM_MUX_SYMBOLS")
            .map(|raw| parse_symbols(&raw))
            .unwrap_or_default();

        Ok(Self {
            endpoints,
            websocket,
            rate_limits,
            server,
            ticket_prefix,
            format,
            shutdown_timeout: env.millis("STREAM_MUX_SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout),
            query_timeout: env.millis("STREAM_MUX_QUERY_TIMEOUT_MS", defaults.query_timeout),
            initial_symbols,
        })
    }

    /// Backoff settings for the supervisors.
    #[must_use]
    pub const fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig::new(
            self.websocket.reconnect_delay_initial,
            self.websocket.reconnect_delay_max,
            self.websocket.reconnect_delay_multiplier,
            self.websocket.reconnect_jitter,
            self.websocket.max_reconnect_attempts,
        )
    }

    /// Health thresholds for the supervisors.
    #[must_use]
    pub const fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig::new(
            self.websocket.heartbeat_interval,
            self.websocket.pong_timeout,
            self.websocket.stale_after,
        )
    }

    /// Quotas for the shared rate gate.
    #[must_use]
    pub fn rate_gate_config(&self) -> RateGateConfig {
        let rl = &self.rate_limits;
        RateGateConfig {
            connect_windows: vec![QuotaWindow::new(rl.connect_per_second, Duration::from_secs(1))],
            send_windows: vec![
                QuotaWindow::new(rl.send_per_second, Duration::from_secs(1)),
                QuotaWindow::new(rl.send_per_minute, Duration::from_secs(60)),
            ],
            connect_timeout: rl.connect_timeout,
            send_timeout: rl.send_timeout,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has a value that cannot be used.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Rejected value.
        value: String,
    },
}

/// Comma-separated market codes, trimmed and uppercased.
#[must_use]
pub fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        (self.0)(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        (self.0)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn nonzero_secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let value = self.secs(key, default);
        if value.is_zero() {
            return Err(self.invalid(key));
        }
        Ok(value)
    }

    fn nonzero(&self, key: &str, default: u32) -> Result<u32, ConfigError> {
        match self.parse(key, default) {
            0 => Err(self.invalid(key)),
            value => Ok(value),
        }
    }

    fn invalid(&self, key: &str) -> ConfigError {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: (self.0)(key).unwrap_or_default(),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        (self.0)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }

    fn url(&self, key: &str, default: String) -> Result<String, ConfigError> {
        match (self.0)(key) {
            Some(v) if v.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            Some(v) => Ok(v.trim().to_string()),
            None => Ok(default),
        }
    }
}
