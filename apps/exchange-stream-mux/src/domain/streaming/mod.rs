//! Market Data Streaming Types
//!
//! Core domain types for the exchange feed: logical channels, data kinds,
//! stream specifications, and the decoded event envelope delivered to
//! consumers. These types are codec-agnostic.

mod events;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use events::{
    AssetBalance, CandleEvent, DecodedEvent, MyAssetEvent, MyOrderEvent, OrderbookEvent,
    OrderbookUnit, TickerEvent, TradeEvent,
};

// =============================================================================
// Identifiers
// =============================================================================

/// A market code as the exchange names it (e.g. `KRW-BTC`).
pub type Symbol = String;

/// Opaque identifier of an external consumer of the feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(Arc<str>);

impl ComponentId {
    /// Create a component id.
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ComponentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ComponentId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Logical Channel
// =============================================================================

/// Exchange-side connection scope. Each channel owns one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalChannel {
    /// Market data, no authentication.
    Public,
    /// Account data, bearer token required on every connection attempt.
    Private,
}

impl LogicalChannel {
    /// All channels.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Public, Self::Private]
    }

    /// Lowercase channel name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }

    /// Whether connecting requires a credential.
    #[must_use]
    pub const fn requires_auth(self) -> bool {
        matches!(self, Self::Private)
    }
}

impl fmt::Display for LogicalChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogicalChannel {
    type Err = UnknownChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "private" => Ok(Self::Private),
            _ => Err(UnknownChannel(s.to_string())),
        }
    }
}

/// Returned when parsing an unknown channel name.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown channel: {0}")]
pub struct UnknownChannel(pub String);

// =============================================================================
// Data Kind
// =============================================================================

/// Candle aggregation interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum CandleInterval {
    /// One second.
    OneSecond,
    /// One minute.
    #[default]
    OneMinute,
    /// Three minutes.
    ThreeMinutes,
    /// Five minutes.
    FiveMinutes,
    /// Ten minutes.
    TenMinutes,
    /// Fifteen minutes.
    FifteenMinutes,
    /// Thirty minutes.
    ThirtyMinutes,
    /// Sixty minutes.
    SixtyMinutes,
    /// Two hundred forty minutes.
    TwoHundredFortyMinutes,
}

impl CandleInterval {
    /// All supported intervals.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::OneSecond,
            Self::OneMinute,
            Self::ThreeMinutes,
            Self::FiveMinutes,
            Self::TenMinutes,
            Self::FifteenMinutes,
            Self::ThirtyMinutes,
            Self::SixtyMinutes,
            Self::TwoHundredFortyMinutes,
        ]
    }

    const fn suffix(self) -> &'static str {
        match self {
            Self::OneSecond => "1s",
            Self::OneMinute => "1m",
            Self::ThreeMinutes => "3m",
            Self::FiveMinutes => "5m",
            Self::TenMinutes => "10m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::SixtyMinutes => "60m",
            Self::TwoHundredFortyMinutes => "240m",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        Self::all().iter().copied().find(|i| i.suffix() == suffix)
    }
}

/// Category of market or account data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataKind {
    /// Current price summary.
    Ticker,
    /// Executed trades.
    Trade,
    /// Order book depth.
    Orderbook,
    /// OHLCV candles at a fixed interval.
    Candle(CandleInterval),
    /// The account's own order updates.
    MyOrder,
    /// The account's balance updates.
    MyAsset,
}

impl DataKind {
    /// Market kinds, candles expanded per interval.
    #[must_use]
    pub fn market_kinds() -> Vec<Self> {
        let mut kinds = vec![Self::Ticker, Self::Trade, Self::Orderbook];
        kinds.extend(CandleInterval::all().iter().copied().map(Self::Candle));
        kinds
    }

    /// Channel this kind travels on.
    #[must_use]
    pub const fn channel(self) -> LogicalChannel {
        match self {
            Self::MyOrder | Self::MyAsset => LogicalChannel::Private,
            _ => LogicalChannel::Public,
        }
    }

    /// Market kinds need at least one symbol; account kinds may be unscoped.
    #[must_use]
    pub const fn requires_symbols(self) -> bool {
        matches!(self.channel(), LogicalChannel::Public)
    }

    /// Wire name used in the `type` field.
    #[must_use]
    pub fn as_wire(self) -> String {
        match self {
            Self::Ticker => "ticker".to_string(),
            Self::Trade => "trade".to_string(),
            Self::Orderbook => "orderbook".to_string(),
            Self::Candle(interval) => format!("candle.{}", interval.suffix()),
            Self::MyOrder => "myOrder".to_string(),
            Self::MyAsset => "myAsset".to_string(),
        }
    }

    /// Parse a wire `type` value.
    #[must_use]
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "ticker" => Some(Self::Ticker),
            "trade" => Some(Self::Trade),
            "orderbook" => Some(Self::Orderbook),
            "myOrder" => Some(Self::MyOrder),
            "myAsset" => Some(Self::MyAsset),
            other => other
                .strip_prefix("candle.")
                .and_then(CandleInterval::from_suffix)
                .map(Self::Candle),
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_wire())
    }
}

impl Serialize for DataKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_wire())
    }
}

// =============================================================================
// Stream Specification
// =============================================================================

/// Whether a subscription persists or is served once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamMode {
    /// Kept alive until withdrawn.
    #[default]
    Realtime,
    /// Consumed by the next reconciliation, then discarded.
    Snapshot,
}

/// Freshness tag carried by every inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Freshness {
    /// Point-in-time state sent on subscription.
    Snapshot,
    /// Live update.
    Realtime,
}

/// What a component asks for: one kind, a set of symbols, and a mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    /// Requested data kind.
    pub kind: DataKind,
    /// Requested symbols; empty means unscoped.
    pub symbols: BTreeSet<Symbol>,
    /// Persistence mode.
    pub mode: StreamMode,
}

impl StreamSpec {
    /// Persistent subscription.
    #[must_use]
    pub fn realtime<I, S>(kind: DataKind, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        Self {
            kind,
            symbols: symbols.into_iter().map(Into::into).collect(),
            mode: StreamMode::Realtime,
        }
    }

    /// One-shot subscription.
    #[must_use]
    pub fn snapshot<I, S>(kind: DataKind, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        Self {
            mode: StreamMode::Snapshot,
            ..Self::realtime(kind, symbols)
        }
    }

    /// Kind equality, and either unscoped or the symbol is a member.
    #[must_use]
    pub fn matches(&self, kind: DataKind, symbol: Option<&str>) -> bool {
        if self.kind != kind {
            return false;
        }
        if self.symbols.is_empty() {
            return true;
        }
        symbol.is_some_and(|s| self.symbols.contains(s))
    }
}

// =============================================================================
// Event Envelope
// =============================================================================

/// What a consumer receives for every matching inbound frame.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    /// Data kind of the payload.
    pub kind: DataKind,
    /// Market code, absent for account-wide payloads.
    pub symbol: Option<Symbol>,
    /// Decoded payload.
    pub payload: DecodedEvent,
    /// Local arrival time.
    pub received_at: DateTime<Utc>,
    /// Snapshot or realtime.
    pub freshness: Freshness,
}

impl StreamEvent {
    /// Wrap a decoded payload, stamping the arrival time.
    #[must_use]
    pub fn new(payload: DecodedEvent, received_at: DateTime<Utc>) -> Self {
        Self {
            kind: payload.kind(),
            symbol: payload.symbol().map(str::to_string),
            freshness: payload.freshness(),
            payload,
            received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_wire_names_roundtrip_through_parser() {
        let mut kinds = DataKind::market_kinds();
        kinds.extend([DataKind::MyOrder, DataKind::MyAsset]);

        for kind in kinds {
            assert_eq!(DataKind::from_wire(&kind.as_wire()), Some(kind));
        }
    }

    #[test]
    fn unknown_wire_kind_is_rejected() {
        assert_eq!(DataKind::from_wire("candle.2m"), None);
        assert_eq!(DataKind::from_wire("orderbook.5"), None);
        assert_eq!(DataKind::from_wire(""), None);
    }

    #[test]
    fn account_kinds_travel_on_private_channel() {
        assert_eq!(DataKind::MyOrder.channel(), LogicalChannel::Private);
        assert_eq!(DataKind::MyAsset.channel(), LogicalChannel::Private);
        assert_eq!(
            DataKind::Candle(CandleInterval::FiveMinutes).channel(),
            LogicalChannel::Public
        );
        assert!(!DataKind::MyAsset.requires_symbols());
        assert!(DataKind::Trade.requires_symbols());
    }

    #[test]
    fn unscoped_spec_matches_any_symbol() {
        let spec = StreamSpec::realtime(DataKind::MyOrder, Vec::<String>::new());
        assert!(spec.matches(DataKind::MyOrder, Some("KRW-BTC")));
        assert!(spec.matches(DataKind::MyOrder, None));
        assert!(!spec.matches(DataKind::MyAsset, None));
    }

    #[test]
    fn scoped_spec_requires_membership() {
        let spec = StreamSpec::realtime(DataKind::Ticker, ["KRW-BTC", "KRW-ETH"]);
        assert!(spec.matches(DataKind::Ticker, Some("KRW-ETH")));
        assert!(!spec.matches(DataKind::Ticker, Some("KRW-XRP")));
        assert!(!spec.matches(DataKind::Ticker, None));
        assert!(!spec.matches(DataKind::Trade, Some("KRW-BTC")));
    }

    #[test]
    fn channel_parsing_is_case_insensitive() {
        assert_eq!("PUBLIC".parse::<LogicalChannel>().ok(), Some(LogicalChannel::Public));
        assert_eq!("private".parse::<LogicalChannel>().ok(), Some(LogicalChannel::Private));
        assert!("futures".parse::<LogicalChannel>().is_err());
    }
}
