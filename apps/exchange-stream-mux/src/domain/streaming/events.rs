//! Decoded inbound payloads.
//!
//! One struct per kind family. Fields the exchange adds that we do not model
//! are kept in `extra` and never consulted for routing.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{CandleInterval, DataKind, Freshness};

/// Closed union of every payload the feed can deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    /// Ticker update.
    Ticker(TickerEvent),
    /// Trade print.
    Trade(TradeEvent),
    /// Order book update.
    Orderbook(OrderbookEvent),
    /// Candle update.
    Candle(CandleEvent),
    /// Own order update.
    MyOrder(MyOrderEvent),
    /// Own balance update.
    MyAsset(MyAssetEvent),
}

impl DecodedEvent {
    /// Data kind of this payload.
    #[must_use]
    pub const fn kind(&self) -> DataKind {
        match self {
            Self::Ticker(_) => DataKind::Ticker,
            Self::Trade(_) => DataKind::Trade,
            Self::Orderbook(_) => DataKind::Orderbook,
            Self::Candle(c) => DataKind::Candle(c.interval),
            Self::MyOrder(_) => DataKind::MyOrder,
            Self::MyAsset(_) => DataKind::MyAsset,
        }
    }

    /// Market code the payload refers to.
    #[must_use]
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::Ticker(e) => Some(&e.code),
            Self::Trade(e) => Some(&e.code),
            Self::Orderbook(e) => Some(&e.code),
            Self::Candle(e) => Some(&e.code),
            Self::MyOrder(e) => e.code.as_deref(),
            Self::MyAsset(_) => None,
        }
    }

    /// Snapshot or realtime; realtime when the exchange omits the tag.
    #[must_use]
    pub fn freshness(&self) -> Freshness {
        let tag = match self {
            Self::Ticker(e) => e.stream_type,
            Self::Trade(e) => e.stream_type,
            Self::Orderbook(e) => e.stream_type,
            Self::Candle(e) => e.stream_type,
            Self::MyOrder(e) => e.stream_type,
            Self::MyAsset(e) => e.stream_type,
        };
        tag.unwrap_or(Freshness::Realtime)
    }

    /// Unmodelled fields.
    #[must_use]
    pub const fn extra(&self) -> &Map<String, Value> {
        match self {
            Self::Ticker(e) => &e.extra,
            Self::Trade(e) => &e.extra,
            Self::Orderbook(e) => &e.extra,
            Self::Candle(e) => &e.extra,
            Self::MyOrder(e) => &e.extra,
            Self::MyAsset(e) => &e.extra,
        }
    }
}

/// Ticker update.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TickerEvent {
    /// Market code.
    pub code: String,
    /// Opening price.
    pub opening_price: Option<Decimal>,
    /// Session high.
    pub high_price: Option<Decimal>,
    /// Session low.
    pub low_price: Option<Decimal>,
    /// Last traded price.
    pub trade_price: Decimal,
    /// Previous close.
    pub prev_closing_price: Option<Decimal>,
    /// `RISE`, `EVEN` or `FALL`.
    pub change: Option<String>,
    /// Signed change rate versus previous close.
    pub signed_change_rate: Option<Decimal>,
    /// Volume of the last trade.
    pub trade_volume: Option<Decimal>,
    /// Rolling 24h volume.
    pub acc_trade_volume_24h: Option<Decimal>,
    /// Rolling 24h notional.
    pub acc_trade_price_24h: Option<Decimal>,
    /// Exchange timestamp in milliseconds.
    pub timestamp: Option<i64>,
    /// Snapshot/realtime tag.
    pub stream_type: Option<Freshness>,
    /// Unmodelled fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Trade print.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TradeEvent {
    /// Market code.
    pub code: String,
    /// Execution price.
    pub trade_price: Decimal,
    /// Execution size.
    pub trade_volume: Decimal,
    /// `ASK` or `BID`.
    pub ask_bid: Option<String>,
    /// Exchange sequence number.
    pub sequential_id: Option<u64>,
    /// Execution timestamp in milliseconds.
    pub trade_timestamp: Option<i64>,
    /// Exchange timestamp in milliseconds.
    pub timestamp: Option<i64>,
    /// Snapshot/realtime tag.
    pub stream_type: Option<Freshness>,
    /// Unmodelled fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One price level pair of an order book.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OrderbookUnit {
    /// Ask price.
    pub ask_price: Decimal,
    /// Bid price.
    pub bid_price: Decimal,
    /// Ask size.
    pub ask_size: Decimal,
    /// Bid size.
    pub bid_size: Decimal,
}

/// Order book update.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OrderbookEvent {
    /// Market code.
    pub code: String,
    /// Total resting ask size.
    pub total_ask_size: Option<Decimal>,
    /// Total resting bid size.
    pub total_bid_size: Option<Decimal>,
    /// Levels, best first.
    #[serde(default)]
    pub orderbook_units: Vec<OrderbookUnit>,
    /// Price grouping level.
    pub level: Option<Decimal>,
    /// Exchange timestamp in milliseconds.
    pub timestamp: Option<i64>,
    /// Snapshot/realtime tag.
    pub stream_type: Option<Freshness>,
    /// Unmodelled fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Candle update.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CandleEvent {
    /// Interval, taken from the frame's `type`.
    #[serde(skip)]
    pub interval: CandleInterval,
    /// Market code.
    pub code: String,
    /// Candle start (UTC, ISO-8601 without zone).
    pub candle_date_time_utc: Option<String>,
    /// Open.
    pub opening_price: Option<Decimal>,
    /// High.
    pub high_price: Option<Decimal>,
    /// Low.
    pub low_price: Option<Decimal>,
    /// Close so far.
    pub trade_price: Decimal,
    /// Volume within the candle.
    pub candle_acc_trade_volume: Option<Decimal>,
    /// Notional within the candle.
    pub candle_acc_trade_price: Option<Decimal>,
    /// Exchange timestamp in milliseconds.
    pub timestamp: Option<i64>,
    /// Snapshot/realtime tag.
    pub stream_type: Option<Freshness>,
    /// Unmodelled fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Own order update.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MyOrderEvent {
    /// Market code.
    pub code: Option<String>,
    /// Order id.
    pub uuid: Option<String>,
    /// `ASK` or `BID`.
    pub ask_bid: Option<String>,
    /// Order type (`limit`, `price`, `market`, ...).
    pub order_type: Option<String>,
    /// Order state (`wait`, `trade`, `done`, `cancel`, ...).
    pub state: Option<String>,
    /// Limit price.
    pub price: Option<Decimal>,
    /// Average fill price.
    pub avg_price: Option<Decimal>,
    /// Ordered size.
    pub volume: Option<Decimal>,
    /// Unfilled size.
    pub remaining_volume: Option<Decimal>,
    /// Filled size.
    pub executed_volume: Option<Decimal>,
    /// Number of fills.
    pub trades_count: Option<u64>,
    /// Exchange timestamp in milliseconds.
    pub timestamp: Option<i64>,
    /// Snapshot/realtime tag.
    pub stream_type: Option<Freshness>,
    /// Unmodelled fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Balance of one currency.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AssetBalance {
    /// Currency code.
    pub currency: String,
    /// Available balance.
    pub balance: Decimal,
    /// Balance locked in open orders.
    pub locked: Decimal,
}

/// Own balance update.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MyAssetEvent {
    /// Asset snapshot id.
    pub asset_uuid: Option<String>,
    /// Changed balances.
    #[serde(default)]
    pub assets: Vec<AssetBalance>,
    /// Balance change timestamp in milliseconds.
    pub asset_timestamp: Option<i64>,
    /// Exchange timestamp in milliseconds.
    pub timestamp: Option<i64>,
    /// Snapshot/realtime tag.
    pub stream_type: Option<Freshness>,
    /// Unmodelled fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
