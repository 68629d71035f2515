//! Compact (`SIMPLE`) format expansion.
//!
//! The exchange can abbreviate field names to save bandwidth. Abbreviations
//! collide across kinds (`ap` is `ask_price` inside an order book unit but
//! `avg_price` on an order), so the table is chosen from the frame's `ty`.
//! Expansion is one-directional; unknown abbreviations are kept verbatim.

use serde_json::{Map, Value};

use crate::domain::streaming::DataKind;

struct Table {
    fields: &'static [(&'static str, &'static str)],
    nested: &'static [(&'static str, &'static Table)],
}

impl Table {
    fn lookup(&self, short: &str) -> Option<&'static str> {
        self.fields
            .iter()
            .find(|(abbr, _)| *abbr == short)
            .map(|(_, full)| *full)
    }

    fn nested(&self, short: &str) -> Option<&'static Table> {
        self.nested
            .iter()
            .find(|(abbr, _)| *abbr == short)
            .map(|(_, table)| *table)
    }
}

static COMMON: Table = Table {
    fields: &[
        ("ty", "type"),
        ("cd", "code"),
        ("tms", "timestamp"),
        ("st", "stream_type"),
    ],
    nested: &[],
};

static TICKER: Table = Table {
    fields: &[
        ("op", "opening_price"),
        ("hp", "high_price"),
        ("lp", "low_price"),
        ("tp", "trade_price"),
        ("pcp", "prev_closing_price"),
        ("c", "change"),
        ("cp", "change_price"),
        ("scp", "signed_change_price"),
        ("cr", "change_rate"),
        ("scr", "signed_change_rate"),
        ("tv", "trade_volume"),
        ("atv", "acc_trade_volume"),
        ("atv24h", "acc_trade_volume_24h"),
        ("atp", "acc_trade_price"),
        ("atp24h", "acc_trade_price_24h"),
        ("tdt", "trade_date"),
        ("ttm", "trade_time"),
        ("ttms", "trade_timestamp"),
        ("ab", "ask_bid"),
        ("aav", "acc_ask_volume"),
        ("abv", "acc_bid_volume"),
        ("h52wp", "highest_52_week_price"),
        ("h52wdt", "highest_52_week_date"),
        ("l52wp", "lowest_52_week_price"),
        ("l52wdt", "lowest_52_week_date"),
        ("ms", "market_state"),
        ("mw", "market_warning"),
        ("dd", "delisting_date"),
    ],
    nested: &[],
};

static TRADE: Table = Table {
    fields: &[
        ("tp", "trade_price"),
        ("tv", "trade_volume"),
        ("ab", "ask_bid"),
        ("pcp", "prev_closing_price"),
        ("c", "change"),
        ("cp", "change_price"),
        ("td", "trade_date"),
        ("ttm", "trade_time"),
        ("ttms", "trade_timestamp"),
        ("sid", "sequential_id"),
        ("bap", "best_ask_price"),
        ("bas", "best_ask_size"),
        ("bbp", "best_bid_price"),
        ("bbs", "best_bid_size"),
    ],
    nested: &[],
};

static ORDERBOOK_UNIT: Table = Table {
    fields: &[
        ("ap", "ask_price"),
        ("bp", "bid_price"),
        ("as", "ask_size"),
        ("bs", "bid_size"),
    ],
    nested: &[],
};

static ORDERBOOK: Table = Table {
    fields: &[
        ("tas", "total_ask_size"),
        ("tbs", "total_bid_size"),
        ("obu", "orderbook_units"),
        ("lv", "level"),
    ],
    nested: &[("obu", &ORDERBOOK_UNIT)],
};

static CANDLE: Table = Table {
    fields: &[
        ("cdttmu", "candle_date_time_utc"),
        ("cdttmk", "candle_date_time_kst"),
        ("op", "opening_price"),
        ("hp", "high_price"),
        ("lp", "low_price"),
        ("tp", "trade_price"),
        ("catv", "candle_acc_trade_volume"),
        ("catp", "candle_acc_trade_price"),
    ],
    nested: &[],
};

static MY_ORDER: Table = Table {
    fields: &[
        ("uid", "uuid"),
        ("ab", "ask_bid"),
        ("ot", "order_type"),
        ("s", "state"),
        ("tuid", "trade_uuid"),
        ("p", "price"),
        ("ap", "avg_price"),
        ("v", "volume"),
        ("rv", "remaining_volume"),
        ("ev", "executed_volume"),
        ("tc", "trades_count"),
        ("rf", "reserved_fee"),
        ("rmf", "remaining_fee"),
        ("pf", "paid_fee"),
        ("l", "locked"),
        ("ef", "executed_funds"),
        ("ttms", "trade_timestamp"),
        ("otms", "order_timestamp"),
        ("tif", "time_in_force"),
        ("smp", "smp_type"),
        ("id", "identifier"),
    ],
    nested: &[],
};

static ASSET: Table = Table {
    fields: &[("cu", "currency"), ("b", "balance"), ("l", "locked")],
    nested: &[],
};

static MY_ASSET: Table = Table {
    fields: &[
        ("astuid", "asset_uuid"),
        ("ast", "assets"),
        ("asttms", "asset_timestamp"),
    ],
    nested: &[("ast", &ASSET)],
};

static EMPTY: Table = Table {
    fields: &[],
    nested: &[],
};

/// A frame is compact when it carries `ty` but no `type`.
pub fn is_compact(frame: &Map<String, Value>) -> bool {
    frame.contains_key("ty") && !frame.contains_key("type")
}

/// Rewrite abbreviated field names to their canonical form.
pub fn expand(frame: Map<String, Value>) -> Map<String, Value> {
    let kind = frame
        .get("ty")
        .and_then(Value::as_str)
        .and_then(DataKind::from_wire);

    let table = match kind {
        Some(DataKind::Ticker) => &TICKER,
        Some(DataKind::Trade) => &TRADE,
        Some(DataKind::Orderbook) => &ORDERBOOK,
        Some(DataKind::Candle(_)) => &CANDLE,
        Some(DataKind::MyOrder) => &MY_ORDER,
        Some(DataKind::MyAsset) => &MY_ASSET,
        None => &EMPTY,
    };

    rename(frame, table, Some(&COMMON))
}

fn rename(frame: Map<String, Value>, table: &Table, common: Option<&Table>) -> Map<String, Value> {
    frame
        .into_iter()
        .map(|(short, value)| {
            let value = match (table.nested(&short), value) {
                (Some(inner), Value::Array(items)) => Value::Array(
                    items
                        .into_iter()
                        .map(|item| match item {
                            Value::Object(obj) => Value::Object(rename(obj, inner, None)),
                            other => other,
                        })
                        .collect(),
                ),
                (_, value) => value,
            };

            let full = table
                .lookup(&short)
                .or_else(|| common.and_then(|c| c.lookup(&short)));
            let key = full.map_or(short, str::to_string);
            (key, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test fixture is an object"),
        }
    }

    #[test]
    fn detects_compact_frames() {
        assert!(is_compact(&object(json!({"ty": "ticker", "cd": "KRW-BTC"}))));
        assert!(!is_compact(&object(json!({"type": "ticker", "code": "KRW-BTC"}))));
        assert!(!is_compact(&object(json!({"type": "ticker", "ty": "x"}))));
    }

    #[test]
    fn expands_common_and_kind_fields() {
        let expanded = expand(object(json!({
            "ty": "ticker", "cd": "KRW-BTC", "tp": 100.5, "st": "REALTIME", "tms": 1
        })));

        assert_eq!(expanded["type"], "ticker");
        assert_eq!(expanded["code"], "KRW-BTC");
        assert_eq!(expanded["trade_price"], 100.5);
        assert_eq!(expanded["stream_type"], "REALTIME");
        assert_eq!(expanded["timestamp"], 1);
    }

    #[test]
    fn expands_orderbook_units_recursively() {
        let expanded = expand(object(json!({
            "ty": "orderbook", "cd": "KRW-BTC",
            "obu": [{"ap": 2, "bp": 1, "as": 0.5, "bs": 0.7}]
        })));

        let unit = &expanded["orderbook_units"][0];
        assert_eq!(unit["ask_price"], 2);
        assert_eq!(unit["bid_price"], 1);
        assert_eq!(unit["ask_size"], 0.5);
        assert_eq!(unit["bid_size"], 0.7);
    }

    #[test]
    fn same_abbreviation_depends_on_kind() {
        let order = expand(object(json!({"ty": "myOrder", "ap": 10})));
        assert_eq!(order["avg_price"], 10);

        let asset = expand(object(json!({"ty": "myAsset", "ast": [{"cu": "KRW", "b": 1, "l": 0}]})));
        assert_eq!(asset["assets"][0]["currency"], "KRW");
        assert_eq!(asset["assets"][0]["locked"], 0);
    }

    #[test]
    fn unknown_abbreviations_are_kept() {
        let expanded = expand(object(json!({"ty": "trade", "zz": 1})));
        assert_eq!(expanded["zz"], 1);
    }

    #[test]
    fn nested_tables_do_not_apply_common_names() {
        let expanded = expand(object(json!({"ty": "orderbook", "obu": [{"cd": "x"}]})));
        assert_eq!(expanded["orderbook_units"][0]["cd"], "x");
    }
}
