//! Protocol Codec
//!
//! Encodes subscription frames and classifies inbound frames.
//!
//! # Outbound
//!
//! One frame carries the whole request for a channel:
//!
//! ```json
//! [{"ticket":"mux-public-..."},
//!  {"type":"ticker","codes":["KRW-BTC","KRW-ETH"]},
//!  {"type":"orderbook","codes":["KRW-BTC"],"is_only_snapshot":true},
//!  {"format":"DEFAULT"}]
//! ```
//!
//! # Inbound
//!
//! Every inbound frame is a single JSON object. `type` (or `ty` in the
//! compact format) selects the payload, `method` marks an administrative
//! response, `error` or a non-OK `status` is a channel fault.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::compact;
use crate::domain::streaming::{DataKind, DecodedEvent};
use crate::domain::subscription::PlannedStream;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Frame is not valid JSON or does not match the expected shape.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// `type` names a kind this client does not know.
    #[error("Unknown data kind: {0}")]
    UnknownKind(String),

    /// Exchange reported an error on the channel.
    #[error("Channel fault {code}: {message}")]
    ChannelFault {
        /// Exchange error name or status.
        code: String,
        /// Human-readable detail.
        message: String,
    },

    /// Nothing to put in a subscription frame.
    #[error("Empty subscription request")]
    EmptyRequest,

    /// JSON encoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodecError {
    /// Whether the fault rejects our credentials.
    #[must_use]
    pub fn is_auth_fault(&self) -> bool {
        matches!(self, Self::ChannelFault { code, .. } if code.contains("AUTH"))
    }

    /// Metric label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::UnknownKind(_) => "unknown_kind",
            Self::ChannelFault { .. } => "channel_fault",
            Self::EmptyRequest => "empty_request",
            Self::Json(_) => "json",
        }
    }
}

/// Outbound payload format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// Canonical field names.
    #[default]
    Default,
    /// Abbreviated field names.
    Simple,
}

impl WireFormat {
    /// Parse from a string (case-insensitive).
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "default" => Some(Self::Default),
            "simple" => Some(Self::Simple),
            _ => None,
        }
    }

    /// Wire value of the `format` field.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::Simple => "SIMPLE",
        }
    }
}

/// One subscription the exchange reports as active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSubscription {
    /// Wire kind name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Subscribed codes.
    #[serde(default)]
    pub codes: Vec<String>,
    /// Remaining fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Reply to an administrative request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminResponse {
    /// Request method echoed back.
    pub method: String,
    /// Ticket the request carried.
    #[serde(default)]
    pub ticket: Option<String>,
    /// Active subscriptions on the socket.
    #[serde(default)]
    pub result: Vec<ActiveSubscription>,
}

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Market or account data.
    Event(DecodedEvent),
    /// Administrative reply.
    Admin(AdminResponse),
    /// Keepalive acknowledgement (`{"status":"UP"}`).
    KeepAlive,
}

/// Encoder/decoder for the exchange protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolCodec {
    format: WireFormat,
}

impl ProtocolCodec {
    /// Create a codec requesting the given outbound format.
    #[must_use]
    pub const fn new(format: WireFormat) -> Self {
        Self { format }
    }

    /// The requested outbound format.
    #[must_use]
    pub const fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode a subscription frame listing every stream in full.
    ///
    /// # Errors
    ///
    /// Returns `EmptyRequest` if `streams` is empty.
    pub fn encode(&self, ticket: &str, streams: &[PlannedStream]) -> Result<String, CodecError> {
        if streams.is_empty() {
            return Err(CodecError::EmptyRequest);
        }

        let mut frame = Vec::with_capacity(streams.len() + 2);
        frame.push(json!({ "ticket": ticket }));

        for stream in streams {
            let mut entry = Map::new();
            entry.insert("type".to_string(), Value::String(stream.kind.as_wire()));
            if stream.kind.requires_symbols() || !stream.symbols.is_empty() {
                entry.insert("codes".to_string(), json!(stream.symbols));
            }
            if stream.snapshot_only {
                entry.insert("is_only_snapshot".to_string(), Value::Bool(true));
            }
            frame.push(Value::Object(entry));
        }

        frame.push(json!({ "format": self.format.as_str() }));
        Ok(serde_json::to_string(&frame)?)
    }

    /// Encode the `LIST_SUBSCRIPTIONS` administrative request.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON encoding fails.
    pub fn encode_list_subscriptions(&self, ticket: &str) -> Result<String, CodecError> {
        let frame = json!([{ "ticket": ticket }, { "method": "LIST_SUBSCRIPTIONS" }]);
        Ok(serde_json::to_string(&frame)?)
    }

    /// Decode and classify one inbound frame.
    ///
    /// # Errors
    ///
    /// - `Malformed` for invalid JSON or an unexpected shape
    /// - `UnknownKind` for an unrecognized `type`
    /// - `ChannelFault` for `error` frames and non-OK statuses
    pub fn decode(&self, raw: &str) -> Result<Inbound, CodecError> {
        let value: Value =
            serde_json::from_str(raw.trim()).map_err(|e| CodecError::Malformed(e.to_string()))?;

        let Value::Object(mut frame) = value else {
            return Err(CodecError::Malformed(format!(
                "expected JSON object, got: {}",
                preview(raw)
            )));
        };

        if let Some(error) = frame.get("error") {
            return Err(fault_from(error));
        }

        if frame.contains_key("method") {
            let response: AdminResponse = serde_json::from_value(Value::Object(frame))
                .map_err(|e| CodecError::Malformed(e.to_string()))?;
            return Ok(Inbound::Admin(response));
        }

        if !frame.contains_key("type")
            && !frame.contains_key("ty")
            && let Some(status) = frame.get("status")
        {
            let status = status.as_str().unwrap_or_default();
            return match status {
                "UP" | "OK" => Ok(Inbound::KeepAlive),
                other => Err(CodecError::ChannelFault {
                    code: other.to_string(),
                    message: format!("unexpected status: {}", preview(raw)),
                }),
            };
        }

        if compact::is_compact(&frame) {
            frame = compact::expand(frame);
        }

        let kind_name = match frame.remove("type") {
            Some(Value::String(name)) => name,
            _ => return Err(CodecError::Malformed("missing type".to_string())),
        };
        let kind =
            DataKind::from_wire(&kind_name).ok_or_else(|| CodecError::UnknownKind(kind_name))?;

        decode_payload(kind, Value::Object(frame)).map(Inbound::Event)
    }
}

fn decode_payload(kind: DataKind, payload: Value) -> Result<DecodedEvent, CodecError> {
    let malformed = |e: serde_json::Error| CodecError::Malformed(format!("{kind}: {e}"));

    let event = match kind {
        DataKind::Ticker => DecodedEvent::Ticker(serde_json::from_value(payload).map_err(malformed)?),
        DataKind::Trade => DecodedEvent::Trade(serde_json::from_value(payload).map_err(malformed)?),
        DataKind::Orderbook => {
            DecodedEvent::Orderbook(serde_json::from_value(payload).map_err(malformed)?)
        }
        DataKind::Candle(interval) => {
            let mut candle: crate::domain::streaming::CandleEvent =
                serde_json::from_value(payload).map_err(malformed)?;
            candle.interval = interval;
            DecodedEvent::Candle(candle)
        }
        DataKind::MyOrder => {
            DecodedEvent::MyOrder(serde_json::from_value(payload).map_err(malformed)?)
        }
        DataKind::MyAsset => {
            DecodedEvent::MyAsset(serde_json::from_value(payload).map_err(malformed)?)
        }
    };

    Ok(event)
}

fn fault_from(error: &Value) -> CodecError {
    match error {
        Value::Object(obj) => CodecError::ChannelFault {
            code: obj
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("UNKNOWN")
                .to_string(),
            message: obj
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        Value::String(s) => CodecError::ChannelFault {
            code: s.clone(),
            message: String::new(),
        },
        other => CodecError::ChannelFault {
            code: "UNKNOWN".to_string(),
            message: other.to_string(),
        },
    }
}

fn preview(raw: &str) -> String {
    raw.chars().take(50).collect()
}
