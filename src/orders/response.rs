//! Order submission replies.
//!
//! The gateway answers an order or confirmation call in one of five
//! envelopes depending on endpoint and account flavour:
//!
//! | shape     | example                                   |
//! |-----------|-------------------------------------------|
//! | `Bare`    | `{"order_id": "1", "order_status": "..."}` |
//! | `Array`   | `[{"order_id": "1", ...}]`                  |
//! | `Orders`  | `{"orders": [...]}`                         |
//! | `Data`    | `{"data": [...]}`                           |
//! | `Reply`   | `{"reply": [...]}`                          |
//!
//! Each entry is then either an acknowledgement, a confirmation prompt or a
//! rejection. Anything else is [`ReplyShape::Unrecognized`] and becomes an
//! error after being logged.

use super::types::OrderAck;
use crate::error::{BrokerError, Result};
use serde_json::Value;
use tracing::warn;

/// Envelope the gateway wrapped its reply in.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyShape {
    Bare(Value),
    Array(Vec<Value>),
    Orders(Vec<Value>),
    Data(Vec<Value>),
    Reply(Vec<Value>),
    Unrecognized(Value),
}

const ENVELOPE_KEYS: [&str; 3] = ["orders", "data", "reply"];

/// Keys that mark an object as an order entry rather than an envelope.
const ENTRY_KEYS: [&str; 6] = ["order_id", "orderId", "id", "error", "message", "order_status"];

impl ReplyShape {
    pub fn classify(body: Value) -> Self {
        match body {
            Value::Array(items) => ReplyShape::Array(items),
            Value::Object(mut map) => {
                let envelope = ENVELOPE_KEYS.into_iter().find(|k| map.contains_key(*k));
                if let Some(key) = envelope {
                    let items = match map.remove(key) {
                        Some(Value::Array(items)) => items,
                        Some(inner @ Value::Object(_)) => vec![inner],
                        Some(other) => {
                            map.insert(key.to_string(), other);
                            return ReplyShape::Unrecognized(Value::Object(map));
                        }
                        None => Vec::new(),
                    };
                    return match key {
                        "orders" => ReplyShape::Orders(items),
                        "data" => ReplyShape::Data(items),
                        _ => ReplyShape::Reply(items),
                    };
                }
                if ENTRY_KEYS.iter().any(|k| map.contains_key(*k)) {
                    ReplyShape::Bare(Value::Object(map))
                } else {
                    ReplyShape::Unrecognized(Value::Object(map))
                }
            }
            other => ReplyShape::Unrecognized(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReplyShape::Bare(_) => "bare",
            ReplyShape::Array(_) => "array",
            ReplyShape::Orders(_) => "orders",
            ReplyShape::Data(_) => "data",
            ReplyShape::Reply(_) => "reply",
            ReplyShape::Unrecognized(_) => "unrecognized",
        }
    }

    /// Entries carried by the envelope, `None` when unrecognized.
    pub fn into_entries(self) -> Option<Vec<Value>> {
        match self {
            ReplyShape::Bare(entry) => Some(vec![entry]),
            ReplyShape::Array(items)
            | ReplyShape::Orders(items)
            | ReplyShape::Data(items)
            | ReplyShape::Reply(items) => Some(items),
            ReplyShape::Unrecognized(_) => None,
        }
    }
}

/// One order entry inside a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyEntry {
    /// The order is live (or at least accepted) upstream
    Placed {
        ack: OrderAck,
        /// Client order id echoed back, when present
        local_ref: Option<String>,
    },
    /// A precautionary warning that must be confirmed via `/iserver/reply/{id}`
    Prompt { reply_id: String, messages: Vec<String> },
    Rejected { code: Option<String>, message: String },
    Unknown(Value),
}

fn string_field(entry: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match entry.get(*k)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn messages(entry: &Value) -> Vec<String> {
    match entry.get("message") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|m| m.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

impl ReplyEntry {
    pub fn parse(entry: Value) -> Self {
        if let Some(message) = string_field(&entry, &["error"]) {
            return ReplyEntry::Rejected {
                code: string_field(&entry, &["code", "messageIds"]),
                message,
            };
        }

        let status = string_field(&entry, &["order_status", "status"]);
        if let Some(id) = string_field(&entry, &["order_id", "orderId"]) {
            let status = status.unwrap_or_else(|| "Submitted".to_string());
            if status.eq_ignore_ascii_case("rejected") {
                return ReplyEntry::Rejected {
                    code: None,
                    message: string_field(&entry, &["text", "warning_message"])
                        .unwrap_or_else(|| format!("order {id} rejected")),
                };
            }
            return ReplyEntry::Placed {
                ack: OrderAck { id, status },
                local_ref: string_field(&entry, &["local_order_id", "cOID"]),
            };
        }

        if let Some(reply_id) = string_field(&entry, &["id"]) {
            let messages = messages(&entry);
            if !messages.is_empty() || entry.get("isSuppressed").is_some() {
                return ReplyEntry::Prompt { reply_id, messages };
            }
        }

        ReplyEntry::Unknown(entry)
    }
}

/// Decode a reply body into its entries.
pub fn decode_reply(body: Value) -> Result<Vec<ReplyEntry>> {
    let shape = ReplyShape::classify(body);
    let name = shape.name();
    match shape {
        ReplyShape::Unrecognized(raw) => {
            warn!(body = %raw, "Unrecognized order reply shape");
            Err(BrokerError::Decode(format!("unrecognized order reply: {raw}")))
        }
        shape => {
            let entries: Vec<ReplyEntry> = shape
                .into_entries()
                .unwrap_or_default()
                .into_iter()
                .map(ReplyEntry::parse)
                .collect();
            if entries.is_empty() {
                warn!(shape = name, "Order reply carried no entries");
                return Err(BrokerError::Decode(format!("empty {name} order reply")));
            }
            Ok(entries)
        }
    }
}

/// Single acknowledgement from a reply, whatever its envelope.
pub fn normalize_ack(body: Value) -> Result<OrderAck> {
    let mut unknown = Vec::new();
    for entry in decode_reply(body)? {
        match entry {
            ReplyEntry::Placed { ack, .. } => return Ok(ack),
            ReplyEntry::Rejected { code, message } => return Err(BrokerError::rejected(code, message)),
            ReplyEntry::Prompt { reply_id, .. } => {
                return Err(BrokerError::Decode(format!(
                    "reply {reply_id} still awaits confirmation"
                )))
            }
            ReplyEntry::Unknown(raw) => unknown.push(raw),
        }
    }
    warn!(entries = ?unknown, "Order reply entries not recognized");
    Err(BrokerError::Decode(format!(
        "no order id in reply: {}",
        Value::Array(unknown)
    )))
}
