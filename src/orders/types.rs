//! Order domain types shared by the executor and the ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" | "B" | "BOT" => Some(OrderSide::Buy),
            "SELL" | "S" | "SLD" => Some(OrderSide::Sell),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Order type, encoded the way the gateway expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MKT")]
    Market,
    #[serde(rename = "LMT")]
    Limit,
    #[serde(rename = "STP")]
    Stop,
    #[serde(rename = "STOP_LIMIT")]
    StopLimit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MKT",
            OrderType::Limit => "LMT",
            OrderType::Stop => "STP",
            OrderType::StopLimit => "STOP_LIMIT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MKT" | "MARKET" => Some(OrderType::Market),
            "LMT" | "LIMIT" => Some(OrderType::Limit),
            "STP" | "STOP" => Some(OrderType::Stop),
            "STOP_LIMIT" | "STP LMT" | "STPLMT" => Some(OrderType::StopLimit),
            _ => None,
        }
    }

    pub fn needs_price(&self) -> bool {
        matches!(self, OrderType::Limit | OrderType::StopLimit)
    }

    pub fn needs_stop(&self) -> bool {
        matches!(self, OrderType::Stop | OrderType::StopLimit)
    }
}

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Sent, awaiting confirmation or an upstream id
    PendingSubmit,
    /// Live at the broker
    Submitted,
    Filled,
    Cancelled,
    Rejected,
    Inactive,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingSubmit => "pending_submit",
            OrderStatus::Submitted => "submitted",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Inactive => "inactive",
        }
    }

    /// Parse both ledger spellings and gateway spellings
    /// (`PreSubmitted`, `PendingCancel`, `ApiCancelled`, ...).
    pub fn parse(s: &str) -> Option<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "pendingsubmit" | "apipending" => Some(OrderStatus::PendingSubmit),
            "submitted" | "presubmitted" => Some(OrderStatus::Submitted),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" | "canceled" | "apicancelled" | "pendingcancel" => {
                Some(OrderStatus::Cancelled)
            }
            "rejected" => Some(OrderStatus::Rejected),
            "inactive" => Some(OrderStatus::Inactive),
            _ => None,
        }
    }

    /// Filled, cancelled and rejected orders never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// A locally tracked order. Never deleted, only moved to a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerOrder {
    pub local_id: Uuid,
    /// Broker order id; `None` until the gateway assigns one
    pub upstream_id: Option<String>,
    pub symbol: String,
    pub conid: Option<i64>,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub status: OrderStatus,
    pub submitted_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Parent leg of a bracket
    pub parent_id: Option<Uuid>,
}

impl LedgerOrder {
    pub fn new(
        symbol: impl Into<String>,
        conid: Option<i64>,
        side: OrderSide,
        quantity: Decimal,
        order_type: OrderType,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            upstream_id: None,
            symbol: symbol.into(),
            conid,
            side,
            quantity,
            order_type,
            price: None,
            stop_price: None,
            status: OrderStatus::PendingSubmit,
            submitted_at,
            filled_at: None,
            cancelled_at: None,
            parent_id: None,
        }
    }

    /// Upstream ids the gateway would accept for a cancel: all digits.
    pub fn has_plausible_upstream_id(&self) -> bool {
        self.upstream_id.as_deref().is_some_and(is_plausible_order_id)
    }

    pub fn mark_cancelled(&mut self, at: DateTime<Utc>) {
        self.status = OrderStatus::Cancelled;
        self.cancelled_at.get_or_insert(at);
    }

    pub fn mark_filled(&mut self, at: DateTime<Utc>) {
        self.status = OrderStatus::Filled;
        self.filled_at.get_or_insert(at);
    }
}

/// Gateway order ids are numeric; anything else is a local placeholder.
pub fn is_plausible_order_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 19 && id.bytes().all(|b| b.is_ascii_digit())
}

/// Normalized result of an order submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderAck {
    pub id: String,
    pub status: String,
}

/// Result of a bracket submission.
#[derive(Debug, Clone, Serialize)]
pub struct BracketAck {
    pub parent: OrderAck,
    pub stop: OrderAck,
    pub parent_local_id: Uuid,
    pub stop_local_id: Uuid,
}

/// An open order as listed by the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub conid: Option<i64>,
    pub symbol: String,
    pub side: Option<OrderSide>,
    pub order_type: Option<OrderType>,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub price: Option<Decimal>,
    pub status: String,
}

/// Outcome of a single cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    /// The gateway no longer knows the order; it is already resolved
    NotFound,
    Failed,
}

/// Summary of `cancel_all_orders`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CancelReport {
    /// Whether the ids came from the local ledger instead of the gateway
    pub from_ledger: bool,
    pub attempted: Vec<String>,
    pub cancelled: Vec<String>,
    pub not_found: Vec<String>,
    pub failed: Vec<String>,
    /// Ledger entries skipped because their upstream id is not a real order id
    pub skipped: Vec<String>,
    /// Ledger entries moved to `Cancelled`
    pub reconciled: usize,
}

/// Summary of `reconcile_orders`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub filled: Vec<String>,
    pub cancelled: Vec<String>,
    pub rejected: Vec<String>,
    pub still_open: Vec<String>,
}
