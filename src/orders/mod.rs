//! Order execution against the client portal.

pub mod executor;
pub mod response;
pub mod types;

pub use executor::{OptionOrder, OrderExecutor, OrderRequest};
pub use response::{decode_reply, normalize_ack, ReplyEntry, ReplyShape};
pub use types::{
    is_plausible_order_id, BracketAck, CancelOutcome, CancelReport, LedgerOrder, OpenOrder, OrderAck, OrderSide,
    OrderStatus, OrderType, ReconcileReport,
};
