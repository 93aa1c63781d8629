//! Strike and contract resolution plus market data.
//!
//! - `strikes`: volatility-scaled strike window
//! - `contracts`: underlying and option contract ids
//! - `snapshot`: paged quotes with historical fallback
//! - `chain`: quotes and chains for callers

pub mod chain;
pub mod contracts;
pub mod snapshot;
pub mod strikes;
pub mod types;

pub use chain::{default_expiration, MarketService};
pub use contracts::{ContractKey, ContractResolver};
pub use snapshot::{SnapshotBatch, SnapshotFetcher};
pub use strikes::StrikeRange;
pub use types::{
    ChainLeg, ChainStrike, MarketDataSnapshot, OptionChain, OptionContract, OptionGreeks, OptionRight,
    Underlying, UnderlyingQuote,
};
