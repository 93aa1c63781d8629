//! Core types for option contracts and quotes.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Options contract right (call or put).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionRight {
    Call,
    Put,
}

impl OptionRight {
    /// Single-letter code used by the gateway.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Call => "C",
            Self::Put => "P",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "C" | "CALL" => Some(Self::Call),
            "P" | "PUT" => Some(Self::Put),
            _ => None,
        }
    }
}

impl std::fmt::Display for OptionRight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A resolved underlying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Underlying {
    pub symbol: String,
    pub conid: i64,
}

/// A resolved option contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionContract {
    pub conid: i64,
    pub symbol: String,
    pub expiration: NaiveDate,
    pub right: OptionRight,
    pub strike: Decimal,
}

impl OptionContract {
    /// Human-readable name, e.g. `SPY 595P 2025-12-05`.
    pub fn display_name(&self) -> String {
        format!("{} {}{} {}", self.symbol, self.strike, self.right, self.expiration)
    }
}

/// Option greeks snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionGreeks {
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
}

/// Quote for one contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarketDataSnapshot {
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub last: Option<Decimal>,
    pub greeks: OptionGreeks,
    pub implied_vol: Option<f64>,
    pub open_interest: Option<u64>,
    /// Gateway freshness stamp
    pub updated_at: Option<DateTime<Utc>>,
    /// Prices synthesized from the most recent historical close
    pub is_historical: bool,
}

impl MarketDataSnapshot {
    /// No bid, ask or last price.
    pub fn is_empty(&self) -> bool {
        self.bid.is_none() && self.ask.is_none() && self.last.is_none()
    }

    pub fn mid(&self) -> Option<Decimal> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => self.last,
        }
    }
}

/// One strike of a chain with its resolved call and put.
#[derive(Debug, Clone, Serialize)]
pub struct ChainStrike {
    pub strike: Decimal,
    pub call: Option<ChainLeg>,
    pub put: Option<ChainLeg>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainLeg {
    pub conid: i64,
    pub quote: MarketDataSnapshot,
}

/// Option chain restricted to the volatility band around spot.
#[derive(Debug, Clone, Serialize)]
pub struct OptionChain {
    pub symbol: String,
    pub underlying_conid: i64,
    pub expiration: NaiveDate,
    pub underlying_price: Decimal,
    pub range: super::StrikeRange,
    pub strikes: Vec<ChainStrike>,
    /// Any quote came from historical closes
    pub is_historical: bool,
}

/// Quote for an underlying plus the volatility proxy.
#[derive(Debug, Clone, Serialize)]
pub struct UnderlyingQuote {
    pub symbol: String,
    pub conid: i64,
    pub quote: MarketDataSnapshot,
    pub volatility_pct: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_right_codes() {
        assert_eq!(OptionRight::parse("put"), Some(OptionRight::Put));
        assert_eq!(OptionRight::parse("C"), Some(OptionRight::Call));
        assert_eq!(OptionRight::parse("X"), None);
        assert_eq!(OptionRight::Put.to_string(), "P");
    }

    #[test]
    fn test_snapshot_mid() {
        let quote = MarketDataSnapshot {
            bid: Some(dec!(1.10)),
            ask: Some(dec!(1.20)),
            ..Default::default()
        };
        assert_eq!(quote.mid(), Some(dec!(1.15)));
        assert!(!quote.is_empty());
        assert!(MarketDataSnapshot::default().is_empty());
    }

    #[test]
    fn test_display_name() {
        let contract = OptionContract {
            conid: 1,
            symbol: "SPY".into(),
            expiration: NaiveDate::from_ymd_opt(2025, 12, 5).unwrap(),
            right: OptionRight::Put,
            strike: dec!(595),
        };
        assert_eq!(contract.display_name(), "SPY 595P 2025-12-05");
    }
}
