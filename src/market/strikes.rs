//! Volatility-scaled strike window.
//!
//! `expected_move = P × (V / 100) × sqrt(d / 252)`
//! `half_width = max(4 × expected_move, $20)`
//!
//! A pure function of its inputs; never cached.

use crate::error::{BrokerError, Result};
use chrono::{Datelike, NaiveDate, Weekday};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;
use serde::Serialize;

/// Standard deviations covered on each side of spot.
pub const SIGMA_MULTIPLIER: Decimal = dec!(4);

/// Minimum half-width of the window in dollars.
pub const MIN_HALF_WIDTH: Decimal = dec!(20);

pub const TRADING_DAYS_PER_YEAR: Decimal = dec!(252);

/// Strike window around the underlying price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StrikeRange {
    pub underlying_price: Decimal,
    /// Annualized volatility proxy in percent (VIX points)
    pub volatility_pct: Decimal,
    pub horizon_days: u32,
    pub expected_move: Decimal,
    pub half_width: Decimal,
    pub low: Decimal,
    pub high: Decimal,
}

impl StrikeRange {
    /// Compute the window. A zero horizon is treated as one day.
    pub fn compute(underlying_price: Decimal, volatility_pct: Decimal, horizon_days: u32) -> Result<Self> {
        if underlying_price <= Decimal::ZERO {
            return Err(BrokerError::ResolutionFailed(format!(
                "invalid underlying price {underlying_price}"
            )));
        }
        if volatility_pct < Decimal::ZERO {
            return Err(BrokerError::ResolutionFailed(format!(
                "invalid volatility {volatility_pct}"
            )));
        }

        let horizon_days = horizon_days.max(1);
        let years = Decimal::from(horizon_days) / TRADING_DAYS_PER_YEAR;
        let root = years.sqrt().ok_or_else(|| {
            BrokerError::ResolutionFailed(format!("cannot take sqrt of horizon {years}"))
        })?;

        let expected_move = underlying_price * (volatility_pct / Decimal::ONE_HUNDRED) * root;
        let half_width = (SIGMA_MULTIPLIER * expected_move).max(MIN_HALF_WIDTH);

        Ok(Self {
            underlying_price,
            volatility_pct,
            horizon_days,
            expected_move,
            half_width,
            low: underlying_price - half_width,
            high: underlying_price + half_width,
        })
    }

    /// Same as [`compute`](Self::compute) with an `f64` volatility proxy.
    pub fn from_vol_f64(underlying_price: Decimal, volatility_pct: f64, horizon_days: u32) -> Result<Self> {
        let vol = Decimal::from_f64(volatility_pct).ok_or_else(|| {
            BrokerError::ResolutionFailed(format!("invalid volatility {volatility_pct}"))
        })?;
        Self::compute(underlying_price, vol, horizon_days)
    }

    pub fn contains(&self, strike: Decimal) -> bool {
        strike >= self.low && strike <= self.high
    }

    /// Strikes inside the window, sorted and deduplicated.
    pub fn filter(&self, strikes: &[Decimal]) -> Vec<Decimal> {
        let mut inside: Vec<Decimal> = strikes
            .iter()
            .copied()
            .filter(|s| self.contains(*s))
            .map(|s| s.normalize())
            .collect();
        inside.sort();
        inside.dedup();
        inside
    }
}

/// Weekdays strictly after `from` up to and including `to`; at least one.
pub fn weekday_horizon(from: NaiveDate, to: NaiveDate) -> u32 {
    let mut days = 0;
    let mut day = from;
    while day < to {
        day = day.succ_opt().unwrap_or(to);
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            days += 1;
        }
    }
    days.max(1)
}
