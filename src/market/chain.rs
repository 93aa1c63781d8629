//! Underlying quotes and volatility-banded option chains.

use super::contracts::{fixed_underlying, ContractResolver};
use super::snapshot::SnapshotFetcher;
use super::strikes::{weekday_horizon, StrikeRange};
use super::types::{ChainLeg, ChainStrike, OptionChain, OptionRight, UnderlyingQuote};
use crate::error::{BrokerError, Result};
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc, Weekday};
use chrono_tz::America::New_York;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Volatility proxy symbol.
pub const VOLATILITY_SYMBOL: &str = "VIX";

/// Regular session close, New York hour.
const MARKET_CLOSE_HOUR: u32 = 16;

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn next_weekday(mut date: NaiveDate) -> NaiveDate {
    loop {
        date = match date.succ_opt() {
            Some(next) => next,
            None => return date,
        };
        if !is_weekend(date) {
            return date;
        }
    }
}

/// Today's date in New York if it is a weekday before the 16:00 close,
/// otherwise the next weekday.
pub fn default_expiration(now: DateTime<Utc>) -> NaiveDate {
    let local = now.with_timezone(&New_York);
    let today = local.date_naive();
    if !is_weekend(today) && local.hour() < MARKET_CLOSE_HOUR {
        today
    } else {
        next_weekday(today)
    }
}

/// New York calendar date for `now`.
pub fn trading_date(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&New_York).date_naive()
}

/// Quotes and chains on top of contract resolution and snapshots.
pub struct MarketService {
    resolver: Arc<ContractResolver>,
    snapshots: SnapshotFetcher,
    default_volatility_pct: f64,
}

impl MarketService {
    pub fn new(resolver: Arc<ContractResolver>, snapshots: SnapshotFetcher, default_volatility_pct: f64) -> Self {
        Self {
            resolver,
            snapshots,
            default_volatility_pct,
        }
    }

    pub fn resolver(&self) -> &Arc<ContractResolver> {
        &self.resolver
    }

    /// Quote for an underlying plus the current volatility proxy.
    #[instrument(skip(self))]
    pub async fn get_market_data(&self, symbol: &str) -> Result<UnderlyingQuote> {
        let underlying = self.resolver.resolve_underlying(symbol).await?;
        let batch = self.snapshots.fetch(&[underlying.conid]).await?;
        let quote = batch.quote(underlying.conid);
        if quote.is_empty() {
            return Err(BrokerError::MarketDataUnavailable(underlying.symbol));
        }

        let volatility_pct = if underlying.symbol == VOLATILITY_SYMBOL {
            quote
                .last
                .and_then(|v| v.to_f64())
                .unwrap_or(self.default_volatility_pct)
        } else {
            self.volatility_proxy().await
        };

        Ok(UnderlyingQuote {
            symbol: underlying.symbol,
            conid: underlying.conid,
            quote,
            volatility_pct,
        })
    }

    /// VIX last (historical close off-hours), else the configured default.
    pub async fn volatility_proxy(&self) -> f64 {
        let Some(conid) = fixed_underlying(VOLATILITY_SYMBOL) else {
            return self.default_volatility_pct;
        };
        match self.snapshots.fetch(&[conid]).await {
            Ok(batch) => match batch.quote(conid).last.and_then(|v| v.to_f64()) {
                Some(vix) if vix > 0.0 => vix,
                _ => {
                    warn!(default = self.default_volatility_pct, "No VIX level available, using default volatility");
                    self.default_volatility_pct
                }
            },
            Err(e) => {
                warn!(error = %e, default = self.default_volatility_pct, "VIX lookup failed, using default volatility");
                self.default_volatility_pct
            }
        }
    }

    /// Chain for `symbol` restricted to the volatility band around spot.
    /// `expiration` defaults to [`default_expiration`].
    #[instrument(skip(self, now))]
    pub async fn get_option_chain_with_strikes(
        &self,
        symbol: &str,
        expiration: Option<NaiveDate>,
        now: DateTime<Utc>,
    ) -> Result<OptionChain> {
        let today = trading_date(now);
        let expiration = expiration.unwrap_or_else(|| default_expiration(now));
        if expiration < today {
            return Err(BrokerError::ResolutionFailed(format!(
                "expiration {expiration} is in the past"
            )));
        }

        let spot = self.get_market_data(symbol).await?;
        let price = spot
            .quote
            .last
            .or_else(|| spot.quote.mid())
            .filter(|p| *p > Decimal::ZERO)
            .ok_or_else(|| BrokerError::MarketDataUnavailable(spot.symbol.clone()))?;

        let horizon = weekday_horizon(today, expiration);
        let range = StrikeRange::from_vol_f64(price, spot.volatility_pct, horizon)?;
        debug!(
            price = %price,
            vol = spot.volatility_pct,
            horizon,
            low = %range.low,
            high = %range.high,
            "Strike window computed"
        );

        let underlying = self.resolver.resolve_underlying(symbol).await?;
        let listed = self.resolver.strikes(&underlying, expiration).await?;
        let strikes = range.filter(&listed);
        if strikes.is_empty() {
            return Err(BrokerError::ResolutionFailed(format!(
                "no {} strikes between {} and {}",
                underlying.symbol, range.low, range.high
            )));
        }

        let contracts = self
            .resolver
            .resolve_contracts(&underlying, expiration, &strikes, &[OptionRight::Call, OptionRight::Put])
            .await?;
        let conids: Vec<i64> = contracts.iter().map(|c| c.conid).collect();
        let batch = self.snapshots.fetch(&conids).await?;

        let mut rows: BTreeMap<Decimal, ChainStrike> = BTreeMap::new();
        for contract in &contracts {
            let row = rows.entry(contract.strike).or_insert_with(|| ChainStrike {
                strike: contract.strike,
                call: None,
                put: None,
            });
            let leg = Some(ChainLeg {
                conid: contract.conid,
                quote: batch.quote(contract.conid),
            });
            match contract.right {
                OptionRight::Call => row.call = leg,
                OptionRight::Put => row.put = leg,
            }
        }

        let is_historical = batch.is_historical || spot.quote.is_historical;
        info!(
            symbol = %underlying.symbol,
            expiration = %expiration,
            strikes = rows.len(),
            contracts = contracts.len(),
            is_historical,
            "Option chain built"
        );

        Ok(OptionChain {
            symbol: underlying.symbol,
            underlying_conid: underlying.conid,
            expiration,
            underlying_price: price,
            range,
            strikes: rows.into_values().collect(),
            is_historical,
        })
    }
}
