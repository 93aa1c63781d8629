//! Underlying and option contract resolution.
//!
//! Underlyings come from a fixed table or a ranked symbol search; option
//! contracts are looked up one strike at a time, paced, and must match the
//! requested maturity exactly. Both are cached for the client's lifetime.

use super::types::{OptionContract, OptionRight, Underlying};
use crate::error::{BrokerError, Result};
use crate::gateway::types::{SecdefInfo, SecdefSearchResult, StrikesResponse};
use crate::gateway::{ApiRequest, AuthedGateway};
use crate::utils::decimal::normalize_strike;
use chrono::NaiveDate;
use parking_lot::Mutex;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Underlyings that never need a search.
pub const FIXED_UNDERLYINGS: [(&str, i64); 5] = [
    ("SPY", 756_733),
    ("QQQ", 320_227_571),
    ("IWM", 9_579_970),
    ("SPX", 416_904),
    ("VIX", 13_455_763),
];

/// Listing exchanges accepted from a search, most preferred first.
const PREFERRED_EXCHANGES: [&str; 6] = ["ARCA", "NASDAQ", "NYSE", "AMEX", "CBOE", "BATS"];

/// Cache key for a resolved option contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContractKey {
    pub symbol: String,
    pub expiration: NaiveDate,
    pub right: OptionRight,
    pub strike: Decimal,
}

impl ContractKey {
    pub fn new(symbol: &str, expiration: NaiveDate, right: OptionRight, strike: Decimal) -> Self {
        Self {
            symbol: symbol.to_ascii_uppercase(),
            expiration,
            right,
            strike: normalize_strike(strike),
        }
    }
}

/// Option month code used by the secdef endpoints, e.g. `DEC25`.
pub fn month_code(expiration: NaiveDate) -> String {
    expiration.format("%b%y").to_string().to_ascii_uppercase()
}

pub fn fixed_underlying(symbol: &str) -> Option<i64> {
    let symbol = symbol.to_ascii_uppercase();
    FIXED_UNDERLYINGS
        .iter()
        .find(|(s, _)| *s == symbol)
        .map(|(_, conid)| *conid)
}

/// Resolves symbols and option contracts to contract ids.
pub struct ContractResolver {
    gateway: AuthedGateway,
    pacing: Duration,
    underlyings: Mutex<HashMap<String, i64>>,
    contracts: Mutex<HashMap<ContractKey, i64>>,
}

impl ContractResolver {
    pub fn new(gateway: AuthedGateway, pacing: Duration) -> Self {
        Self {
            gateway,
            pacing,
            underlyings: Mutex::new(HashMap::new()),
            contracts: Mutex::new(HashMap::new()),
        }
    }

    #[instrument(skip(self))]
    pub async fn resolve_underlying(&self, symbol: &str) -> Result<Underlying> {
        let symbol = symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            return Err(BrokerError::ResolutionFailed("empty symbol".into()));
        }

        if let Some(conid) = fixed_underlying(&symbol) {
            return Ok(Underlying { symbol, conid });
        }
        if let Some(conid) = self.underlyings.lock().get(&symbol).copied() {
            return Ok(Underlying { symbol, conid });
        }

        let req = ApiRequest::get("/iserver/secdef/search").query("symbol", &symbol);
        let hits: Vec<SecdefSearchResult> = match self.gateway.call(&req).await?.body {
            serde_json::Value::Array(items) => items
                .into_iter()
                .filter_map(|v| serde_json::from_value(v).ok())
                .collect(),
            _ => Vec::new(),
        };

        let conid = rank_search_results(&symbol, &hits).ok_or_else(|| {
            BrokerError::ResolutionFailed(format!("no listing found for {symbol}"))
        })?;

        debug!(symbol = %symbol, conid, candidates = hits.len(), "Underlying resolved by search");
        self.underlyings.lock().insert(symbol.clone(), conid);
        Ok(Underlying { symbol, conid })
    }

    /// Listed strikes for an expiration month (calls and puts merged).
    #[instrument(skip(self), fields(symbol = %underlying.symbol))]
    pub async fn strikes(&self, underlying: &Underlying, expiration: NaiveDate) -> Result<Vec<Decimal>> {
        let req = ApiRequest::get("/iserver/secdef/strikes")
            .query("conid", underlying.conid)
            .query("sectype", "OPT")
            .query("month", month_code(expiration));
        let listed: StrikesResponse = self.gateway.call_json(&req).await?;

        let mut strikes: Vec<Decimal> = listed
            .call
            .iter()
            .chain(listed.put.iter())
            .filter_map(|s| Decimal::from_f64(*s))
            .map(normalize_strike)
            .collect();
        strikes.sort();
        strikes.dedup();

        if strikes.is_empty() {
            return Err(BrokerError::ResolutionFailed(format!(
                "no strikes listed for {} {}",
                underlying.symbol,
                month_code(expiration)
            )));
        }
        Ok(strikes)
    }

    /// Resolve one contract; cached per (symbol, expiration, right, strike).
    #[instrument(skip(self), fields(symbol = %underlying.symbol))]
    pub async fn resolve_contract(
        &self,
        underlying: &Underlying,
        expiration: NaiveDate,
        right: OptionRight,
        strike: Decimal,
    ) -> Result<OptionContract> {
        let key = ContractKey::new(&underlying.symbol, expiration, right, strike);
        if let Some(conid) = self.contracts.lock().get(&key).copied() {
            return Ok(contract_from_key(&key, conid));
        }

        let req = ApiRequest::get("/iserver/secdef/info")
            .query("conid", underlying.conid)
            .query("sectype", "OPT")
            .query("month", month_code(expiration))
            .query("right", right.code())
            .query("strike", key.strike);
        let candidates: Vec<SecdefInfo> = match self.gateway.call(&req).await?.body {
            serde_json::Value::Array(items) => items
                .into_iter()
                .filter_map(|v| serde_json::from_value(v).ok())
                .collect(),
            _ => Vec::new(),
        };

        let maturity = expiration.format("%Y%m%d").to_string();
        let conid = candidates
            .iter()
            .find(|c| c.maturity_date.as_deref() == Some(maturity.as_str()))
            .map(|c| c.conid)
            .ok_or_else(|| {
                BrokerError::ResolutionFailed(format!(
                    "no {} {}{} contract maturing {maturity} ({} candidates)",
                    underlying.symbol,
                    key.strike,
                    right,
                    candidates.len()
                ))
            })?;

        debug!(strike = %key.strike, right = %right, conid, "Contract resolved");
        self.contracts.lock().insert(key.clone(), conid);
        Ok(contract_from_key(&key, conid))
    }

    /// Resolve many contracts one at a time, pausing between network
    /// lookups. Strikes that cannot be resolved are skipped.
    pub async fn resolve_contracts(
        &self,
        underlying: &Underlying,
        expiration: NaiveDate,
        strikes: &[Decimal],
        rights: &[OptionRight],
    ) -> Result<Vec<OptionContract>> {
        let mut resolved = Vec::with_capacity(strikes.len() * rights.len());
        let mut looked_up = false;

        for strike in strikes {
            for right in rights {
                let cached = self.is_cached(&underlying.symbol, expiration, *right, *strike);
                if !cached && looked_up {
                    self.gateway.pause(self.pacing).await;
                }
                looked_up |= !cached;

                match self.resolve_contract(underlying, expiration, *right, *strike).await {
                    Ok(contract) => resolved.push(contract),
                    Err(BrokerError::ResolutionFailed(reason)) => {
                        warn!(strike = %strike, right = %right, reason = %reason, "Skipping unresolvable strike");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(resolved)
    }

    pub fn is_cached(&self, symbol: &str, expiration: NaiveDate, right: OptionRight, strike: Decimal) -> bool {
        self.contracts
            .lock()
            .contains_key(&ContractKey::new(symbol, expiration, right, strike))
    }

    pub fn cached_contracts(&self) -> usize {
        self.contracts.lock().len()
    }
}

fn contract_from_key(key: &ContractKey, conid: i64) -> OptionContract {
    OptionContract {
        conid,
        symbol: key.symbol.clone(),
        expiration: key.expiration,
        right: key.right,
        strike: key.strike,
    }
}

/// Pick the best search hit: exact symbol match on a preferred exchange
/// required, then options listed, then exchange preference.
fn rank_search_results(symbol: &str, hits: &[SecdefSearchResult]) -> Option<i64> {
    hits.iter()
        .filter(|h| {
            h.symbol
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case(symbol))
        })
        .filter_map(|h| {
            let exchange = h.description.as_deref().and_then(|d| {
                PREFERRED_EXCHANGES
                    .iter()
                    .position(|e| d.eq_ignore_ascii_case(e))
            });
            if exchange.is_none() {
                debug!(conid = h.conid, listing = ?h.description, "Ignoring listing on unsupported exchange");
            }
            exchange.map(|rank| (h, rank))
        })
        .min_by_key(|(h, rank)| {
            let has_options = h
                .sections
                .iter()
                .any(|s| s.sec_type.as_deref() == Some("OPT"));
            (!has_options, *rank)
        })
        .map(|(h, _)| h.conid)
}
