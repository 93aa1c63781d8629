//! Paged market-data snapshots with an off-hours fallback.
//!
//! The gateway only starts streaming a contract after it has been asked for
//! once, so every page is requested twice: a priming call, a short pause, then
//! the real fetch. If at least 80% of a page is still empty after one more
//! fetch the market is treated as closed and quotes are synthesized from the
//! most recent historical close with a ±2% spread.

use super::types::{MarketDataSnapshot, OptionGreeks};
use crate::config::MarketDataConfig;
use crate::error::{BrokerError, Result};
use crate::gateway::types::HistoryResponse;
use crate::gateway::{ApiRequest, AuthedGateway};
use crate::utils::decimal::{decimal_from_value, f64_from_value, round_to_tick};
use chrono::{TimeZone, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Share of empty quotes at which a page counts as "market closed".
pub const EMPTY_PAGE_THRESHOLD: Decimal = dec!(0.80);

/// Half-spread applied around a historical close.
pub const HISTORICAL_SPREAD: Decimal = dec!(0.02);

const PRICE_TICK: Decimal = dec!(0.01);

pub const FIELD_LAST: &str = "31";
pub const FIELD_BID: &str = "84";
pub const FIELD_ASK: &str = "86";
pub const FIELD_DELTA: &str = "7308";
pub const FIELD_GAMMA: &str = "7309";
pub const FIELD_THETA: &str = "7310";
pub const FIELD_VEGA: &str = "7311";
pub const FIELD_IMPLIED_VOL: &str = "7633";
pub const FIELD_OPEN_INTEREST: &str = "7638";

/// Fields requested on every snapshot call.
pub const SNAPSHOT_FIELDS: &str = "31,84,86,7308,7309,7310,7311,7633,7638";

/// Quotes for a batch of contracts.
#[derive(Debug, Clone, Default)]
pub struct SnapshotBatch {
    pub quotes: HashMap<i64, MarketDataSnapshot>,
    /// The batch fell back to historical closes
    pub is_historical: bool,
}

impl SnapshotBatch {
    pub fn quote(&self, conid: i64) -> MarketDataSnapshot {
        self.quotes.get(&conid).cloned().unwrap_or_default()
    }
}

/// Fetches snapshots page by page.
pub struct SnapshotFetcher {
    gateway: AuthedGateway,
    page_size: usize,
    prime_delay: Duration,
    history_period: String,
}

impl SnapshotFetcher {
    pub fn new(gateway: AuthedGateway, config: &MarketDataConfig) -> Self {
        Self {
            gateway,
            page_size: config.snapshot_page_size.max(1),
            prime_delay: config.prime_delay(),
            history_period: config.history_period.clone(),
        }
    }

    #[instrument(skip(self, conids), fields(contracts = conids.len()))]
    pub async fn fetch(&self, conids: &[i64]) -> Result<SnapshotBatch> {
        let mut batch = SnapshotBatch::default();

        for page in conids.chunks(self.page_size) {
            let mut rows = self.prime_and_fetch(page).await?;
            if mostly_empty(page, &rows) {
                debug!(page = page.len(), "Snapshot page mostly empty, retrying once");
                self.gateway.pause(self.prime_delay).await;
                rows = self.fetch_rows(page).await?;
            }

            if mostly_empty(page, &rows) {
                warn!(page = page.len(), "Snapshot still empty, treating market as closed");
                // Remaining pages and earlier empty quotes all come from history
                batch.is_historical = true;
                batch.quotes.extend(rows);
                self.fill_from_history(conids, &mut batch).await?;
                break;
            }
            batch.quotes.extend(rows);
        }

        Ok(batch)
    }

    async fn prime_and_fetch(&self, page: &[i64]) -> Result<HashMap<i64, MarketDataSnapshot>> {
        self.fetch_rows(page).await?;
        self.gateway.pause(self.prime_delay).await;
        self.fetch_rows(page).await
    }

    async fn fetch_rows(&self, page: &[i64]) -> Result<HashMap<i64, MarketDataSnapshot>> {
        let conids = page
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let req = ApiRequest::get("/iserver/marketdata/snapshot")
            .query("conids", conids)
            .query("fields", SNAPSHOT_FIELDS);
        let resp = self.gateway.call(&req).await?;

        let rows = match resp.body {
            Value::Array(rows) => rows,
            _ => Vec::new(),
        };
        Ok(rows.iter().filter_map(parse_snapshot_row).collect())
    }

    /// Replace empty quotes for `conids` with synthesized historical ones.
    /// Contracts without history keep their empty quote.
    async fn fill_from_history(&self, conids: &[i64], batch: &mut SnapshotBatch) -> Result<()> {
        for conid in conids {
            if batch.quotes.get(conid).is_some_and(|q| !q.is_empty()) {
                continue;
            }
            match self.historical_quote(*conid).await? {
                Some(quote) => {
                    batch.quotes.insert(*conid, quote);
                }
                None => {
                    debug!(conid, "No historical close available");
                    batch.quotes.entry(*conid).or_default();
                }
            }
        }
        Ok(())
    }

    /// Quote built from the most recent daily close, or `None` without history.
    pub async fn historical_quote(&self, conid: i64) -> Result<Option<MarketDataSnapshot>> {
        let req = ApiRequest::get("/iserver/marketdata/history")
            .query("conid", conid)
            .query("period", &self.history_period)
            .query("bar", "1d")
            .history();

        let history: HistoryResponse = match self.gateway.call_json(&req).await {
            Ok(history) => history,
            Err(e @ (BrokerError::Http { .. } | BrokerError::Decode(_))) => {
                debug!(conid, error = %e, "History unavailable");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        Ok(history
            .last_close()
            .and_then(Decimal::from_f64)
            .map(synthesize_from_close))
    }
}

/// Bid/ask at ∓2% of the close, last at the close.
pub fn synthesize_from_close(close: Decimal) -> MarketDataSnapshot {
    MarketDataSnapshot {
        bid: Some(round_to_tick(close * (Decimal::ONE - HISTORICAL_SPREAD), PRICE_TICK)),
        ask: Some(round_to_tick(close * (Decimal::ONE + HISTORICAL_SPREAD), PRICE_TICK)),
        last: Some(close),
        is_historical: true,
        ..Default::default()
    }
}

/// Missing rows count as empty.
fn mostly_empty(page: &[i64], rows: &HashMap<i64, MarketDataSnapshot>) -> bool {
    if page.is_empty() {
        return false;
    }
    let empty = page
        .iter()
        .filter(|c| rows.get(*c).map_or(true, MarketDataSnapshot::is_empty))
        .count();
    Decimal::from(empty) >= Decimal::from(page.len()) * EMPTY_PAGE_THRESHOLD
}

fn row_conid(row: &Value) -> Option<i64> {
    let conid = row.get("conid")?;
    conid
        .as_i64()
        .or_else(|| conid.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Parse one snapshot row keyed by field code.
pub fn parse_snapshot_row(row: &Value) -> Option<(i64, MarketDataSnapshot)> {
    let conid = row_conid(row)?;
    let price = |field: &str| row.get(field).and_then(decimal_from_value);
    let float = |field: &str| row.get(field).and_then(f64_from_value);

    let quote = MarketDataSnapshot {
        bid: price(FIELD_BID),
        ask: price(FIELD_ASK),
        last: price(FIELD_LAST),
        greeks: OptionGreeks {
            delta: float(FIELD_DELTA),
            gamma: float(FIELD_GAMMA),
            theta: float(FIELD_THETA),
            vega: float(FIELD_VEGA),
        },
        implied_vol: float(FIELD_IMPLIED_VOL),
        open_interest: price(FIELD_OPEN_INTEREST).and_then(|d| d.trunc().to_u64()),
        updated_at: row
            .get("_updated")
            .and_then(Value::as_i64)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        is_historical: false,
    };
    Some((conid, quote))
}
