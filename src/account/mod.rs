//! Account and position queries.
//!
//! Reads the portfolio summary and positions for the selected account.
//! Also tracks stock holdings between calls so option assignments can be
//! spotted; that state belongs to this adapter (one per client) and is
//! cleared with [`AccountAdapter::reset_assignment_tracking`].

use crate::error::Result;
use crate::gateway::{ApiRequest, AuthedGateway};
use crate::market::OptionRight;
use crate::utils::decimal::{decimal_from_value, safe_div};
use chrono::NaiveDate;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, instrument};

/// Positions endpoint page size.
const POSITIONS_PAGE_SIZE: usize = 100;

/// Stop paging after this many pages.
const MAX_POSITION_PAGES: usize = 20;

/// Balance and margin summary.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub net_liquidation: Decimal,
    pub buying_power: Decimal,
    pub cash: Decimal,
    pub maintenance_margin: Decimal,
    /// Excess liquidity as a percentage of net liquidation
    pub cushion_pct: Decimal,
    pub gross_position_value: Decimal,
    /// Gross position value ÷ net liquidation
    pub leverage: Decimal,
}

/// An option holding.
#[derive(Debug, Clone, Serialize)]
pub struct OptionPosition {
    pub conid: i64,
    pub symbol: String,
    pub description: String,
    pub right: Option<OptionRight>,
    pub strike: Option<Decimal>,
    pub expiration: Option<NaiveDate>,
    pub quantity: Decimal,
    pub avg_cost: Decimal,
    pub market_price: Decimal,
    pub market_value: Decimal,
    pub unrealized_pnl: Decimal,
}

/// A stock holding, used for assignment detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockPosition {
    pub conid: i64,
    pub symbol: String,
    pub quantity: Decimal,
}

/// A stock holding that appeared or grew since the last check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssignmentEvent {
    pub conid: i64,
    pub symbol: String,
    pub previous_quantity: Decimal,
    pub current_quantity: Decimal,
    /// Signed change; negative when a short call was assigned
    pub change: Decimal,
}

/// Account/position adapter.
pub struct AccountAdapter {
    gateway: AuthedGateway,
    last_stock: Mutex<Option<HashMap<i64, StockPosition>>>,
}

impl AccountAdapter {
    pub fn new(gateway: AuthedGateway) -> Self {
        Self {
            gateway,
            last_stock: Mutex::new(None),
        }
    }

    /// Balance and margin summary. Missing fields read as zero.
    #[instrument(skip(self))]
    pub async fn get_account(&self) -> Result<AccountSnapshot> {
        let account_id = self.gateway.account_id().await?;
        let resp = self
            .gateway
            .call(&ApiRequest::get(format!("/portfolio/{account_id}/summary")))
            .await?;

        let snapshot = parse_summary(account_id, &resp.body);
        debug!(
            net_liquidation = %snapshot.net_liquidation,
            leverage = %snapshot.leverage,
            "Account summary retrieved"
        );
        Ok(snapshot)
    }

    /// Option holdings only; other asset classes are dropped.
    #[instrument(skip(self))]
    pub async fn get_positions(&self) -> Result<Vec<OptionPosition>> {
        let rows = self.fetch_positions().await?;
        let positions: Vec<OptionPosition> = rows.iter().filter_map(parse_option_position).collect();
        debug!(total = rows.len(), options = positions.len(), "Positions retrieved");
        Ok(positions)
    }

    pub async fn get_stock_positions(&self) -> Result<Vec<StockPosition>> {
        let rows = self.fetch_positions().await?;
        Ok(rows.iter().filter_map(parse_stock_position).collect())
    }

    /// Compare current stock holdings with the last snapshot and report new
    /// or grown holdings. The first call only records a baseline.
    #[instrument(skip(self))]
    pub async fn detect_assignments(&self) -> Result<Vec<AssignmentEvent>> {
        let current: HashMap<i64, StockPosition> = self
            .get_stock_positions()
            .await?
            .into_iter()
            .map(|p| (p.conid, p))
            .collect();

        let mut last = self.last_stock.lock();
        let events = match last.as_ref() {
            Some(previous) => diff_holdings(previous, &current),
            None => {
                debug!(holdings = current.len(), "Recorded stock baseline for assignment detection");
                Vec::new()
            }
        };
        *last = Some(current);

        for event in &events {
            info!(
                symbol = %event.symbol,
                previous = %event.previous_quantity,
                current = %event.current_quantity,
                "Possible option assignment detected"
            );
        }
        Ok(events)
    }

    /// Forget the last-known stock holdings.
    pub fn reset_assignment_tracking(&self) {
        *self.last_stock.lock() = None;
    }

    /// Holdings the next detection compares against, sorted by symbol.
    pub fn assignment_baseline(&self) -> Option<Vec<StockPosition>> {
        self.last_stock.lock().as_ref().map(|holdings| {
            let mut list: Vec<StockPosition> = holdings.values().cloned().collect();
            list.sort_by(|a, b| a.symbol.cmp(&b.symbol).then(a.conid.cmp(&b.conid)));
            list
        })
    }

    /// Restore a baseline saved by an earlier process.
    pub fn seed_assignment_baseline(&self, holdings: Vec<StockPosition>) {
        debug!(holdings = holdings.len(), "Seeded stock baseline for assignment detection");
        *self.last_stock.lock() = Some(holdings.into_iter().map(|p| (p.conid, p)).collect());
    }

    async fn fetch_positions(&self) -> Result<Vec<Value>> {
        let account_id = self.gateway.account_id().await?;
        let mut rows = Vec::new();

        for page in 0..MAX_POSITION_PAGES {
            let resp = self
                .gateway
                .call(&ApiRequest::get(format!("/portfolio/{account_id}/positions/{page}")))
                .await?;
            let batch = match resp.body {
                Value::Array(items) => items,
                _ => Vec::new(),
            };
            let full_page = batch.len() >= POSITIONS_PAGE_SIZE;
            rows.extend(batch);
            if !full_page {
                break;
            }
        }
        Ok(rows)
    }
}

/// Summary values arrive either bare or as `{"amount": ...}`.
fn summary_amount(body: &Value, key: &str) -> Decimal {
    let Some(entry) = body.get(key) else {
        return Decimal::ZERO;
    };
    entry
        .get("amount")
        .and_then(decimal_from_value)
        .or_else(|| entry.get("value").and_then(decimal_from_value))
        .or_else(|| decimal_from_value(entry))
        .unwrap_or(Decimal::ZERO)
}

fn parse_summary(account_id: String, body: &Value) -> AccountSnapshot {
    let net_liquidation = summary_amount(body, "netliquidation");
    let gross_position_value = summary_amount(body, "grosspositionvalue");

    AccountSnapshot {
        account_id,
        net_liquidation,
        buying_power: summary_amount(body, "buyingpower"),
        cash: summary_amount(body, "totalcashvalue"),
        maintenance_margin: summary_amount(body, "maintmarginreq"),
        cushion_pct: (summary_amount(body, "cushion") * Decimal::ONE_HUNDRED).round_dp(2),
        gross_position_value,
        leverage: safe_div(gross_position_value, net_liquidation).round_dp(4),
    }
}

fn row_decimal(row: &Value, key: &str) -> Decimal {
    row.get(key).and_then(decimal_from_value).unwrap_or(Decimal::ZERO)
}

fn row_conid(row: &Value) -> Option<i64> {
    let conid = row.get("conid")?;
    conid
        .as_i64()
        .or_else(|| conid.as_str().and_then(|s| s.trim().parse().ok()))
}

fn asset_class(row: &Value) -> &str {
    row.get("assetClass").and_then(Value::as_str).unwrap_or("")
}

fn parse_option_position(row: &Value) -> Option<OptionPosition> {
    if asset_class(row) != "OPT" {
        return None;
    }
    let description = row
        .get("contractDesc")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let symbol = row
        .get("ticker")
        .or_else(|| row.get("undSym"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| description.split_whitespace().next().map(str::to_string))
        .unwrap_or_default();

    Some(OptionPosition {
        conid: row_conid(row)?,
        symbol,
        right: row
            .get("putOrCall")
            .and_then(Value::as_str)
            .and_then(OptionRight::parse),
        strike: row.get("strike").and_then(decimal_from_value),
        expiration: row
            .get("expiry")
            .and_then(Value::as_str)
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y%m%d").ok()),
        description,
        quantity: row_decimal(row, "position"),
        avg_cost: row_decimal(row, "avgCost"),
        market_price: row_decimal(row, "mktPrice"),
        market_value: row_decimal(row, "mktValue"),
        unrealized_pnl: row_decimal(row, "unrealizedPnl"),
    })
}

fn parse_stock_position(row: &Value) -> Option<StockPosition> {
    if asset_class(row) != "STK" {
        return None;
    }
    let quantity = row_decimal(row, "position");
    if quantity.is_zero() {
        return None;
    }
    Some(StockPosition {
        conid: row_conid(row)?,
        symbol: row
            .get("ticker")
            .or_else(|| row.get("contractDesc"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        quantity,
    })
}

/// Holdings that are new or whose absolute size grew.
fn diff_holdings(
    previous: &HashMap<i64, StockPosition>,
    current: &HashMap<i64, StockPosition>,
) -> Vec<AssignmentEvent> {
    let mut events: Vec<AssignmentEvent> = current
        .values()
        .filter_map(|now| {
            let before = previous
                .get(&now.conid)
                .map(|p| p.quantity)
                .unwrap_or(Decimal::ZERO);
            (now.quantity.abs() > before.abs()).then(|| AssignmentEvent {
                conid: now.conid,
                symbol: now.symbol.clone(),
                previous_quantity: before,
                current_quantity: now.quantity,
                change: now.quantity - before,
            })
        })
        .collect();
    events.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_summary_parsing_and_leverage() {
        let body = json!({
            "netliquidation": {"amount": 100000.0, "currency": "USD"},
            "buyingpower": {"amount": 400000.0},
            "totalcashvalue": {"amount": 95000.5},
            "maintmarginreq": {"amount": 12000},
            "cushion": {"amount": 0.88},
            "grosspositionvalue": {"amount": 25000.0}
        });
        let snapshot = parse_summary("DU1".into(), &body);
        assert_eq!(snapshot.net_liquidation, dec!(100000));
        assert_eq!(snapshot.cash, dec!(95000.5));
        assert_eq!(snapshot.cushion_pct, dec!(88));
        assert_eq!(snapshot.leverage, dec!(0.25));
    }

    #[test]
    fn test_summary_missing_fields_default_to_zero() {
        let snapshot = parse_summary("DU1".into(), &json!({"buyingpower": {"amount": 10}}));
        assert_eq!(snapshot.net_liquidation, Decimal::ZERO);
        assert_eq!(snapshot.leverage, Decimal::ZERO);
        assert_eq!(snapshot.buying_power, dec!(10));
    }

    #[test]
    fn test_only_options_kept() {
        let rows = [
            json!({"conid": 700001, "assetClass": "OPT", "contractDesc": "SPY    DEC2025 595 P [SPY   251205P00595000 100]",
                   "position": -2.0, "putOrCall": "P", "strike": "595", "expiry": "20251205", "mktPrice": 1.2, "avgCost": 150.0}),
            json!({"conid": 756733, "assetClass": "STK", "contractDesc": "SPY", "position": 100.0}),
            json!({"conid": 1, "assetClass": "CASH", "position": 5.0}),
        ];
        let options: Vec<OptionPosition> = rows.iter().filter_map(parse_option_position).collect();
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].symbol, "SPY");
        assert_eq!(options[0].right, Some(OptionRight::Put));
        assert_eq!(options[0].strike, Some(dec!(595)));
        assert_eq!(options[0].quantity, dec!(-2));
        assert_eq!(
            options[0].expiration,
            NaiveDate::from_ymd_opt(2025, 12, 5)
        );
    }

    #[test]
    fn test_assignment_diff() {
        let holding = |conid, symbol: &str, qty| StockPosition {
            conid,
            symbol: symbol.into(),
            quantity: qty,
        };
        let previous: HashMap<i64, StockPosition> =
            [(1, holding(1, "SPY", dec!(100)))].into_iter().collect();
        let current: HashMap<i64, StockPosition> = [
            (1, holding(1, "SPY", dec!(200))),
            (2, holding(2, "QQQ", dec!(-100))),
        ]
        .into_iter()
        .collect();

        let events = diff_holdings(&previous, &current);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].symbol, "QQQ");
        assert_eq!(events[0].change, dec!(-100));
        assert_eq!(events[1].change, dec!(100));

        assert!(diff_holdings(&current, &previous).is_empty());
    }
}
