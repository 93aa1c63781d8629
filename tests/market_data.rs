//! Snapshots, the off-hours fallback and volatility-banded chains.

mod common;

use chrono::NaiveDate;
use common::*;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, Request, ResponseTemplate};
use zero_dte_broker::BrokerError;

const SNAPSHOT: &str = "/v1/api/iserver/marketdata/snapshot";
const HISTORY: &str = "/v1/api/iserver/marketdata/history";
const STRIKES: &str = "/v1/api/iserver/secdef/strikes";
const INFO: &str = "/v1/api/iserver/secdef/info";

const SPY: i64 = 756_733;
const VIX: i64 = 13_455_763;

fn query(req: &Request, key: &str) -> Option<String> {
    req.url
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Snapshot responder quoting SPY at 600, VIX at `vix`, and every option at
/// 0.95 / 1.05.
fn live_snapshot(vix: &'static str) -> impl Fn(&Request) -> ResponseTemplate + Send + Sync {
    quoted_snapshot(vix, None)
}

/// Like [`live_snapshot`] with VIX at 2, but only the listed options carry a
/// quote; the rest come back as bare conid rows.
fn sparse_snapshot(quoted: &'static [i64]) -> impl Fn(&Request) -> ResponseTemplate + Send + Sync {
    quoted_snapshot("2", Some(quoted))
}

fn quoted_snapshot(
    vix: &'static str,
    quoted: Option<&'static [i64]>,
) -> impl Fn(&Request) -> ResponseTemplate + Send + Sync {
    move |req: &Request| {
        let conids = query(req, "conids").unwrap_or_default();
        let rows: Vec<Value> = conids
            .split(',')
            .filter_map(|c| c.parse::<i64>().ok())
            .map(|conid| match conid {
                SPY => json!({"conid": conid, "31": "600.00", "84": "599.99", "86": "600.01"}),
                VIX => json!({"conid": conid, "31": vix}),
                _ if quoted.is_some_and(|q| !q.contains(&conid)) => json!({"conid": conid}),
                _ => json!({"conid": conid, "31": "1.00", "84": "0.95", "86": "1.05", "7308": "0.45", "7633": "18.2%"}),
            })
            .collect();
        ResponseTemplate::new(200).set_body_json(rows)
    }
}

async fn mount_history(h: &Harness, conid: i64, close: f64) {
    Mock::given(method("GET"))
        .and(path(HISTORY))
        .and(query_param("conid", conid.to_string()))
        .respond_with(ok_json(json!({
            "symbol": "X",
            "data": [
                {"t": 1764709200000i64, "o": 1.0, "h": 1.0, "l": 1.0, "c": close - 1.0, "v": 10.0},
                {"t": 1764795600000i64, "o": 1.0, "h": 1.0, "l": 1.0, "c": close, "v": 10.0}
            ]
        })))
        .mount(&h.server)
        .await;
}

#[tokio::test]
async fn test_live_quote_and_vix_proxy() {
    let h = Harness::start().await;
    Mock::given(method("GET"))
        .and(path(SNAPSHOT))
        .respond_with(live_snapshot("16.25"))
        .mount(&h.server)
        .await;

    let quote = assert_ok!(h.client.get_market_data("SPY").await);
    assert_eq!(quote.conid, SPY);
    assert_eq!(quote.quote.last, Some(dec!(600)));
    assert_eq!(quote.quote.bid, Some(dec!(599.99)));
    assert!(!quote.quote.is_historical);
    assert_eq!(quote.volatility_pct, 16.25);

    // Prime + fetch for SPY, then again for VIX
    assert_eq!(h.hits(SNAPSHOT).await, 4);
    assert_eq!(h.hits(HISTORY).await, 0);
    assert_eq!(h.sleeper.calls(), vec![Duration::from_millis(500); 2]);
}

#[tokio::test]
async fn test_closed_market_falls_back_to_history() {
    let h = Harness::start().await;
    Mock::given(method("GET"))
        .and(path(SNAPSHOT))
        .respond_with(ok_json(json!([])))
        .mount(&h.server)
        .await;
    mount_history(&h, SPY, 600.0).await;
    mount_history(&h, VIX, 15.0).await;

    let quote = assert_ok!(h.client.get_market_data("SPY").await);
    assert!(quote.quote.is_historical);
    assert_eq!(quote.quote.last, Some(dec!(600)));
    assert_eq!(quote.quote.bid, Some(dec!(588)));
    assert_eq!(quote.quote.ask, Some(dec!(612)));
    assert_eq!(quote.volatility_pct, 15.0);

    // Prime, fetch and one retry per symbol
    assert_eq!(h.hits(SNAPSHOT).await, 6);
}

#[tokio::test]
async fn test_no_quote_and_no_history_is_unavailable() {
    let h = Harness::start().await;
    Mock::given(method("GET"))
        .and(path(SNAPSHOT))
        .respond_with(ok_json(json!([])))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(HISTORY))
        .respond_with(ResponseTemplate::new(500).set_body_string("Chart data unavailable"))
        .mount(&h.server)
        .await;

    let err = assert_err!(h.client.get_market_data("SPY").await);
    assert!(matches!(err, BrokerError::MarketDataUnavailable(_)), "got {err:?}");
}

#[tokio::test]
async fn test_vix_unavailable_uses_default_volatility() {
    let h = Harness::start().await;
    Mock::given(method("GET"))
        .and(path(SNAPSHOT))
        .and(query_param("conids", SPY.to_string()))
        .respond_with(live_snapshot("0"))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(SNAPSHOT))
        .and(query_param("conids", VIX.to_string()))
        .respond_with(ok_json(json!([])))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(HISTORY))
        .respond_with(ok_json(json!({"data": []})))
        .mount(&h.server)
        .await;

    let quote = assert_ok!(h.client.get_market_data("SPY").await);
    assert_eq!(quote.volatility_pct, 20.0);
}

async fn mount_chain(h: &Harness, vix: &'static str) {
    Mock::given(method("GET"))
        .and(path(SNAPSHOT))
        .respond_with(live_snapshot(vix))
        .mount(&h.server)
        .await;
    mount_chain_contracts(h).await;
}

async fn mount_chain_contracts(h: &Harness) {
    Mock::given(method("GET"))
        .and(path(STRIKES))
        .and(query_param("conid", SPY.to_string()))
        .and(query_param("month", "DEC25"))
        .respond_with(ok_json(json!({
            "call": [560.0, 580.0, 600.0, 620.0, 640.0],
            "put": [560.0, 580.0, 600.0, 620.0, 640.0]
        })))
        .mount(&h.server)
        .await;
    // conid = strike × 10 + (1 call | 2 put)
    Mock::given(method("GET"))
        .and(path(INFO))
        .respond_with(|req: &Request| {
            let strike: i64 = query(req, "strike")
                .and_then(|s| s.parse::<f64>().ok())
                .map(|s| s as i64)
                .unwrap_or_default();
            let leg = if query(req, "right").as_deref() == Some("C") { 1 } else { 2 };
            ResponseTemplate::new(200).set_body_json(json!([
                {"conid": strike * 10 + leg, "maturityDate": "20251205"}
            ]))
        })
        .mount(&h.server)
        .await;
}

#[tokio::test]
async fn test_chain_uses_volatility_band() {
    let h = Harness::start().await;
    mount_chain(&h, "2").await;

    let chain = assert_ok!(h.client.get_option_chain_with_strikes("SPY", None).await);
    assert_eq!(chain.expiration, NaiveDate::from_ymd_opt(2025, 12, 5).unwrap());
    assert_eq!(chain.underlying_price, dec!(600));
    // V = 2 keeps the $20 floor: [580, 620]
    assert_eq!(chain.range.low, dec!(580));
    assert_eq!(chain.range.high, dec!(620));
    assert!(!chain.is_historical);

    let strikes: Vec<_> = chain.strikes.iter().map(|s| s.strike).collect();
    assert_eq!(strikes, vec![dec!(580), dec!(600), dec!(620)]);
    for row in &chain.strikes {
        let call = row.call.as_ref().expect("call leg");
        let put = row.put.as_ref().expect("put leg");
        assert_eq!(call.conid % 10, 1);
        assert_eq!(put.conid % 10, 2);
        assert_eq!(call.quote.bid, Some(dec!(0.95)));
        assert_eq!(put.quote.greeks.delta, Some(0.45));
    }

    assert_eq!(h.hits(INFO).await, 6);
    let pacing = h
        .sleeper
        .calls()
        .into_iter()
        .filter(|d| *d == Duration::from_millis(100))
        .count();
    assert_eq!(pacing, 5);
}

#[tokio::test]
async fn test_chain_band_widens_with_volatility() {
    let h = Harness::start().await;
    mount_chain(&h, "30").await;

    let chain = assert_ok!(h.client.get_option_chain_with_strikes("SPY", None).await);
    // 600 × 0.30 × sqrt(1/252) ≈ 11.34, × 4 ≈ 45.4
    assert!(chain.range.low < dec!(560) && chain.range.low > dec!(554));
    assert_eq!(chain.strikes.len(), 5);
}

#[tokio::test]
async fn test_chain_rejects_past_expiration() {
    let h = Harness::start().await;

    let yesterday = NaiveDate::from_ymd_opt(2025, 12, 4).unwrap();
    let err = assert_err!(h.client.get_option_chain_with_strikes("SPY", Some(yesterday)).await);
    assert!(matches!(err, BrokerError::ResolutionFailed(_)));
    assert_eq!(h.hits(SNAPSHOT).await, 0);
}

/// Every option closed at 2.00 the previous session.
async fn mount_option_history(h: &Harness) {
    Mock::given(method("GET"))
        .and(path(HISTORY))
        .respond_with(ok_json(json!({
            "symbol": "SPY",
            "data": [{"t": 1764795600000i64, "o": 2.0, "h": 2.0, "l": 2.0, "c": 2.0, "v": 10.0}]
        })))
        .mount(&h.server)
        .await;
}

#[tokio::test]
async fn test_chain_mostly_empty_page_falls_back_to_history() {
    let h = Harness::start().await;
    // One quoted leg out of six is still below the 80 % threshold
    Mock::given(method("GET"))
        .and(path(SNAPSHOT))
        .respond_with(sparse_snapshot(&[6001]))
        .mount(&h.server)
        .await;
    mount_chain_contracts(&h).await;
    mount_option_history(&h).await;

    let chain = assert_ok!(h.client.get_option_chain_with_strikes("SPY", None).await);
    assert!(chain.is_historical);
    assert_eq!(chain.strikes.len(), 3);

    for row in &chain.strikes {
        for leg in [row.call.as_ref(), row.put.as_ref()].into_iter().flatten() {
            if leg.conid == 6001 {
                assert!(!leg.quote.is_historical);
                assert_eq!(leg.quote.bid, Some(dec!(0.95)));
            } else {
                assert!(leg.quote.is_historical, "conid {} not synthesized", leg.conid);
                assert_eq!(leg.quote.last, Some(dec!(2)));
                assert_eq!(leg.quote.bid, Some(dec!(1.96)));
                assert_eq!(leg.quote.ask, Some(dec!(2.04)));
            }
        }
    }

    // The live leg never needs history
    assert_eq!(h.hits(HISTORY).await, 5);
}

#[tokio::test]
async fn test_chain_later_empty_page_backfills_whole_request() {
    let server = wiremock::MockServer::start().await;
    mount_handshake(&server).await;
    let mut config = test_config(&server);
    config.market_data.snapshot_page_size = 2;
    let h = Harness::with_config(server, config);

    // Contracts resolve strike by strike, call before put:
    // [5801, 5802] | [6001, 6002] | [6201, 6202]
    Mock::given(method("GET"))
        .and(path(SNAPSHOT))
        .respond_with(sparse_snapshot(&[5801, 5802]))
        .mount(&h.server)
        .await;
    mount_chain_contracts(&h).await;
    mount_option_history(&h).await;

    let chain = assert_ok!(h.client.get_option_chain_with_strikes("SPY", None).await);
    assert!(chain.is_historical);

    let first = &chain.strikes[0];
    assert_eq!(first.strike, dec!(580));
    for leg in [first.call.as_ref(), first.put.as_ref()] {
        let leg = leg.expect("580 leg");
        assert!(!leg.quote.is_historical);
        assert_eq!(leg.quote.ask, Some(dec!(1.05)));
    }
    for row in &chain.strikes[1..] {
        for leg in [row.call.as_ref(), row.put.as_ref()] {
            let leg = leg.expect("leg");
            assert!(leg.quote.is_historical);
            assert_eq!(leg.quote.bid, Some(dec!(1.96)));
        }
    }

    // The third page is never requested once the second falls back
    assert_eq!(h.hits(HISTORY).await, 4);
    // Underlying and VIX prime + fetch, page one prime + fetch, page two
    // prime + fetch + retry
    assert_eq!(h.hits(SNAPSHOT).await, 9);
}
