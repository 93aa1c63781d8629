//! Order submission, brackets, cancel-all and reconciliation.

mod common;

use chrono::NaiveDate;
use common::*;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, Request, ResponseTemplate};
use zero_dte_broker::market::OptionRight;
use zero_dte_broker::orders::{
    CancelOutcome, LedgerOrder, OptionOrder, OrderRequest, OrderSide, OrderStatus, OrderType,
};
use zero_dte_broker::persistence::OrderLedger;
use zero_dte_broker::BrokerError;

const ORDERS: &str = "/v1/api/iserver/account/DU1234567/orders";
const LIVE_ORDERS: &str = "/v1/api/iserver/account/orders";
const REPLY: &str = "/v1/api/iserver/reply/reply-1";
const INFO: &str = "/v1/api/iserver/secdef/info";

fn cancel_path(id: &str) -> String {
    format!("/v1/api/iserver/account/{ACCOUNT}/order/{id}")
}

fn short_put() -> OrderRequest {
    OrderRequest::limit(700_595, "SPY 595P 2025-12-05", OrderSide::Sell, dec!(1), dec!(1.25))
}

fn short_put_option() -> OptionOrder {
    OptionOrder {
        symbol: "SPY".into(),
        expiration: NaiveDate::from_ymd_opt(2025, 12, 5).unwrap(),
        right: OptionRight::Put,
        strike: dec!(595),
        side: OrderSide::Sell,
        quantity: dec!(2),
        order_type: OrderType::Limit,
        price: Some(dec!(1.25)),
        stop_price: None,
    }
}

async fn mount_put_contract(h: &Harness) {
    Mock::given(method("GET"))
        .and(path(INFO))
        .respond_with(ok_json(json!([{"conid": 700595, "maturityDate": "20251205"}])))
        .mount(&h.server)
        .await;
}

/// Ledger entry already acknowledged by the gateway.
fn seeded(h: &Harness, upstream_id: Option<&str>) -> LedgerOrder {
    let mut order = LedgerOrder::new(
        "SPY 595P 2025-12-05",
        Some(700_595),
        OrderSide::Sell,
        dec!(1),
        OrderType::Limit,
        start_time(),
    );
    order.upstream_id = upstream_id.map(str::to_string);
    if upstream_id.is_some() {
        order.status = OrderStatus::Submitted;
    }
    h.store.upsert(&order).expect("seed ledger");
    order
}

fn ledger_status(h: &Harness, order: &LedgerOrder) -> OrderStatus {
    h.store.get(order.local_id).unwrap().expect("ledger entry").status
}

#[tokio::test]
async fn test_every_reply_shape_gives_same_ack() {
    let entry = json!({"order_id": "1894563201", "order_status": "PreSubmitted"});
    let shapes = [
        entry.clone(),
        json!([entry.clone()]),
        json!({"orders": [entry.clone()]}),
        json!({"data": [entry.clone()]}),
        json!({"reply": [entry.clone()]}),
    ];

    for body in shapes {
        let h = Harness::start().await;
        Mock::given(method("POST"))
            .and(path(ORDERS))
            .respond_with(ok_json(body.clone()))
            .mount(&h.server)
            .await;

        let ack = assert_ok!(h.client.place_order(&short_put()).await);
        assert_eq!(ack.id, "1894563201", "shape {body}");
        assert_eq!(ack.status, "PreSubmitted");

        let orders = h.store.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].upstream_id.as_deref(), Some("1894563201"));
        assert_eq!(orders[0].status, OrderStatus::Submitted);
        assert_eq!(h.store.events_of_type("order_submitted").len(), 1);
    }
}

#[tokio::test]
async fn test_unrecognized_reply_is_error() {
    let h = Harness::start().await;
    Mock::given(method("POST"))
        .and(path(ORDERS))
        .respond_with(ok_json(json!({"something": "else"})))
        .mount(&h.server)
        .await;

    let err = assert_err!(h.client.place_order(&short_put()).await);
    assert!(matches!(err, BrokerError::Decode(_)), "got {err:?}");
    assert_eq!(h.store.events_of_type("order_failed").len(), 1);
}

#[tokio::test]
async fn test_confirmation_prompt_answered() {
    let h = Harness::start().await;
    Mock::given(method("POST"))
        .and(path(ORDERS))
        .respond_with(ok_json(json!([{
            "id": "reply-1",
            "message": ["You are about to submit an order outside regular trading hours"],
            "isSuppressed": false
        }])))
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path(REPLY))
        .and(body_json(json!({"confirmed": true})))
        .respond_with(ok_json(json!([{"order_id": "555", "order_status": "Submitted"}])))
        .expect(1)
        .mount(&h.server)
        .await;

    let ack = assert_ok!(h.client.place_order(&short_put()).await);
    assert_eq!(ack.id, "555");
    assert_eq!(h.store.orders()[0].upstream_id.as_deref(), Some("555"));
}

#[tokio::test]
async fn test_endless_prompts_are_rejected() {
    let h = Harness::start().await;
    let prompt = json!([{"id": "reply-1", "message": ["Confirm?"]}]);
    Mock::given(method("POST"))
        .and(path(ORDERS))
        .respond_with(ok_json(prompt.clone()))
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path(REPLY))
        .respond_with(ok_json(prompt))
        .mount(&h.server)
        .await;

    let err = assert_err!(h.client.place_order(&short_put()).await);
    assert!(matches!(err, BrokerError::OrderRejected { .. }), "got {err:?}");
    assert_eq!(h.hits(REPLY).await, 5);
    assert_eq!(h.store.orders()[0].status, OrderStatus::Rejected);
}

#[tokio::test]
async fn test_bad_request_is_rejection() {
    let h = Harness::start().await;
    Mock::given(method("POST"))
        .and(path(ORDERS))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "Invalid price increment"})))
        .mount(&h.server)
        .await;

    let err = assert_err!(h.client.place_order(&short_put()).await);
    match err {
        BrokerError::OrderRejected { code, message } => {
            assert_eq!(code.as_deref(), Some("400"));
            assert_eq!(message, "Invalid price increment");
        }
        other => panic!("unexpected {other:?}"),
    }
    let orders = h.store.orders();
    assert_eq!(orders[0].status, OrderStatus::Rejected);
    assert_eq!(orders[0].upstream_id, None);
    assert_eq!(h.store.events_of_type("order_rejected").len(), 1);
}

#[tokio::test]
async fn test_invalid_order_never_reaches_gateway() {
    let h = Harness::start().await;
    let mut request = short_put();
    request.quantity = dec!(0);

    let err = assert_err!(h.client.place_order(&request).await);
    assert!(matches!(err, BrokerError::OrderRejected { .. }));
    assert_eq!(h.hits(ORDERS).await, 0);
    assert!(h.store.orders().is_empty());
}

#[tokio::test]
async fn test_bracket_links_stop_to_parent() {
    let h = Harness::start().await;
    mount_put_contract(&h).await;
    // Echo client order ids back in reverse order
    Mock::given(method("POST"))
        .and(path(ORDERS))
        .respond_with(|req: &Request| {
            let body: Value = serde_json::from_slice(&req.body).unwrap_or_default();
            let orders = body["orders"].as_array().cloned().unwrap_or_default();
            let acks: Vec<Value> = orders
                .iter()
                .enumerate()
                .rev()
                .map(|(i, o)| json!({"order_id": (100 + i).to_string(), "order_status": "Submitted", "local_order_id": o["cOID"]}))
                .collect();
            ResponseTemplate::new(200).set_body_json(acks)
        })
        .mount(&h.server)
        .await;

    let bracket = assert_ok!(h.client.place_option_order_with_stop(&short_put_option(), dec!(2.50)).await);
    assert_eq!(bracket.parent.id, "100");
    assert_eq!(bracket.stop.id, "101");

    let requests = h.server.received_requests().await.unwrap_or_default();
    let submitted = requests
        .iter()
        .find(|r| r.url.path() == ORDERS)
        .expect("order request");
    let body: Value = serde_json::from_slice(&submitted.body).unwrap();
    let legs = body["orders"].as_array().unwrap();
    assert_eq!(legs.len(), 2);
    assert_eq!(legs[0]["side"], "SELL");
    assert_eq!(legs[0]["orderType"], "LMT");
    assert_eq!(legs[0]["conid"], 700595);
    assert_eq!(legs[1]["side"], "BUY");
    assert_eq!(legs[1]["orderType"], "STP");
    assert_eq!(legs[1]["price"], 2.5);
    assert_eq!(legs[1]["quantity"], 2.0);
    assert_eq!(legs[1]["parentId"], legs[0]["cOID"]);

    let parent = h.store.get(bracket.parent_local_id).unwrap().unwrap();
    let stop = h.store.get(bracket.stop_local_id).unwrap().unwrap();
    assert_eq!(parent.upstream_id.as_deref(), Some("100"));
    assert_eq!(stop.upstream_id.as_deref(), Some("101"));
    assert_eq!(stop.parent_id, Some(parent.local_id));
    assert_eq!(stop.stop_price, Some(dec!(2.50)));
}

#[tokio::test]
async fn test_bracket_confirms_every_prompt() {
    let h = Harness::start().await;
    mount_put_contract(&h).await;
    Mock::given(method("POST"))
        .and(path(ORDERS))
        .respond_with(ok_json(json!([
            {"id": "reply-a", "message": ["Order price exceeds the 3% constraint"]},
            {"id": "reply-b", "message": ["Stop order will be held until the parent fills"]}
        ])))
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/api/iserver/reply/reply-a"))
        .and(body_json(json!({"confirmed": true})))
        .respond_with(ok_json(json!([{"order_id": "100", "order_status": "Submitted"}])))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/api/iserver/reply/reply-b"))
        .and(body_json(json!({"confirmed": true})))
        .respond_with(ok_json(json!([{"order_id": "101", "order_status": "PreSubmitted"}])))
        .expect(1)
        .mount(&h.server)
        .await;

    let bracket = assert_ok!(h.client.place_option_order_with_stop(&short_put_option(), dec!(2.50)).await);
    assert_eq!(bracket.parent.id, "100");
    assert_eq!(bracket.stop.id, "101");
    assert_eq!(h.hits("/v1/api/iserver/reply/reply-a").await, 1);
    assert_eq!(h.hits("/v1/api/iserver/reply/reply-b").await, 1);

    let stop = h.store.get(bracket.stop_local_id).unwrap().unwrap();
    assert_eq!(stop.upstream_id.as_deref(), Some("101"));
    assert_eq!(stop.parent_id, Some(bracket.parent_local_id));
}

#[tokio::test]
async fn test_bracket_missing_stop_ack_is_reported() {
    let h = Harness::start().await;
    mount_put_contract(&h).await;
    Mock::given(method("POST"))
        .and(path(ORDERS))
        .respond_with(ok_json(json!([{"order_id": "100", "order_status": "Submitted"}])))
        .mount(&h.server)
        .await;

    let err = assert_err!(h.client.place_option_order_with_stop(&short_put_option(), dec!(2.50)).await);
    assert!(matches!(err, BrokerError::OrderRejected { .. }), "got {err:?}");

    let events = h.store.events_of_type("order_rejected");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].detail["order_id"], "100");
    let live = h
        .store
        .orders()
        .into_iter()
        .filter(|o| o.upstream_id.as_deref() == Some("100"))
        .count();
    assert_eq!(live, 1);
}

#[tokio::test]
async fn test_bracket_requires_sell_parent() {
    let h = Harness::start().await;
    let mut order = short_put_option();
    order.side = OrderSide::Buy;

    let err = assert_err!(h.client.place_option_order_with_stop(&order, dec!(2.50)).await);
    assert!(matches!(err, BrokerError::OrderRejected { .. }));
    assert_eq!(h.hits(INFO).await, 0);
    assert_eq!(h.hits(ORDERS).await, 0);
}

#[tokio::test]
async fn test_cancel_unknown_order_counts_as_resolved() {
    let h = Harness::start().await;
    let order = seeded(&h, Some("111"));
    Mock::given(method("DELETE"))
        .and(path(cancel_path("111").as_str()))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .mount(&h.server)
        .await;

    let outcome = assert_ok!(h.client.cancel_order("111").await);
    assert_eq!(outcome, CancelOutcome::NotFound);
    assert_eq!(ledger_status(&h, &order), OrderStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_placeholder_id_is_refused() {
    let h = Harness::start().await;

    let err = assert_err!(h.client.cancel_order("sim_1").await);
    assert!(matches!(err, BrokerError::OrderRejected { .. }));
    assert!(h
        .server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .all(|r| r.method.as_str() != "DELETE"));
}

#[tokio::test]
async fn test_cancel_all_falls_back_to_ledger() {
    let h = Harness::start().await;
    Mock::given(method("GET"))
        .and(path(LIVE_ORDERS))
        .respond_with(ok_json(json!({"orders": []})))
        .mount(&h.server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(cancel_path("111").as_str()))
        .respond_with(ok_json(json!({"error": "OrderID 111 doesn't exist"})))
        .expect(1)
        .mount(&h.server)
        .await;

    let real = seeded(&h, Some("111"));
    let placeholder = seeded(&h, Some("sim_1"));
    let unsent = seeded(&h, None);

    let report = assert_ok!(h.client.cancel_all_orders().await);
    assert!(report.from_ledger);
    assert_eq!(report.attempted, vec!["111"]);
    assert_eq!(report.not_found, vec!["111"]);
    assert!(report.failed.is_empty());
    assert_eq!(report.reconciled, 1);

    let mut skipped = report.skipped.clone();
    skipped.sort();
    let mut expected = vec!["sim_1".to_string(), unsent.local_id.to_string()];
    expected.sort();
    assert_eq!(skipped, expected);

    assert_eq!(ledger_status(&h, &real), OrderStatus::Cancelled);
    assert_eq!(ledger_status(&h, &placeholder), OrderStatus::Submitted);
    assert_eq!(ledger_status(&h, &unsent), OrderStatus::PendingSubmit);
}

#[tokio::test]
async fn test_cancel_all_keeps_failed_upstream_order_open() {
    let h = Harness::start().await;
    Mock::given(method("GET"))
        .and(path(LIVE_ORDERS))
        .respond_with(ok_json(json!({"orders": [
            {"orderId": 201, "ticker": "SPY", "status": "Submitted"},
            {"orderId": 202, "ticker": "SPY", "status": "PreSubmitted"},
            {"orderId": 203, "ticker": "SPY", "status": "Filled"}
        ]})))
        .mount(&h.server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(cancel_path("201").as_str()))
        .respond_with(ok_json(json!({"msg": "Request was submitted", "order_id": 201})))
        .mount(&h.server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(cancel_path("202").as_str()))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .mount(&h.server)
        .await;

    let first = seeded(&h, Some("201"));
    let second = seeded(&h, Some("202"));

    let report = assert_ok!(h.client.cancel_all_orders().await);
    assert!(!report.from_ledger);
    assert_eq!(report.attempted, vec!["201", "202"]);
    assert_eq!(report.cancelled, vec!["201"]);
    assert_eq!(report.failed, vec!["202"]);
    assert_eq!(report.reconciled, 1);

    assert_eq!(ledger_status(&h, &first), OrderStatus::Cancelled);
    assert_eq!(ledger_status(&h, &second), OrderStatus::Submitted);
    assert_eq!(h.store.events_of_type("cancel_all")[0].status, "partial");

    // Still live upstream, so a later reconcile picks it up again
    let reconciled = assert_ok!(h.client.reconcile_orders().await);
    assert_eq!(reconciled.checked, 1);
    assert_eq!(reconciled.still_open, vec!["202"]);
}

#[tokio::test]
async fn test_cancel_all_from_ledger_settles_whatever_the_outcome() {
    let h = Harness::start().await;
    Mock::given(method("GET"))
        .and(path(LIVE_ORDERS))
        .respond_with(ok_json(json!([])))
        .mount(&h.server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(cancel_path("401").as_str()))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .mount(&h.server)
        .await;

    let stale = seeded(&h, Some("401"));

    let report = assert_ok!(h.client.cancel_all_orders().await);
    assert!(report.from_ledger);
    assert_eq!(report.failed, vec!["401"]);
    assert_eq!(report.reconciled, 1);
    assert_eq!(ledger_status(&h, &stale), OrderStatus::Cancelled);
}

#[tokio::test]
async fn test_reconcile_pulls_upstream_status() {
    let h = Harness::start().await;
    Mock::given(method("GET"))
        .and(path(LIVE_ORDERS))
        .respond_with(ok_json(json!([
            {"orderId": "301", "status": "Filled"},
            {"orderId": "302", "status": "ApiCancelled"},
            {"orderId": "303", "status": "PreSubmitted"}
        ])))
        .mount(&h.server)
        .await;

    let filled = seeded(&h, Some("301"));
    let cancelled = seeded(&h, Some("302"));
    let working = seeded(&h, Some("303"));
    let placeholder = seeded(&h, Some("sim_2"));

    let report = assert_ok!(h.client.reconcile_orders().await);
    assert_eq!(report.checked, 3);
    assert_eq!(report.filled, vec!["301"]);
    assert_eq!(report.cancelled, vec!["302"]);
    assert_eq!(report.still_open, vec!["303"]);

    let filled = h.store.get(filled.local_id).unwrap().unwrap();
    assert_eq!(filled.status, OrderStatus::Filled);
    assert_eq!(filled.filled_at, Some(start_time()));
    assert_eq!(ledger_status(&h, &cancelled), OrderStatus::Cancelled);
    assert_eq!(ledger_status(&h, &working), OrderStatus::Submitted);
    assert_eq!(ledger_status(&h, &placeholder), OrderStatus::Submitted);
    assert_eq!(h.store.events_of_type("reconcile").len(), 1);
}
