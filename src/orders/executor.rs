//! Order placement, cancellation and ledger reconciliation.

use super::response::{decode_reply, ReplyEntry};
use super::types::{
    is_plausible_order_id, BracketAck, CancelOutcome, CancelReport, LedgerOrder, OpenOrder, OrderAck,
    OrderSide, OrderStatus, OrderType, ReconcileReport,
};
use crate::error::{BrokerError, Result};
use crate::gateway::{ApiRequest, AuthedGateway};
use crate::market::{ContractResolver, OptionRight};
use crate::persistence::{audit, AuditEvent, AuditSink, OrderLedger};
use crate::utils::decimal::decimal_from_value;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Time in force for every order sent by this client.
pub const DEFAULT_TIF: &str = "DAY";

/// An order for an already resolved contract.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub conid: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_type: OrderType,
    /// Limit price
    pub price: Option<Decimal>,
    /// Trigger price for stop orders
    pub stop_price: Option<Decimal>,
}

impl OrderRequest {
    pub fn market(conid: i64, symbol: impl Into<String>, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            conid,
            symbol: symbol.into(),
            side,
            quantity,
            order_type: OrderType::Market,
            price: None,
            stop_price: None,
        }
    }

    pub fn limit(conid: i64, symbol: impl Into<String>, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            ..Self::market(conid, symbol, side, quantity)
        }
    }

    pub fn stop(conid: i64, symbol: impl Into<String>, side: OrderSide, quantity: Decimal, stop_price: Decimal) -> Self {
        Self {
            order_type: OrderType::Stop,
            stop_price: Some(stop_price),
            ..Self::market(conid, symbol, side, quantity)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.quantity <= Decimal::ZERO {
            return Err(BrokerError::rejected(None, format!("invalid quantity {}", self.quantity)));
        }
        let positive = |p: Option<Decimal>| p.is_some_and(|p| p > Decimal::ZERO);
        if self.order_type.needs_price() && !positive(self.price) {
            return Err(BrokerError::rejected(
                None,
                format!("{} order needs a positive limit price", self.order_type.as_str()),
            ));
        }
        if self.order_type.needs_stop() && !positive(self.stop_price) {
            return Err(BrokerError::rejected(
                None,
                format!("{} order needs a positive stop price", self.order_type.as_str()),
            ));
        }
        Ok(())
    }
}

/// An option order addressed by symbol, expiration, right and strike.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionOrder {
    pub symbol: String,
    pub expiration: NaiveDate,
    pub right: OptionRight,
    pub strike: Decimal,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
}

/// One acknowledged order from a submission.
#[derive(Debug, Clone)]
struct Placement {
    ack: OrderAck,
    local_ref: Option<String>,
}

/// Submits orders and keeps the local ledger in step with the gateway.
pub struct OrderExecutor {
    gateway: AuthedGateway,
    resolver: Arc<ContractResolver>,
    ledger: Arc<dyn OrderLedger>,
    audit: Arc<dyn AuditSink>,
    max_confirmation_rounds: u32,
}

impl OrderExecutor {
    pub fn new(
        gateway: AuthedGateway,
        resolver: Arc<ContractResolver>,
        ledger: Arc<dyn OrderLedger>,
        audit: Arc<dyn AuditSink>,
        max_confirmation_rounds: u32,
    ) -> Self {
        Self {
            gateway,
            resolver,
            ledger,
            audit,
            max_confirmation_rounds,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.gateway.clock().now()
    }

    fn record(&self, event_type: &str, status: &str, detail: Value) {
        audit(self.audit.as_ref(), AuditEvent::new(event_type, status, detail, self.now()));
    }

    /// Place an order for a resolved contract.
    #[instrument(skip(self, request), fields(conid = request.conid, side = request.side.as_str()))]
    pub async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        request.validate()?;
        let account = self.gateway.account_id().await?;

        let mut entry = ledger_entry(request, self.now());
        self.ledger.upsert(&entry)?;
        let local_ref = entry.local_id.to_string();
        let payload = order_payload(&account, request, &local_ref, None);

        let placed = match self.submit(&account, vec![payload]).await {
            Ok(placed) => placed,
            Err(e) => {
                self.record_failure(&mut entry, &e);
                return Err(e);
            }
        };

        // `submit` never returns an empty list
        let Some(ack) = placed.into_iter().next().map(|p| p.ack) else {
            return Err(BrokerError::Decode("order reply carried no acknowledgement".into()));
        };
        self.apply_ack(&mut entry, &ack)?;
        info!(
            symbol = %request.symbol,
            order_id = %ack.id,
            status = %ack.status,
            order_type = request.order_type.as_str(),
            quantity = %request.quantity,
            "Order placed"
        );
        self.record(
            "order_submitted",
            "ok",
            json!({"order_id": ack.id, "local_id": local_ref, "symbol": request.symbol, "conid": request.conid}),
        );
        Ok(ack)
    }

    /// Resolve the option contract, then place the order.
    #[instrument(skip(self, order), fields(symbol = %order.symbol, strike = %order.strike))]
    pub async fn place_option_order(&self, order: &OptionOrder) -> Result<OrderAck> {
        let request = self.option_request(order).await?;
        self.place_order(&request).await
    }

    /// Sell to open with a contingent buy stop submitted in the same call.
    ///
    /// The parent carries a client order id and the stop references it via
    /// `parentId`. Both legs land in the ledger, the stop linked to the parent.
    #[instrument(skip(self, order), fields(symbol = %order.symbol, strike = %order.strike))]
    pub async fn place_option_order_with_stop(&self, order: &OptionOrder, stop_price: Decimal) -> Result<BracketAck> {
        if order.side != OrderSide::Sell {
            return Err(BrokerError::rejected(
                None,
                "protective stops are only attached to sell-to-open orders",
            ));
        }
        let parent_req = self.option_request(order).await?;
        let stop_req = OrderRequest::stop(
            parent_req.conid,
            parent_req.symbol.clone(),
            OrderSide::Buy,
            parent_req.quantity,
            stop_price,
        );
        parent_req.validate()?;
        stop_req.validate()?;

        let account = self.gateway.account_id().await?;
        let now = self.now();
        let mut parent = ledger_entry(&parent_req, now);
        let mut stop = ledger_entry(&stop_req, now);
        stop.parent_id = Some(parent.local_id);
        self.ledger.upsert(&parent)?;
        self.ledger.upsert(&stop)?;

        let parent_ref = parent.local_id.to_string();
        let stop_ref = stop.local_id.to_string();
        let payloads = vec![
            order_payload(&account, &parent_req, &parent_ref, None),
            order_payload(&account, &stop_req, &stop_ref, Some(&parent_ref)),
        ];

        let placed = match self.submit(&account, payloads).await {
            Ok(placed) => placed,
            Err(e) => {
                self.record_failure(&mut parent, &e);
                self.record_failure(&mut stop, &e);
                return Err(e);
            }
        };

        let (parent_ack, stop_ack) = match_bracket(&placed, &parent_ref, &stop_ref);
        let Some(parent_ack) = parent_ack else {
            return Err(BrokerError::Decode("bracket reply carried no acknowledgement".into()));
        };
        self.apply_ack(&mut parent, &parent_ack)?;

        let Some(stop_ack) = stop_ack else {
            error!(
                order_id = %parent_ack.id,
                symbol = %parent_req.symbol,
                "Parent order is live but the protective stop was not acknowledged"
            );
            self.record(
                "order_rejected",
                "failed",
                json!({"order_id": parent_ack.id, "local_id": stop_ref, "reason": "stop leg not acknowledged"}),
            );
            return Err(BrokerError::rejected(
                None,
                format!("stop leg for order {} was not acknowledged", parent_ack.id),
            ));
        };
        self.apply_ack(&mut stop, &stop_ack)?;

        info!(
            symbol = %parent_req.symbol,
            parent = %parent_ack.id,
            stop = %stop_ack.id,
            limit = ?parent_req.price,
            stop_price = %stop_price,
            "Bracket placed"
        );
        self.record(
            "order_submitted",
            "ok",
            json!({
                "order_id": parent_ack.id,
                "stop_order_id": stop_ack.id,
                "local_id": parent_ref,
                "stop_local_id": stop_ref,
                "symbol": parent_req.symbol,
                "conid": parent_req.conid,
            }),
        );

        Ok(BracketAck {
            parent: parent_ack,
            stop: stop_ack,
            parent_local_id: parent.local_id,
            stop_local_id: stop.local_id,
        })
    }

    /// Live orders as the gateway lists them.
    pub async fn get_open_orders(&self) -> Result<Vec<OpenOrder>> {
        let orders = self.list_orders().await?;
        Ok(orders
            .into_iter()
            .filter(|o| !OrderStatus::parse(&o.status).is_some_and(|s| s.is_terminal()))
            .collect())
    }

    /// Cancel one order. An order the gateway no longer knows is reported
    /// as [`CancelOutcome::NotFound`] and treated as already resolved.
    #[instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: &str) -> Result<CancelOutcome> {
        if !is_plausible_order_id(order_id) {
            return Err(BrokerError::rejected(None, format!("{order_id} is not a gateway order id")));
        }
        let account = self.gateway.account_id().await?;
        let outcome = self.cancel_upstream(&account, order_id).await?;

        if outcome != CancelOutcome::Failed {
            self.settle_cancelled(order_id)?;
        }
        let status = if outcome == CancelOutcome::Failed { "failed" } else { "ok" };
        self.record("order_cancelled", status, json!({"order_id": order_id, "outcome": outcome}));
        Ok(outcome)
    }

    /// Cancel every open order.
    ///
    /// Ids come from the gateway's open-order list, or from the local ledger
    /// when that list is empty. Ledger entries without a numeric upstream id
    /// are skipped. Ledger-sourced ids are settled whatever the upstream
    /// outcome; gateway-listed ids only once cancelled or gone.
    #[instrument(skip(self))]
    pub async fn cancel_all_orders(&self) -> Result<CancelReport> {
        let account = self.gateway.account_id().await?;
        let mut report = CancelReport::default();

        let upstream = self.get_open_orders().await?;
        let mut ids: Vec<String> = if upstream.is_empty() {
            report.from_ledger = true;
            let mut ids = Vec::new();
            for order in self.ledger.open_orders()? {
                match order.upstream_id.as_deref() {
                    Some(id) if is_plausible_order_id(id) => ids.push(id.to_string()),
                    other => {
                        debug!(local_id = %order.local_id, upstream_id = ?other, "Skipping ledger entry without a gateway id");
                        report.skipped.push(other.map_or_else(|| order.local_id.to_string(), str::to_string));
                    }
                }
            }
            ids
        } else {
            upstream
                .into_iter()
                .map(|o| o.order_id)
                .filter(|id| {
                    let plausible = is_plausible_order_id(id);
                    if !plausible {
                        warn!(order_id = %id, "Gateway listed an order with an unusable id");
                    }
                    plausible
                })
                .collect()
        };
        ids.sort();
        ids.dedup();

        for id in ids {
            report.attempted.push(id.clone());
            match self.cancel_upstream(&account, &id).await {
                Ok(CancelOutcome::Cancelled) => report.cancelled.push(id.clone()),
                Ok(CancelOutcome::NotFound) => report.not_found.push(id.clone()),
                Ok(CancelOutcome::Failed) => report.failed.push(id.clone()),
                Err(e) => {
                    warn!(order_id = %id, error = %e, "Cancel request failed");
                    report.failed.push(id.clone());
                }
            }

            // Orders the gateway still lists stay open locally when the cancel fails
            let settle = report.from_ledger || !report.failed.contains(&id);
            if !settle {
                continue;
            }
            match self.settle_cancelled(&id) {
                Ok(true) => report.reconciled += 1,
                Ok(false) => {}
                Err(e) => warn!(order_id = %id, error = %e, "Failed to update ledger after cancel"),
            }
        }

        info!(
            from_ledger = report.from_ledger,
            attempted = report.attempted.len(),
            cancelled = report.cancelled.len(),
            not_found = report.not_found.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Cancel-all finished"
        );
        let status = if report.failed.is_empty() { "ok" } else { "partial" };
        self.record(
            "cancel_all",
            status,
            serde_json::to_value(&report).unwrap_or(Value::Null),
        );
        Ok(report)
    }

    /// Pull upstream order status into open ledger entries.
    #[instrument(skip(self))]
    pub async fn reconcile_orders(&self) -> Result<ReconcileReport> {
        let upstream = self.list_orders().await?;
        let by_id: HashMap<&str, &OpenOrder> = upstream.iter().map(|o| (o.order_id.as_str(), o)).collect();
        let now = self.now();
        let mut report = ReconcileReport::default();

        for mut order in self.ledger.open_orders()? {
            let Some(id) = order.upstream_id.clone().filter(|id| is_plausible_order_id(id)) else {
                continue;
            };
            report.checked += 1;

            let status = by_id.get(id.as_str()).and_then(|o| OrderStatus::parse(&o.status));
            match status {
                Some(OrderStatus::Filled) => {
                    order.mark_filled(now);
                    report.filled.push(id);
                }
                Some(OrderStatus::Cancelled) => {
                    order.mark_cancelled(now);
                    report.cancelled.push(id);
                }
                Some(OrderStatus::Rejected) => {
                    order.status = OrderStatus::Rejected;
                    report.rejected.push(id);
                }
                Some(live) => {
                    order.status = live;
                    report.still_open.push(id);
                }
                None => {
                    report.still_open.push(id);
                    continue;
                }
            }
            self.ledger.upsert(&order)?;
        }

        info!(
            checked = report.checked,
            filled = report.filled.len(),
            cancelled = report.cancelled.len(),
            rejected = report.rejected.len(),
            "Orders reconciled"
        );
        self.record("reconcile", "ok", serde_json::to_value(&report).unwrap_or(Value::Null));
        Ok(report)
    }

    async fn option_request(&self, order: &OptionOrder) -> Result<OrderRequest> {
        let underlying = self.resolver.resolve_underlying(&order.symbol).await?;
        let contract = self
            .resolver
            .resolve_contract(&underlying, order.expiration, order.right, order.strike)
            .await?;
        Ok(OrderRequest {
            conid: contract.conid,
            symbol: contract.display_name(),
            side: order.side,
            quantity: order.quantity,
            order_type: order.order_type,
            price: order.price,
            stop_price: order.stop_price,
        })
    }

    /// Submit `orders` and answer confirmation prompts until every order is
    /// acknowledged or the round limit is hit. A reply may carry one prompt
    /// per leg; each is confirmed in the same round.
    async fn submit(&self, account: &str, orders: Vec<Value>) -> Result<Vec<Placement>> {
        let req = ApiRequest::post(format!("/iserver/account/{account}/orders"), json!({ "orders": orders }));
        let mut bodies = vec![self.post_order(&req).await?];
        let mut placed = Vec::new();
        let mut unknown = Vec::new();
        let mut rounds = 0u32;

        loop {
            let mut prompts = Vec::new();
            for body in bodies.drain(..) {
                for entry in decode_reply(body)? {
                    match entry {
                        ReplyEntry::Placed { ack, local_ref } => placed.push(Placement { ack, local_ref }),
                        ReplyEntry::Prompt { reply_id, messages } => {
                            info!(reply_id = %reply_id, ?messages, "Confirming order warning");
                            prompts.push(reply_id);
                        }
                        ReplyEntry::Rejected { code, message } => {
                            warn!(code = ?code, message = %message, "Order rejected");
                            return Err(BrokerError::rejected(code, message));
                        }
                        ReplyEntry::Unknown(raw) => {
                            warn!(entry = %raw, "Unrecognized entry in order reply");
                            unknown.push(raw);
                        }
                    }
                }
            }

            if prompts.is_empty() {
                if placed.is_empty() {
                    return Err(BrokerError::Decode(format!(
                        "order reply carried no order id: {}",
                        Value::Array(unknown)
                    )));
                }
                return Ok(placed);
            }

            rounds += 1;
            if rounds > self.max_confirmation_rounds {
                return Err(BrokerError::rejected(
                    None,
                    format!("order still unconfirmed after {} reply rounds", self.max_confirmation_rounds),
                ));
            }
            for reply_id in prompts {
                let reply = ApiRequest::post(
                    format!("/iserver/reply/{}", urlencoding::encode(&reply_id)),
                    json!({ "confirmed": true }),
                );
                bodies.push(self.post_order(&reply).await?);
            }
        }
    }

    async fn post_order(&self, req: &ApiRequest) -> Result<Value> {
        self.gateway
            .call(req)
            .await
            .map(|resp| resp.body)
            .map_err(order_error)
    }

    async fn cancel_upstream(&self, account: &str, order_id: &str) -> Result<CancelOutcome> {
        let req = ApiRequest::delete(format!("/iserver/account/{account}/order/{order_id}"));
        match self.gateway.call(&req).await {
            Ok(resp) => match resp.body.get("error").and_then(Value::as_str) {
                Some(msg) if looks_not_found(msg) => Ok(CancelOutcome::NotFound),
                Some(msg) => {
                    warn!(order_id, message = %msg, "Gateway refused cancel");
                    Ok(CancelOutcome::Failed)
                }
                None => Ok(CancelOutcome::Cancelled),
            },
            Err(BrokerError::Http { status: 404, .. }) => Ok(CancelOutcome::NotFound),
            Err(BrokerError::Http { status, message, .. }) if status < 500 => {
                if looks_not_found(&message) {
                    Ok(CancelOutcome::NotFound)
                } else {
                    warn!(order_id, status, message = %message, "Gateway refused cancel");
                    Ok(CancelOutcome::Failed)
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn list_orders(&self) -> Result<Vec<OpenOrder>> {
        let resp = self.gateway.call(&ApiRequest::get("/iserver/account/orders")).await?;
        let rows = match resp.body {
            Value::Array(rows) => rows,
            Value::Object(mut map) => match map.remove("orders") {
                Some(Value::Array(rows)) => rows,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        Ok(rows.iter().filter_map(parse_open_order).collect())
    }

    /// Move the ledger entry for `upstream_id` to cancelled. Returns whether
    /// an open entry was changed.
    fn settle_cancelled(&self, upstream_id: &str) -> Result<bool> {
        match self.ledger.find_by_upstream_id(upstream_id)? {
            Some(mut order) if !order.status.is_terminal() => {
                order.mark_cancelled(self.now());
                self.ledger.upsert(&order)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn apply_ack(&self, entry: &mut LedgerOrder, ack: &OrderAck) -> Result<()> {
        entry.upstream_id = Some(ack.id.clone());
        entry.status = OrderStatus::parse(&ack.status).unwrap_or(OrderStatus::Submitted);
        if entry.status == OrderStatus::Filled {
            entry.filled_at.get_or_insert(self.now());
        }
        self.ledger.upsert(entry)
    }

    fn record_failure(&self, entry: &mut LedgerOrder, err: &BrokerError) {
        let event_type = match err {
            BrokerError::OrderRejected { .. } => {
                entry.status = OrderStatus::Rejected;
                "order_rejected"
            }
            _ => "order_failed",
        };
        if let Err(e) = self.ledger.upsert(entry) {
            warn!(local_id = %entry.local_id, error = %e, "Failed to update ledger");
        }
        self.record(
            event_type,
            "failed",
            json!({"local_id": entry.local_id, "symbol": entry.symbol, "error": err.to_string()}),
        );
    }
}

fn ledger_entry(request: &OrderRequest, at: DateTime<Utc>) -> LedgerOrder {
    let mut entry = LedgerOrder::new(
        request.symbol.clone(),
        Some(request.conid),
        request.side,
        request.quantity,
        request.order_type,
        at,
    );
    entry.price = request.price;
    entry.stop_price = request.stop_price;
    entry
}

fn number(value: Decimal) -> Value {
    value.to_f64().map(Value::from).unwrap_or(Value::Null)
}

/// Gateway order body. Stops carry the trigger in `price`; stop-limits put
/// the limit in `price` and the trigger in `auxPrice`.
pub fn order_payload(account: &str, request: &OrderRequest, local_ref: &str, parent_ref: Option<&str>) -> Value {
    let mut payload = json!({
        "acctId": account,
        "conid": request.conid,
        "orderType": request.order_type.as_str(),
        "side": request.side.as_str(),
        "quantity": number(request.quantity),
        "tif": DEFAULT_TIF,
        "cOID": local_ref,
    });

    let (price, aux) = match request.order_type {
        OrderType::Market => (None, None),
        OrderType::Limit => (request.price, None),
        OrderType::Stop => (request.stop_price, None),
        OrderType::StopLimit => (request.price, request.stop_price),
    };
    if let Some(price) = price {
        payload["price"] = number(price);
    }
    if let Some(aux) = aux {
        payload["auxPrice"] = number(aux);
    }
    if let Some(parent) = parent_ref {
        payload["parentId"] = json!(parent);
    }
    payload
}

/// Pair bracket acknowledgements with their legs by client order id, or by
/// position when the gateway does not echo it.
fn match_bracket(placed: &[Placement], parent_ref: &str, stop_ref: &str) -> (Option<OrderAck>, Option<OrderAck>) {
    let by_ref = |wanted: &str| {
        placed
            .iter()
            .find(|p| p.local_ref.as_deref() == Some(wanted))
            .map(|p| p.ack.clone())
    };
    match (by_ref(parent_ref), by_ref(stop_ref)) {
        (Some(parent), Some(stop)) => (Some(parent), Some(stop)),
        _ => {
            let mut acks = placed.iter().map(|p| p.ack.clone());
            (acks.next(), acks.next())
        }
    }
}

fn looks_not_found(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["not found", "doesn't exist", "does not exist", "already", "cannot be cancelled"]
        .iter()
        .any(|needle| message.contains(needle))
}

/// 4xx replies from order endpoints are rejections.
fn order_error(err: BrokerError) -> BrokerError {
    match err {
        BrokerError::Http { status, message, .. } if (400..500).contains(&status) => {
            let message = serde_json::from_str::<Value>(&message)
                .ok()
                .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
                .unwrap_or(message);
            BrokerError::rejected(Some(status.to_string()), message)
        }
        other => other,
    }
}

fn parse_open_order(row: &Value) -> Option<OpenOrder> {
    let order_id = match row.get("orderId")? {
        Value::Number(n) => n.to_string(),
        Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        _ => return None,
    };
    let text = |key: &str| row.get(key).and_then(Value::as_str).unwrap_or_default();
    let amount = |key: &str| row.get(key).and_then(decimal_from_value);

    Some(OpenOrder {
        order_id,
        conid: row.get("conid").and_then(|c| c.as_i64().or_else(|| c.as_str()?.parse().ok())),
        symbol: text("ticker").to_string(),
        side: OrderSide::parse(text("side")),
        order_type: OrderType::parse(text("orderType")),
        quantity: amount("totalSize").unwrap_or_default(),
        filled_quantity: amount("filledQuantity").unwrap_or_default(),
        price: amount("price"),
        status: text("status").to_string(),
    })
}
