//! Per-tenant broker client.
//!
//! Wires the transport, handshake, keepalive and adapters together. One
//! `BrokerClient` owns one session; nothing is shared between clients.

use crate::account::{AccountAdapter, AccountSnapshot, AssignmentEvent, OptionPosition, StockPosition};
use crate::auth::{AssertionSigner, AuthPipeline, DiagnosticsSnapshot, PipelineSettings, SessionController};
use crate::config::Config;
use crate::error::Result;
use crate::gateway::{AuthedGateway, GatewayHttp};
use crate::market::{ContractResolver, MarketService, OptionChain, SnapshotFetcher, UnderlyingQuote};
use crate::orders::{
    BracketAck, CancelOutcome, CancelReport, OpenOrder, OptionOrder, OrderAck, OrderExecutor, OrderRequest,
    ReconcileReport,
};
use crate::persistence::{AuditSink, OrderLedger, SqliteStore};
use crate::utils::{BackoffPolicy, Clock, Sleeper, SystemClock, TokioSleeper};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Collaborators a client is built from.
pub struct ClientParts {
    pub config: Config,
    pub signer: Arc<AssertionSigner>,
    pub clock: Arc<dyn Clock>,
    pub sleeper: Arc<dyn Sleeper>,
    pub ledger: Arc<dyn OrderLedger>,
    pub audit: Arc<dyn AuditSink>,
}

/// Entry point for the trading engine.
pub struct BrokerClient {
    controller: Arc<SessionController>,
    account: AccountAdapter,
    market: MarketService,
    orders: OrderExecutor,
    clock: Arc<dyn Clock>,
}

impl BrokerClient {
    /// Production wiring: key from config, SQLite ledger, system time.
    pub fn from_config(config: &Config) -> Result<Self> {
        let signer = Arc::new(AssertionSigner::from_config(&config.credentials)?);
        let store = Arc::new(SqliteStore::new(&config.persistence.db_path)?);
        Self::with_parts(ClientParts {
            config: config.clone(),
            signer,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            ledger: store.clone(),
            audit: store,
        })
    }

    pub fn with_parts(parts: ClientParts) -> Result<Self> {
        let ClientParts {
            config,
            signer,
            clock,
            sleeper,
            ledger,
            audit,
        } = parts;

        let http = Arc::new(GatewayHttp::new(&config.gateway)?);
        let pipeline = Arc::new(AuthPipeline::new(
            http.clone(),
            signer,
            PipelineSettings::from_config(&config),
            clock.clone(),
            sleeper.clone(),
            audit.clone(),
        ));
        let controller = Arc::new(SessionController::new(pipeline));

        let throttle = BackoffPolicy::fixed(
            config.session.rate_limit_retries,
            Duration::from_millis(config.session.rate_limit_backoff_ms),
        );
        let gateway = AuthedGateway::new(http, controller.clone(), throttle, sleeper, clock.clone());

        let resolver = Arc::new(ContractResolver::new(
            gateway.clone(),
            config.market_data.contract_pacing(),
        ));
        let market = MarketService::new(
            resolver.clone(),
            SnapshotFetcher::new(gateway.clone(), &config.market_data),
            config.market_data.default_volatility_pct,
        );
        let orders = OrderExecutor::new(
            gateway.clone(),
            resolver,
            ledger,
            audit,
            config.session.max_confirmation_rounds,
        );

        info!(
            environment = ?config.gateway.environment,
            api = %config.gateway.api_url,
            "Broker client created"
        );

        Ok(Self {
            controller,
            account: AccountAdapter::new(gateway),
            market,
            orders,
            clock,
        })
    }

    /// Bootstrap or refresh the session if needed.
    pub async fn ensure_ready(&self) -> Result<()> {
        self.controller.ensure_ready().await
    }

    pub async fn get_account(&self) -> Result<AccountSnapshot> {
        self.account.get_account().await
    }

    pub async fn get_positions(&self) -> Result<Vec<OptionPosition>> {
        self.account.get_positions().await
    }

    pub async fn get_stock_positions(&self) -> Result<Vec<StockPosition>> {
        self.account.get_stock_positions().await
    }

    /// Stock holdings that appeared or grew since the previous call.
    pub async fn detect_assignments(&self) -> Result<Vec<AssignmentEvent>> {
        self.account.detect_assignments().await
    }

    pub fn reset_assignment_tracking(&self) {
        self.account.reset_assignment_tracking();
    }

    pub fn assignment_baseline(&self) -> Option<Vec<StockPosition>> {
        self.account.assignment_baseline()
    }

    pub fn seed_assignment_baseline(&self, holdings: Vec<StockPosition>) {
        self.account.seed_assignment_baseline(holdings);
    }

    pub async fn get_market_data(&self, symbol: &str) -> Result<UnderlyingQuote> {
        self.market.get_market_data(symbol).await
    }

    /// Chain restricted to the volatility band; `expiration` defaults to
    /// today (New York) before the close, else the next weekday.
    pub async fn get_option_chain_with_strikes(
        &self,
        symbol: &str,
        expiration: Option<NaiveDate>,
    ) -> Result<OptionChain> {
        self.market
            .get_option_chain_with_strikes(symbol, expiration, self.clock.now())
            .await
    }

    pub async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        self.orders.place_order(request).await
    }

    pub async fn place_option_order(&self, order: &OptionOrder) -> Result<OrderAck> {
        self.orders.place_option_order(order).await
    }

    pub async fn place_option_order_with_stop(&self, order: &OptionOrder, stop_price: Decimal) -> Result<BracketAck> {
        self.orders.place_option_order_with_stop(order, stop_price).await
    }

    pub async fn get_open_orders(&self) -> Result<Vec<OpenOrder>> {
        self.orders.get_open_orders().await
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<CancelOutcome> {
        self.orders.cancel_order(order_id).await
    }

    pub async fn cancel_all_orders(&self) -> Result<CancelReport> {
        self.orders.cancel_all_orders().await
    }

    pub async fn reconcile_orders(&self) -> Result<ReconcileReport> {
        self.orders.reconcile_orders().await
    }

    pub async fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.controller.pipeline().diagnostics().await
    }

    /// End the upstream session and wipe local session and tracking state.
    pub async fn logout(&self) -> Result<()> {
        self.account.reset_assignment_tracking();
        self.controller.logout().await
    }

    pub fn session_controller(&self) -> &Arc<SessionController> {
        &self.controller
    }

    pub fn market(&self) -> &MarketService {
        &self.market
    }
}
