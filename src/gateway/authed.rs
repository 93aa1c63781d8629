//! Authenticated data calls.
//!
//! Wraps every account, contract, market-data and order request:
//! readiness check first, then the call with the working auth strategy.
//! - 401/403/410: force a full session refresh and retry once; a second
//!   occurrence surfaces as `SessionExpired`
//! - 429/503: bounded fixed-delay retries

use super::http::{ApiRequest, ApiResponse, GatewayHttp};
use crate::auth::SessionController;
use crate::error::{BrokerError, Result};
use crate::utils::{BackoffPolicy, Clock, Sleeper};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Session-aware gateway handle shared by the adapters.
#[derive(Clone)]
pub struct AuthedGateway {
    http: Arc<GatewayHttp>,
    controller: Arc<SessionController>,
    throttle: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl AuthedGateway {
    pub fn new(
        http: Arc<GatewayHttp>,
        controller: Arc<SessionController>,
        throttle: BackoffPolicy,
        sleeper: Arc<dyn Sleeper>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            http,
            controller,
            throttle,
            sleeper,
            clock,
        }
    }

    pub async fn call(&self, req: &ApiRequest) -> Result<ApiResponse> {
        let mut refreshed = false;
        let mut throttled = 0u32;

        loop {
            self.controller.ensure_ready().await?;
            let strategy = self
                .controller
                .pipeline()
                .auth_strategy()
                .await
                .ok_or_else(|| BrokerError::SessionExpired("no working auth strategy".into()))?;

            match self.http.send(req, &strategy).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.invalidates_session() => {
                    if refreshed {
                        self.controller.pipeline().reset().await;
                        return Err(BrokerError::SessionExpired(format!(
                            "{} still rejected after session refresh ({e})",
                            req.path
                        )));
                    }
                    refreshed = true;
                    warn!(endpoint = %req.path, error = %e, "Session rejected, refreshing and retrying once");
                    self.controller.force_refresh().await?;
                }
                Err(BrokerError::RateLimited { endpoint }) => match self.throttle.delay_for(throttled) {
                    Some(delay) => {
                        throttled += 1;
                        warn!(endpoint = %endpoint, attempt = throttled, delay_ms = delay.as_millis() as u64, "Throttled, backing off");
                        self.sleeper.sleep(delay).await;
                    }
                    None => return Err(BrokerError::RateLimited { endpoint }),
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Call and decode the body.
    pub async fn call_json<T: DeserializeOwned>(&self, req: &ApiRequest) -> Result<T> {
        let resp = self.call(req).await?;
        serde_json::from_value(resp.body)
            .map_err(|e| BrokerError::Decode(format!("{}: {e}", req.path)))
    }

    /// The selected trading account; bootstraps if needed.
    pub async fn account_id(&self) -> Result<String> {
        self.controller.ensure_ready().await?;
        self.controller
            .pipeline()
            .account_id()
            .await
            .ok_or_else(|| BrokerError::SessionExpired("no trading account selected".into()))
    }

    pub async fn ensure_ready(&self) -> Result<()> {
        self.controller.ensure_ready().await
    }

    pub async fn pause(&self, delay: Duration) {
        if !delay.is_zero() {
            self.sleeper.sleep(delay).await;
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }
}
