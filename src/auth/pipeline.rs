//! Four-phase gateway handshake.
//!
//! `UNAUTHENTICATED → OAUTH_ACQUIRED → SSO_CREATED → VALIDATED → GATEWAY_INIT → READY`
//!
//! The pipeline owns the tenant's [`Session`]. It is only driven through the
//! [`SessionController`](super::SessionController), whose single-flight guard
//! makes `bootstrap` the one critical section that mutates session state.

use super::{AssertionSigner, AuthStrategy, Diagnostics, DiagnosticsSnapshot, PhaseStatus, Session};
use crate::config::{Config, Environment, SessionConfig};
use crate::error::{AuthPhase, BrokerError, Result};
use crate::gateway::http::{ApiRequest, ApiResponse, Base, GatewayHttp};
use crate::gateway::types::{AccountsResponse, AuthStatus, SsoSessionResponse, TickleResponse, TokenResponse};
use crate::persistence::{audit, AuditEvent, AuditSink};
use crate::utils::{Clock, Sleeper};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

pub const TOKEN_PATH: &str = "/api/v1/token";
pub const SSO_SESSIONS_PATH: &str = "/api/v1/sso-sessions";
pub const VALIDATE_PATH: &str = "/sso/validate";
pub const INIT_PATH: &str = "/iserver/auth/ssodh/init";
pub const TICKLE_PATH: &str = "/tickle";
pub const LOGOUT_PATH: &str = "/logout";
pub const ACCOUNTS_PATH: &str = "/iserver/accounts";
pub const SELECT_ACCOUNT_PATH: &str = "/iserver/account";

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Assumed OAuth token lifetime when the token endpoint omits `expires_in`.
const DEFAULT_OAUTH_TTL_SECS: i64 = 600;

/// Paper trading account ids start with this prefix.
const PAPER_ACCOUNT_PREFIX: &str = "DU";

/// Handshake inputs that come from configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub session: SessionConfig,
    pub environment: Environment,
    pub account_id: Option<String>,
    pub scope: String,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            session: config.session.clone(),
            environment: config.gateway.environment,
            account_id: config.gateway.account_id.clone().filter(|a| !a.is_empty()),
            scope: config.credentials.scope.clone(),
        }
    }
}

/// How much work the next `ensure_ready` has to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Everything valid and recently confirmed
    Fresh,
    /// Valid, but the brokerage session has not been confirmed recently
    HeartbeatDue,
    /// Something expired or was never established
    Stale,
}

/// Drives the OAuth → SSO → validate → init handshake for one tenant.
pub struct AuthPipeline {
    http: Arc<GatewayHttp>,
    signer: Arc<AssertionSigner>,
    settings: PipelineSettings,
    session: RwLock<Session>,
    diagnostics: Diagnostics,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    audit: Arc<dyn AuditSink>,
}

impl AuthPipeline {
    pub fn new(
        http: Arc<GatewayHttp>,
        signer: Arc<AssertionSigner>,
        settings: PipelineSettings,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            http,
            signer,
            settings,
            session: RwLock::new(Session::new()),
            diagnostics: Diagnostics::new(),
            clock,
            sleeper,
            audit,
        }
    }

    /// Run the handshake. Phases whose tokens are still fresh are skipped
    /// unless `force` is set.
    ///
    /// A 410 at any phase wipes the session and restarts once with `force`;
    /// a second 410 surfaces as `SessionExpired`. Repeated 401/403 at
    /// validate also surfaces as `SessionExpired`.
    #[instrument(skip(self))]
    pub async fn bootstrap(&self, force: bool) -> Result<()> {
        self.diagnostics.begin_run();
        info!(force, "Starting session bootstrap");

        let outcome = match self.run_phases(force).await {
            Err(e) if e.is_session_gone() => {
                warn!(error = %e, "Gateway reported the session gone, wiping state and retrying once");
                self.reset().await;
                match self.run_phases(true).await {
                    Err(e) if e.is_session_gone() => Err(BrokerError::SessionExpired(format!(
                        "session gone again after forced refresh ({e})"
                    ))),
                    other => other,
                }
            }
            other => other,
        };

        let outcome = outcome.map_err(|e| match e {
            BrokerError::Unauthorized { endpoint, status } => BrokerError::SessionExpired(format!(
                "{endpoint} rejected every auth strategy ({status}) after reset"
            )),
            other => other,
        });

        if let Err(e) = &outcome {
            if e.invalidates_session() {
                self.reset().await;
            }
        }
        self.diagnostics.finish_run(&outcome);

        let now = self.clock.now();
        match &outcome {
            Ok(()) => {
                let session = self.session.read().await;
                let strategy = session.auth_strategy.as_ref().map(AuthStrategy::label);
                info!(
                    strategy = strategy.unwrap_or("none"),
                    account = session.account_id.as_deref().unwrap_or(""),
                    "Session ready"
                );
                audit(
                    self.audit.as_ref(),
                    AuditEvent::new(
                        "bootstrap",
                        "ok",
                        json!({"strategy": strategy, "account_id": session.account_id, "forced": force}),
                        now,
                    ),
                );
            }
            Err(e) => {
                error!(error = %e, "Session bootstrap failed");
                audit(
                    self.audit.as_ref(),
                    AuditEvent::new(
                        "bootstrap",
                        "failed",
                        json!({"error": e.to_string(), "forced": force}),
                        now,
                    ),
                );
            }
        }

        outcome
    }

    async fn run_phases(&self, force: bool) -> Result<()> {
        let now = self.clock.now();
        let cfg = &self.settings.session;
        let (oauth_fresh, sso_fresh, gateway_ready) = {
            let session = self.session.read().await;
            (
                session.oauth_valid(now, cfg.oauth_refresh_margin()),
                session.sso_valid(now, cfg.sso_practical_lifetime()),
                session.session_ready && session.account_selected,
            )
        };

        if force || !oauth_fresh {
            self.acquire_oauth().await?;
        } else {
            self.diagnostics.skipped(AuthPhase::OAuth, now);
        }

        let sso_renewed = force || !sso_fresh;
        if sso_renewed {
            self.create_sso().await?;
        } else {
            self.diagnostics.skipped(AuthPhase::Sso, now);
        }

        let was_reset = self.validate_with_reset().await?;

        if force || sso_renewed || was_reset || !gateway_ready {
            self.init_gateway().await?;
            self.select_account().await?;
        } else {
            self.diagnostics.skipped(AuthPhase::Init, now);
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn acquire_oauth(&self) -> Result<()> {
        let now = self.clock.now();
        let result = async {
            let assertion = self.signer.oauth_assertion(now)?;
            let form = [
                ("client_assertion_type", CLIENT_ASSERTION_TYPE),
                ("client_assertion", assertion.as_str()),
                ("grant_type", "client_credentials"),
                ("scope", self.settings.scope.as_str()),
            ];
            let resp = self.http.post_form(Base::OAuth, TOKEN_PATH, &form).await?;
            let token: TokenResponse = serde_json::from_value(resp.body.clone())?;
            Ok::<_, BrokerError>((resp, token))
        }
        .await;

        let (resp, token) = result.map_err(|e| self.phase_failed(AuthPhase::OAuth, e, now))?;
        let ttl = token
            .expires_in
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_OAUTH_TTL_SECS);

        {
            let mut session = self.session.write().await;
            session.oauth_token = Some(token.access_token);
            session.oauth_expires_at = Some(now + chrono::Duration::seconds(ttl));
        }
        self.diagnostics
            .ok(AuthPhase::OAuth, resp.status, resp.request_id, now);
        info!(expires_in = ttl, "OAuth access token acquired");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_sso(&self) -> Result<()> {
        let now = self.clock.now();
        let oauth_token = self.session.read().await.oauth_token.clone();

        let result = async {
            let oauth_token = oauth_token
                .ok_or_else(|| BrokerError::auth_failed(AuthPhase::Sso, None, "no OAuth token"))?;
            let assertion = self.signer.sso_assertion(now)?;
            let resp = self
                .http
                .post_jwt(Base::Gateway, SSO_SESSIONS_PATH, assertion, &oauth_token)
                .await?;
            let sso: SsoSessionResponse = match &resp.body {
                Value::Object(_) => serde_json::from_value(resp.body.clone())?,
                _ => SsoSessionResponse::default(),
            };
            Ok::<_, BrokerError>((resp, sso))
        }
        .await;

        let (resp, sso) = result.map_err(|e| self.phase_failed(AuthPhase::Sso, e, now))?;
        let token = sso.access_token.filter(|t| !t.is_empty());
        let cookie_backed = token.is_none();

        {
            let mut session = self.session.write().await;
            session.sso_token = token;
            session.sso_expires_at = sso
                .expires_in
                .filter(|s| *s > 0)
                .map(|s| now + chrono::Duration::seconds(s));
            session.sso_created_at = Some(now);
            // A new SSO session needs a fresh brokerage init
            session.session_ready = false;
            session.account_selected = false;
            session.auth_strategy = None;
        }

        let detail = cookie_backed.then(|| "cookie-backed session".to_string());
        self.diagnostics.record(
            AuthPhase::Sso,
            PhaseStatus::Ok,
            Some(resp.status),
            resp.request_id,
            detail,
            now,
        );
        info!(cookie_backed, "SSO session created");
        Ok(())
    }

    /// Probe the session with each auth strategy in turn, keeping the first
    /// the gateway accepts.
    #[instrument(skip(self))]
    async fn validate(&self) -> Result<()> {
        let now = self.clock.now();
        let strategies = {
            let session = self.session.read().await;
            let mut strategies = Vec::with_capacity(3);
            if let Some(token) = &session.sso_token {
                strategies.push(AuthStrategy::SsoBearer(token.clone()));
            }
            if let Some(token) = &session.oauth_token {
                strategies.push(AuthStrategy::OAuthBearer(token.clone()));
            }
            strategies.push(AuthStrategy::CookieOnly);
            strategies
        };

        let req = ApiRequest::get(VALIDATE_PATH);
        let mut denied = None;

        for strategy in strategies {
            match self.http.send(&req, &strategy).await {
                Ok(resp) if validate_accepted(&resp.body) => {
                    {
                        let mut session = self.session.write().await;
                        session.auth_strategy = Some(strategy.clone());
                        session.last_validate = Some(now);
                    }
                    self.diagnostics.record(
                        AuthPhase::Validate,
                        PhaseStatus::Ok,
                        Some(resp.status),
                        resp.request_id,
                        Some(strategy.label().to_string()),
                        now,
                    );
                    info!(strategy = strategy.label(), "Session validated");
                    return Ok(());
                }
                Ok(_) => {
                    debug!(strategy = strategy.label(), "Validate reported the session invalid");
                    denied = Some(BrokerError::Unauthorized {
                        endpoint: VALIDATE_PATH.to_string(),
                        status: 401,
                    });
                }
                Err(e @ BrokerError::Unauthorized { .. }) => {
                    debug!(strategy = strategy.label(), error = %e, "Validate rejected auth strategy");
                    denied = Some(e);
                }
                Err(e) => return Err(self.phase_failed(AuthPhase::Validate, e, now)),
            }
        }

        let err = denied.unwrap_or(BrokerError::Unauthorized {
            endpoint: VALIDATE_PATH.to_string(),
            status: 401,
        });
        Err(self.phase_failed(AuthPhase::Validate, err, now))
    }

    /// Validate, and on a blanket 401/403 wipe the session and redo OAuth,
    /// SSO and validate exactly once. Returns whether the reset happened.
    async fn validate_with_reset(&self) -> Result<bool> {
        match self.validate().await {
            Ok(()) => Ok(false),
            Err(BrokerError::Unauthorized { status, .. }) => {
                warn!(status, "Every auth strategy was rejected at validate, resetting once");
                self.reset().await;
                self.acquire_oauth().await?;
                self.create_sso().await?;
                self.validate().await?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Claim the brokerage session. A "token generation" failure is retried
    /// exactly once after a fixed delay and one heartbeat.
    #[instrument(skip(self))]
    async fn init_gateway(&self) -> Result<()> {
        let strategy = self.current_strategy(AuthPhase::Init).await?;
        let req = ApiRequest::post(INIT_PATH, json!({"publish": true, "compete": true}));
        let mut retried = false;

        loop {
            let now = self.clock.now();
            match self.http.send(&req, &strategy).await.and_then(check_init_body) {
                Ok(resp) => {
                    {
                        let mut session = self.session.write().await;
                        session.session_ready = true;
                        session.last_init = Some(now);
                    }
                    self.diagnostics
                        .ok(AuthPhase::Init, resp.status, resp.request_id, now);
                    info!(strategy = strategy.label(), "Brokerage session initialized");
                    return Ok(());
                }
                Err(e) if !retried && is_token_generation_failure(&e) => {
                    retried = true;
                    let delay = self.settings.session.init_retry_delay();
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "Init hit a token generation failure, retrying once");
                    self.sleeper.sleep(delay).await;
                    if let Err(e) = self.tickle(&strategy).await {
                        debug!(error = %e, "Heartbeat before init retry failed");
                    }
                }
                Err(e) => return Err(self.phase_failed(AuthPhase::Init, e, now)),
            }
        }
    }

    /// Pick the trading account after init and make it the gateway's active one.
    #[instrument(skip(self))]
    async fn select_account(&self) -> Result<()> {
        let now = self.clock.now();
        let strategy = self.current_strategy(AuthPhase::Init).await?;

        let accounts: AccountsResponse = async {
            let resp = self.http.send(&ApiRequest::get(ACCOUNTS_PATH), &strategy).await?;
            Ok::<_, BrokerError>(serde_json::from_value(resp.body)?)
        }
        .await
        .map_err(|e| self.phase_failed(AuthPhase::Init, e, now))?;

        let chosen = choose_account(
            &accounts.accounts,
            self.settings.account_id.as_deref(),
            self.settings.environment,
        )
        .map_err(|message| {
            self.phase_failed(
                AuthPhase::Init,
                BrokerError::auth_failed(AuthPhase::Init, None, message),
                now,
            )
        })?;

        if accounts.selected_account.as_deref() != Some(chosen.as_str()) {
            let req = ApiRequest::post(SELECT_ACCOUNT_PATH, json!({"acctId": chosen}));
            self.http
                .send(&req, &strategy)
                .await
                .map_err(|e| self.phase_failed(AuthPhase::Init, e, now))?;
            debug!(account = %chosen, "Switched active account");
        }

        {
            let mut session = self.session.write().await;
            session.account_selected = true;
            session.account_id = Some(chosen.clone());
        }
        info!(account = %chosen, environment = ?self.settings.environment, "Trading account selected");
        Ok(())
    }

    /// Ping the brokerage session. `Ok(false)` means the gateway answered
    /// but no longer considers the session authenticated.
    #[instrument(skip(self))]
    pub async fn heartbeat(&self) -> Result<bool> {
        let strategy = self.current_strategy(AuthPhase::Init).await?;
        let alive = self.tickle(&strategy).await?.authenticated();
        if alive {
            self.session.write().await.last_heartbeat = Some(self.clock.now());
        }
        Ok(alive)
    }

    async fn tickle(&self, strategy: &AuthStrategy) -> Result<TickleResponse> {
        let resp = self.http.send(&ApiRequest::get(TICKLE_PATH), strategy).await?;
        Ok(serde_json::from_value(resp.body).unwrap_or_default())
    }

    /// End the upstream session and wipe local state. Local state is wiped
    /// even when the gateway call fails.
    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<()> {
        let strategy = self.session.read().await.auth_strategy.clone();
        let result = match strategy {
            Some(strategy) => self
                .http
                .send(&ApiRequest::post(LOGOUT_PATH, json!({})), &strategy)
                .await
                .map(|_| ()),
            None => Ok(()),
        };
        self.reset().await;

        let status = if result.is_ok() { "ok" } else { "failed" };
        audit(
            self.audit.as_ref(),
            AuditEvent::new("logout", status, Value::Null, self.clock.now()),
        );
        info!(status, "Logged out");
        result
    }

    pub async fn freshness(&self) -> Freshness {
        let now = self.clock.now();
        let cfg = &self.settings.session;
        let session = self.session.read().await;
        if !session.is_fresh(now, cfg.oauth_refresh_margin(), cfg.sso_practical_lifetime()) {
            Freshness::Stale
        } else if session.heartbeat_due(now, cfg.heartbeat_interval()) {
            Freshness::HeartbeatDue
        } else {
            Freshness::Fresh
        }
    }

    /// Wipe every token, flag and timestamp.
    pub async fn reset(&self) {
        self.session.write().await.reset();
        debug!("Session state wiped");
    }

    pub async fn mark_not_ready(&self) {
        self.session.write().await.mark_not_ready();
    }

    pub async fn session(&self) -> Session {
        self.session.read().await.clone()
    }

    pub async fn auth_strategy(&self) -> Option<AuthStrategy> {
        self.session.read().await.auth_strategy.clone()
    }

    pub async fn account_id(&self) -> Option<String> {
        self.session.read().await.account_id.clone()
    }

    pub async fn diagnostics(&self) -> DiagnosticsSnapshot {
        let session = self.session.read().await;
        self.diagnostics.snapshot(&session)
    }

    pub fn diagnostics_recorder(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn current_strategy(&self, phase: AuthPhase) -> Result<AuthStrategy> {
        self.session
            .read()
            .await
            .auth_strategy
            .clone()
            .ok_or_else(|| BrokerError::auth_failed(phase, None, "no validated auth strategy"))
    }

    fn phase_failed(&self, phase: AuthPhase, err: BrokerError, at: DateTime<Utc>) -> BrokerError {
        let err = classify(phase, err);
        self.diagnostics.failed(phase, &err, at);
        warn!(phase = %phase, error = %err, "Handshake phase failed");
        err
    }
}

/// Rejections become `AuthenticationFailed` for their phase. Session and
/// transport signals keep their own variants so the caller can react to them.
fn classify(phase: AuthPhase, err: BrokerError) -> BrokerError {
    match err {
        BrokerError::Http { status, message, .. } => {
            BrokerError::auth_failed(phase, Some(status), message)
        }
        BrokerError::Unauthorized { endpoint, status } if phase != AuthPhase::Validate => {
            BrokerError::auth_failed(phase, Some(status), format!("{endpoint} rejected the request"))
        }
        BrokerError::Decode(message) => {
            BrokerError::auth_failed(phase, None, format!("unexpected response: {message}"))
        }
        other => other,
    }
}

/// `{"RESULT": false}` marks an invalid session; any other 2xx body is accepted.
fn validate_accepted(body: &Value) -> bool {
    !matches!(body.get("RESULT").and_then(Value::as_bool), Some(false))
}

/// A 2xx init whose body says `authenticated: false` is still a failure.
fn check_init_body(resp: ApiResponse) -> Result<ApiResponse> {
    let status: AuthStatus = serde_json::from_value(resp.body.clone()).unwrap_or_default();
    if status.authenticated == Some(false) {
        let message = status
            .fail
            .filter(|m| !m.is_empty())
            .or(status.message)
            .unwrap_or_else(|| "brokerage session not authenticated".to_string());
        return Err(BrokerError::auth_failed(AuthPhase::Init, Some(resp.status), message));
    }
    Ok(resp)
}

fn is_token_generation_failure(err: &BrokerError) -> bool {
    let message = match err {
        BrokerError::Http { message, .. } | BrokerError::AuthenticationFailed { message, .. } => {
            message.to_ascii_lowercase()
        }
        _ => return false,
    };
    message.contains("token") && message.contains("generat")
}

/// Choose the trading account: the configured id if listed, otherwise in
/// paper the first `DU…` account, otherwise the first account.
pub fn choose_account(
    accounts: &[String],
    configured: Option<&str>,
    environment: Environment,
) -> std::result::Result<String, String> {
    if accounts.is_empty() {
        return Err("no brokerage accounts available".to_string());
    }

    if let Some(wanted) = configured {
        return accounts
            .iter()
            .find(|a| a.as_str() == wanted)
            .cloned()
            .ok_or_else(|| format!("configured account {wanted} is not available"));
    }

    let preferred = match environment {
        Environment::Paper => accounts.iter().find(|a| a.starts_with(PAPER_ACCOUNT_PREFIX)),
        Environment::Live => accounts.iter().find(|a| !a.starts_with(PAPER_ACCOUNT_PREFIX)),
    };
    Ok(preferred.unwrap_or(&accounts[0]).clone())
}
