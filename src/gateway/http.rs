//! Client portal REST transport.
//!
//! Thin wrapper over `reqwest` that knows the three gateway bases, applies the
//! per-call timeout class, attaches the auth strategy and maps HTTP statuses
//! into typed errors. It holds no session state beyond the cookie jar.

use crate::auth::AuthStrategy;
use crate::config::GatewayConfig;
use crate::error::{BrokerError, Result};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

/// Longest error body kept in error messages.
const MAX_ERROR_BODY: usize = 512;

/// Which service a path is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Base {
    /// OAuth 2.0 token service
    OAuth,
    /// SSO session service
    Gateway,
    /// Client portal API (`/v1/api`)
    Api,
}

/// Timeout class of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    Standard,
    History,
}

/// A client portal API request, independent of how it authenticates.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: TimeoutClass,
}

impl ApiRequest {
    fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            timeout: TimeoutClass::Standard,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        let mut req = Self::new(Method::POST, path);
        req.body = Some(body);
        req
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn history(mut self) -> Self {
        self.timeout = TimeoutClass::History;
        self
    }
}

/// A successful gateway response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    pub request_id: Option<String>,
}

/// HTTP transport for every gateway endpoint.
#[derive(Debug, Clone)]
pub struct GatewayHttp {
    http: Client,
    oauth_url: String,
    gateway_url: String,
    api_url: String,
    request_timeout: Duration,
    history_timeout: Duration,
}

impl GatewayHttp {
    /// Create a transport from configuration.
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.history_timeout().max(config.request_timeout()))
            .cookie_store(true)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| BrokerError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            oauth_url: config.oauth_url.trim_end_matches('/').to_string(),
            gateway_url: config.gateway_url.trim_end_matches('/').to_string(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout(),
            history_timeout: config.history_timeout(),
        })
    }

    pub fn url(&self, base: Base, path: &str) -> String {
        let root = match base {
            Base::OAuth => &self.oauth_url,
            Base::Gateway => &self.gateway_url,
            Base::Api => &self.api_url,
        };
        format!("{root}{path}")
    }

    fn timeout_for(&self, class: TimeoutClass) -> Duration {
        match class {
            TimeoutClass::Standard => self.request_timeout,
            TimeoutClass::History => self.history_timeout,
        }
    }

    /// Form-encoded POST (OAuth token exchange).
    #[instrument(skip(self, form), fields(endpoint = path))]
    pub async fn post_form(&self, base: Base, path: &str, form: &[(&str, &str)]) -> Result<ApiResponse> {
        let builder = self
            .http
            .post(self.url(base, path))
            .timeout(self.request_timeout)
            .form(form);
        self.execute(path, builder).await
    }

    /// POST a compact JWS as the raw body (SSO session creation).
    #[instrument(skip(self, jws, bearer), fields(endpoint = path))]
    pub async fn post_jwt(&self, base: Base, path: &str, jws: String, bearer: &str) -> Result<ApiResponse> {
        let builder = self
            .http
            .post(self.url(base, path))
            .timeout(self.request_timeout)
            .bearer_auth(bearer)
            .header(reqwest::header::CONTENT_TYPE, "application/jwt")
            .body(jws);
        self.execute(path, builder).await
    }

    /// Client portal API call using the given auth strategy.
    #[instrument(skip(self, req, auth), fields(method = %req.method, endpoint = %req.path, auth = auth.label()))]
    pub async fn send(&self, req: &ApiRequest, auth: &AuthStrategy) -> Result<ApiResponse> {
        let mut builder = self
            .http
            .request(req.method.clone(), self.url(Base::Api, &req.path))
            .timeout(self.timeout_for(req.timeout));

        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        if let Some(token) = auth.bearer() {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        self.execute(&req.path, builder).await
    }

    async fn execute(&self, endpoint: &str, builder: RequestBuilder) -> Result<ApiResponse> {
        let response = builder
            .send()
            .await
            .map_err(|e| BrokerError::from_transport(endpoint, e))?;

        let status = response.status();
        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response
            .text()
            .await
            .map_err(|e| BrokerError::from_transport(endpoint, e))?;

        debug!(endpoint, status = status.as_u16(), bytes = text.len(), "Gateway response");

        check_status(endpoint, status, &text)?;

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(ApiResponse {
            status: status.as_u16(),
            body,
            request_id,
        })
    }
}

/// Map a non-success status to the error taxonomy.
fn check_status(endpoint: &str, status: StatusCode, body: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }

    let code = status.as_u16();
    match code {
        410 => Err(BrokerError::SessionExpired(format!("{endpoint} returned 410 Gone"))),
        401 | 403 => Err(BrokerError::Unauthorized {
            endpoint: endpoint.to_string(),
            status: code,
        }),
        429 | 503 => Err(BrokerError::RateLimited {
            endpoint: endpoint.to_string(),
        }),
        _ => Err(BrokerError::Http {
            endpoint: endpoint.to_string(),
            status: code,
            message: truncate(body, MAX_ERROR_BODY),
        }),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}
