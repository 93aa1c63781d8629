//! Configuration management for the broker core.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Gateway endpoints and timeouts
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// OAuth / SSO credentials
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// Session lifetime and retry tuning
    #[serde(default)]
    pub session: SessionConfig,
    /// Contract resolution and snapshot pacing
    #[serde(default)]
    pub market_data: MarketDataConfig,
    /// Order ledger / audit storage
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Target trading environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Paper,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Paper or live account
    #[serde(default)]
    pub environment: Environment,
    /// OAuth 2.0 token service base URL
    #[serde(default = "default_oauth_url")]
    pub oauth_url: String,
    /// SSO session service base URL
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    /// Client portal API base URL (everything under `/v1/api`)
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Explicit account id; otherwise the first eligible account is selected
    #[serde(default)]
    pub account_id: Option<String>,
    /// Timeout for generic calls in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Timeout for historical data calls in seconds
    #[serde(default = "default_history_timeout")]
    pub history_timeout_secs: u64,
    /// User-Agent sent on gateway calls
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// OAuth client id
    #[serde(default)]
    pub client_id: String,
    /// Key id placed in the JWS header
    #[serde(default = "default_client_key_id")]
    pub client_key_id: String,
    /// Username the SSO session is created for
    #[serde(default)]
    pub credential: String,
    /// Path to the PEM private key
    #[serde(default)]
    pub private_key_path: Option<String>,
    /// Inline PEM private key (takes precedence over the path)
    #[serde(default)]
    pub private_key_pem: Option<String>,
    /// Allow-listed source IP for the SSO assertion
    #[serde(default)]
    pub allowed_ip: Option<String>,
    /// OAuth scope
    #[serde(default = "default_scope")]
    pub scope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Practical lifetime of an SSO session, independent of its nominal expiry
    #[serde(default = "default_sso_practical_lifetime")]
    pub sso_practical_lifetime_secs: u64,
    /// Heartbeat when this long has passed since the last init or heartbeat
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Refresh the OAuth token this long before it expires
    #[serde(default = "default_oauth_refresh_margin")]
    pub oauth_refresh_margin_secs: u64,
    /// Delay before the single init retry after a token-generation failure
    #[serde(default = "default_init_retry_delay")]
    pub init_retry_delay_ms: u64,
    /// Retries on upstream throttling (503/429)
    #[serde(default = "default_rate_limit_retries")]
    pub rate_limit_retries: u32,
    /// Fixed backoff between throttling retries
    #[serde(default = "default_rate_limit_backoff")]
    pub rate_limit_backoff_ms: u64,
    /// Maximum confirmation reply rounds per order submission
    #[serde(default = "default_max_confirmation_rounds")]
    pub max_confirmation_rounds: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataConfig {
    /// Pause between sequential contract lookups
    #[serde(default = "default_contract_pacing")]
    pub contract_pacing_ms: u64,
    /// Contracts per snapshot request
    #[serde(default = "default_snapshot_page_size")]
    pub snapshot_page_size: usize,
    /// Pause between the priming and the fetching snapshot request
    #[serde(default = "default_prime_delay")]
    pub prime_delay_ms: u64,
    /// Volatility proxy (annualized %) used when VIX cannot be read
    #[serde(default = "default_volatility_pct")]
    pub default_volatility_pct: f64,
    /// Lookback for historical closes
    #[serde(default = "default_history_period")]
    pub history_period: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path for the order ledger and audit log
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

// Default value functions
fn default_oauth_url() -> String {
    "https://api.ibkr.com/oauth2".to_string()
}

fn default_gateway_url() -> String {
    "https://api.ibkr.com/gw".to_string()
}

fn default_api_url() -> String {
    "https://api.ibkr.com/v1/api".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_history_timeout() -> u64 {
    60
}

fn default_user_agent() -> String {
    format!("zero-dte-broker/{}", env!("CARGO_PKG_VERSION"))
}

fn default_client_key_id() -> String {
    "main".to_string()
}

fn default_scope() -> String {
    "sso-sessions.write".to_string()
}

fn default_sso_practical_lifetime() -> u64 {
    540 // ~9 minutes, far shorter than the nominal expiry
}

fn default_heartbeat_interval() -> u64 {
    240
}

fn default_oauth_refresh_margin() -> u64 {
    60
}

fn default_init_retry_delay() -> u64 {
    1000
}

fn default_rate_limit_retries() -> u32 {
    3
}

fn default_rate_limit_backoff() -> u64 {
    1000
}

fn default_max_confirmation_rounds() -> u32 {
    5
}

fn default_contract_pacing() -> u64 {
    100
}

fn default_snapshot_page_size() -> usize {
    50
}

fn default_prime_delay() -> u64 {
    500
}

fn default_volatility_pct() -> f64 {
    20.0
}

fn default_history_period() -> String {
    "5d".to_string()
}

fn default_db_path() -> String {
    "data/orders.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("ODTE"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.gateway.request_timeout_secs > 0 && self.gateway.history_timeout_secs > 0,
            "request timeouts must be positive"
        );

        anyhow::ensure!(
            self.market_data.snapshot_page_size > 0,
            "snapshot_page_size must be at least 1"
        );

        anyhow::ensure!(
            self.market_data.default_volatility_pct > 0.0,
            "default_volatility_pct must be positive"
        );

        anyhow::ensure!(
            self.session.sso_practical_lifetime_secs > self.session.heartbeat_interval_secs,
            "heartbeat interval must be shorter than the SSO practical lifetime"
        );

        Ok(())
    }

    /// Validate that the credentials needed for a live handshake are present.
    pub fn validate_credentials(&self) -> Result<()> {
        let creds = &self.credentials;
        anyhow::ensure!(!creds.client_id.is_empty(), "credentials.client_id is required");
        anyhow::ensure!(
            !creds.client_key_id.is_empty(),
            "credentials.client_key_id is required"
        );
        anyhow::ensure!(!creds.credential.is_empty(), "credentials.credential is required");
        anyhow::ensure!(
            creds.private_key_pem.is_some() || creds.private_key_path.is_some(),
            "one of credentials.private_key_pem or credentials.private_key_path is required"
        );
        Ok(())
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn history_timeout(&self) -> Duration {
        Duration::from_secs(self.history_timeout_secs)
    }

    /// Point every base URL at one host (mock servers, local gateways).
    pub fn with_base(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        self.oauth_url = format!("{base}/oauth2");
        self.gateway_url = format!("{base}/gw");
        self.api_url = format!("{base}/v1/api");
        self
    }
}

impl CredentialsConfig {
    /// Resolve the PEM text from the inline value or the key file.
    pub fn load_private_key_pem(&self) -> Result<String> {
        if let Some(pem) = &self.private_key_pem {
            // Env vars commonly carry escaped newlines
            return Ok(pem.replace("\\n", "\n"));
        }
        let path = self
            .private_key_path
            .as_deref()
            .context("no private key configured")?;
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read private key at {path}"))
    }
}

impl SessionConfig {
    pub fn sso_practical_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.sso_practical_lifetime_secs as i64)
    }

    pub fn heartbeat_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_interval_secs as i64)
    }

    pub fn oauth_refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.oauth_refresh_margin_secs as i64)
    }

    pub fn init_retry_delay(&self) -> Duration {
        Duration::from_millis(self.init_retry_delay_ms)
    }
}

impl MarketDataConfig {
    pub fn contract_pacing(&self) -> Duration {
        Duration::from_millis(self.contract_pacing_ms)
    }

    pub fn prime_delay(&self) -> Duration {
        Duration::from_millis(self.prime_delay_ms)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Paper,
            oauth_url: default_oauth_url(),
            gateway_url: default_gateway_url(),
            api_url: default_api_url(),
            account_id: None,
            request_timeout_secs: default_request_timeout(),
            history_timeout_secs: default_history_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_key_id: default_client_key_id(),
            credential: String::new(),
            private_key_path: None,
            private_key_pem: None,
            allowed_ip: None,
            scope: default_scope(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sso_practical_lifetime_secs: default_sso_practical_lifetime(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            oauth_refresh_margin_secs: default_oauth_refresh_margin(),
            init_retry_delay_ms: default_init_retry_delay(),
            rate_limit_retries: default_rate_limit_retries(),
            rate_limit_backoff_ms: default_rate_limit_backoff(),
            max_confirmation_rounds: default_max_confirmation_rounds(),
        }
    }
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            contract_pacing_ms: default_contract_pacing(),
            snapshot_page_size: default_snapshot_page_size(),
            prime_delay_ms: default_prime_delay(),
            default_volatility_pct: default_volatility_pct(),
            history_period: default_history_period(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}
