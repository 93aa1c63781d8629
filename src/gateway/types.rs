//! Type definitions for client portal API responses.
//!
//! Only the handshake and contract-definition payloads are modelled as
//! structs; snapshot rows and order replies vary too much and are read from
//! `serde_json::Value` by their adapters.

use serde::Deserialize;
use serde_json::Value;

/// OAuth token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Seconds until expiry
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// SSO session creation response. A 2xx without `access_token` means the
/// session lives in the cookie jar.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SsoSessionResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub active: Option<bool>,
}

/// Brokerage session status as reported by init and tickle.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthStatus {
    #[serde(default)]
    pub authenticated: Option<bool>,
    #[serde(default)]
    pub competing: Option<bool>,
    #[serde(default)]
    pub connected: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub fail: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IserverStatus {
    #[serde(default, rename = "authStatus")]
    pub auth_status: Option<AuthStatus>,
}

/// `/tickle` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TickleResponse {
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub iserver: Option<IserverStatus>,
}

impl TickleResponse {
    /// Missing status counts as alive: the 2xx already proved the session.
    pub fn authenticated(&self) -> bool {
        self.iserver
            .as_ref()
            .and_then(|i| i.auth_status.as_ref())
            .and_then(|s| s.authenticated)
            .unwrap_or(true)
    }
}

/// `/iserver/accounts` response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountsResponse {
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub selected_account: Option<String>,
}

/// One `/iserver/secdef/search` hit.
#[derive(Debug, Clone, Deserialize)]
pub struct SecdefSearchResult {
    #[serde(deserialize_with = "conid_from_any")]
    pub conid: i64,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default, rename = "companyName")]
    pub company_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "secType")]
    pub sec_type: Option<String>,
    #[serde(default)]
    pub sections: Vec<SecdefSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecdefSection {
    #[serde(default, rename = "secType")]
    pub sec_type: Option<String>,
    /// Semicolon-separated contract months, e.g. `DEC25;JAN26`
    #[serde(default)]
    pub months: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
}

/// `/iserver/secdef/strikes` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StrikesResponse {
    #[serde(default)]
    pub call: Vec<f64>,
    #[serde(default)]
    pub put: Vec<f64>,
}

/// One `/iserver/secdef/info` contract.
#[derive(Debug, Clone, Deserialize)]
pub struct SecdefInfo {
    #[serde(deserialize_with = "conid_from_any")]
    pub conid: i64,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub right: Option<String>,
    #[serde(default)]
    pub strike: Option<f64>,
    /// `YYYYMMDD`
    #[serde(default, rename = "maturityDate")]
    pub maturity_date: Option<String>,
    #[serde(default, rename = "tradingClass")]
    pub trading_class: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub multiplier: Option<String>,
}

/// `/iserver/marketdata/history` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryResponse {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub data: Vec<HistoryBar>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryBar {
    /// Epoch millis
    #[serde(default)]
    pub t: Option<i64>,
    #[serde(default)]
    pub o: Option<f64>,
    #[serde(default)]
    pub h: Option<f64>,
    #[serde(default)]
    pub l: Option<f64>,
    pub c: f64,
    #[serde(default)]
    pub v: Option<f64>,
}

impl HistoryResponse {
    /// Close of the most recent bar.
    pub fn last_close(&self) -> Option<f64> {
        self.data
            .iter()
            .filter(|b| b.c.is_finite() && b.c > 0.0)
            .max_by_key(|b| b.t.unwrap_or_default())
            .map(|b| b.c)
    }
}

/// Contract ids arrive as numbers or numeric strings depending on endpoint.
fn conid_from_any<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match &value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom(format!("invalid conid {n}"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid conid {s:?}"))),
        other => Err(serde::de::Error::custom(format!("invalid conid {other}"))),
    }
}
