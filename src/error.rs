//! Typed errors for the broker core.
//!
//! Every failure a caller can observe is one of these variants so the trading
//! engine can tell "retry me" from "give up" without string matching. The enum
//! is `Clone` because one bootstrap outcome is shared by every caller that
//! attached to the same in-flight handshake.

use std::fmt;
use thiserror::Error;

/// Handshake phase a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthPhase {
    OAuth,
    Sso,
    Validate,
    Init,
}

impl AuthPhase {
    pub const ALL: [AuthPhase; 4] = [
        AuthPhase::OAuth,
        AuthPhase::Sso,
        AuthPhase::Validate,
        AuthPhase::Init,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthPhase::OAuth => "oauth",
            AuthPhase::Sso => "sso",
            AuthPhase::Validate => "validate",
            AuthPhase::Init => "init",
        }
    }
}

impl fmt::Display for AuthPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the broker session, resolution and order layers.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// A handshake phase was rejected by the gateway.
    #[error("authentication failed during {phase}: {message}")]
    AuthenticationFailed {
        phase: AuthPhase,
        status: Option<u16>,
        message: String,
    },

    /// The upstream session is gone (410, or 401/403 after a reset).
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// A single 401/403 from the gateway. Callers normally never see this:
    /// it triggers one reset-and-retry and becomes `SessionExpired` on repeat.
    #[error("unauthorized ({status}) calling {endpoint}")]
    Unauthorized { endpoint: String, status: u16 },

    /// Upstream throttling (503 burst or 429).
    #[error("rate limited calling {endpoint}")]
    RateLimited { endpoint: String },

    /// No matching underlying, strike or contract.
    #[error("resolution failed: {0}")]
    ResolutionFailed(String),

    /// Snapshot came back empty and no historical close was available.
    #[error("market data unavailable for {0}")]
    MarketDataUnavailable(String),

    /// The gateway rejected an order.
    #[error("order rejected{}: {message}", code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
    OrderRejected {
        code: Option<String>,
        message: String,
    },

    /// Bounded network timeout exceeded.
    #[error("timeout calling {0}")]
    Timeout(String),

    /// Any other non-success HTTP status.
    #[error("gateway error {status} calling {endpoint}: {message}")]
    Http {
        endpoint: String,
        status: u16,
        message: String,
    },

    /// Connection-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// Response body did not have the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),

    /// Assertion signing failed (bad key, clock error).
    #[error("signing error: {0}")]
    Signing(String),

    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Persistence collaborator failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl BrokerError {
    pub fn auth_failed(phase: AuthPhase, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            phase,
            status,
            message: message.into(),
        }
    }

    pub fn rejected(code: Option<String>, message: impl Into<String>) -> Self {
        Self::OrderRejected {
            code,
            message: message.into(),
        }
    }

    /// Map a `reqwest` failure for `endpoint` into a typed error.
    pub fn from_transport(endpoint: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(endpoint.to_string())
        } else if err.is_connect() {
            Self::Network(format!("connection failed calling {endpoint}: {err}"))
        } else {
            Self::Network(format!("{endpoint}: {err}"))
        }
    }

    /// True for failures that may succeed if the same call is repeated.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) | Self::RateLimited { .. } => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// True when the whole session must be wiped and rebuilt.
    #[must_use]
    pub fn invalidates_session(&self) -> bool {
        matches!(self, Self::SessionExpired(_) | Self::Unauthorized { .. })
    }

    /// True for the 410 "session gone" signal specifically.
    #[must_use]
    pub fn is_session_gone(&self) -> bool {
        matches!(self, Self::SessionExpired(_))
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<rusqlite::Error> for BrokerError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Result alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BrokerError::Timeout("/iserver/marketdata/history".into()).is_retryable());
        assert!(BrokerError::RateLimited {
            endpoint: "/iserver/marketdata/snapshot".into()
        }
        .is_retryable());
        assert!(BrokerError::Http {
            endpoint: "/x".into(),
            status: 502,
            message: String::new()
        }
        .is_retryable());

        assert!(!BrokerError::SessionExpired("410".into()).is_retryable());
        assert!(!BrokerError::ResolutionFailed("no strike".into()).is_retryable());
        assert!(!BrokerError::rejected(Some("201".into()), "margin").is_retryable());
    }

    #[test]
    fn test_session_invalidation() {
        assert!(BrokerError::SessionExpired("gone".into()).invalidates_session());
        assert!(BrokerError::Unauthorized {
            endpoint: "/sso/validate".into(),
            status: 401
        }
        .invalidates_session());
        assert!(!BrokerError::Timeout("/tickle".into()).invalidates_session());
    }

    #[test]
    fn test_order_rejected_display() {
        let err = BrokerError::rejected(Some("201".into()), "insufficient margin");
        assert_eq!(err.to_string(), "order rejected (201): insufficient margin");

        let err = BrokerError::rejected(None, "bad price");
        assert_eq!(err.to_string(), "order rejected: bad price");
    }

    #[test]
    fn test_auth_failed_display() {
        let err = BrokerError::auth_failed(AuthPhase::Sso, Some(400), "bad assertion");
        assert!(err.to_string().contains("sso"));
        assert!(err.to_string().contains("bad assertion"));
    }
}
