//! Per-tenant session state.
//!
//! Created empty with the client, mutated only by the authentication pipeline
//! while it holds the bootstrap flight, and wiped wholesale when the gateway
//! reports the session gone.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// How requests authenticate against the client portal API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    /// `Authorization: Bearer <sso token>`
    SsoBearer(String),
    /// `Authorization: Bearer <oauth token>`
    OAuthBearer(String),
    /// No header; the cookie jar carries the session.
    CookieOnly,
}

impl AuthStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            AuthStrategy::SsoBearer(_) => "sso_bearer",
            AuthStrategy::OAuthBearer(_) => "oauth_bearer",
            AuthStrategy::CookieOnly => "cookie_only",
        }
    }

    pub fn bearer(&self) -> Option<&str> {
        match self {
            AuthStrategy::SsoBearer(t) | AuthStrategy::OAuthBearer(t) => Some(t),
            AuthStrategy::CookieOnly => None,
        }
    }
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Unauthenticated,
    OauthAcquired,
    SsoCreated,
    Validated,
    GatewayInit,
    Ready,
}

/// Tokens, flags and timestamps for one tenant's gateway session.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub oauth_token: Option<String>,
    pub oauth_expires_at: Option<DateTime<Utc>>,
    pub sso_token: Option<String>,
    /// Nominal expiry reported by the gateway.
    pub sso_expires_at: Option<DateTime<Utc>>,
    /// When the SSO session (bearer or cookie-backed) was created.
    pub sso_created_at: Option<DateTime<Utc>>,
    pub auth_strategy: Option<AuthStrategy>,
    pub session_ready: bool,
    pub account_selected: bool,
    pub account_id: Option<String>,
    pub last_validate: Option<DateTime<Utc>>,
    pub last_init: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every token, flag and timestamp.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Forget readiness but keep tokens, so the next bootstrap re-validates
    /// and re-inits without a fresh OAuth exchange.
    pub fn mark_not_ready(&mut self) {
        self.session_ready = false;
        self.auth_strategy = None;
    }

    pub fn oauth_valid(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        match (&self.oauth_token, self.oauth_expires_at) {
            (Some(_), Some(expires)) => now + margin < expires,
            _ => false,
        }
    }

    /// SSO is usable only inside both its nominal expiry and its practical
    /// lifetime, whichever ends first.
    pub fn sso_valid(&self, now: DateTime<Utc>, practical_lifetime: chrono::Duration) -> bool {
        let Some(created) = self.sso_created_at else {
            return false;
        };
        if now >= created + practical_lifetime {
            return false;
        }
        match self.sso_expires_at {
            Some(expires) => now < expires,
            None => true,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.session_ready && self.account_selected && self.auth_strategy.is_some()
    }

    /// Everything needed for trading calls is present and unexpired.
    pub fn is_fresh(
        &self,
        now: DateTime<Utc>,
        oauth_margin: chrono::Duration,
        practical_lifetime: chrono::Duration,
    ) -> bool {
        self.is_ready()
            && self.oauth_valid(now, oauth_margin)
            && self.sso_valid(now, practical_lifetime)
    }

    /// A heartbeat is due once `interval` has passed since the later of the
    /// last full init and the last successful heartbeat.
    pub fn heartbeat_due(&self, now: DateTime<Utc>, interval: chrono::Duration) -> bool {
        let last = match (self.last_init, self.last_heartbeat) {
            (Some(i), Some(h)) => Some(i.max(h)),
            (i, h) => i.or(h),
        };
        match last {
            Some(last) => now - last > interval,
            None => true,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.is_ready() {
            SessionState::Ready
        } else if self.session_ready {
            SessionState::GatewayInit
        } else if self.auth_strategy.is_some() {
            SessionState::Validated
        } else if self.sso_created_at.is_some() {
            SessionState::SsoCreated
        } else if self.oauth_token.is_some() {
            SessionState::OauthAcquired
        } else {
            SessionState::Unauthenticated
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 5, 14, 0, 0).unwrap()
    }

    fn ready_session() -> Session {
        Session {
            oauth_token: Some("oauth".into()),
            oauth_expires_at: Some(t0() + Duration::minutes(10)),
            sso_token: Some("sso".into()),
            sso_expires_at: Some(t0() + Duration::hours(24)),
            sso_created_at: Some(t0()),
            auth_strategy: Some(AuthStrategy::SsoBearer("sso".into())),
            session_ready: true,
            account_selected: true,
            account_id: Some("DU123".into()),
            last_validate: Some(t0()),
            last_init: Some(t0()),
            last_heartbeat: None,
        }
    }

    #[test]
    fn test_empty_session_is_unauthenticated() {
        let session = Session::new();
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert!(!session.is_fresh(t0(), Duration::seconds(60), Duration::seconds(540)));
    }

    #[test]
    fn test_practical_lifetime_shorter_than_nominal() {
        let session = ready_session();
        let lifetime = Duration::seconds(540);
        assert!(session.sso_valid(t0() + Duration::minutes(8), lifetime));
        assert!(!session.sso_valid(t0() + Duration::minutes(9), lifetime));
    }

    #[test]
    fn test_oauth_refresh_margin() {
        let session = ready_session();
        let margin = Duration::seconds(60);
        assert!(session.oauth_valid(t0() + Duration::minutes(8), margin));
        assert!(!session.oauth_valid(t0() + Duration::minutes(9) + Duration::seconds(1), margin));
    }

    #[test]
    fn test_heartbeat_due_after_interval() {
        let mut session = ready_session();
        let interval = Duration::minutes(4);
        assert!(!session.heartbeat_due(t0() + Duration::minutes(4), interval));
        assert!(session.heartbeat_due(t0() + Duration::minutes(4) + Duration::seconds(1), interval));

        session.last_heartbeat = Some(t0() + Duration::minutes(5));
        assert!(!session.heartbeat_due(t0() + Duration::minutes(6), interval));
    }

    #[test]
    fn test_reset_and_not_ready() {
        let mut session = ready_session();
        assert_eq!(session.state(), SessionState::Ready);

        session.mark_not_ready();
        assert!(!session.is_ready());
        assert!(session.oauth_token.is_some());

        session.reset();
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert!(session.account_id.is_none());
    }
}
