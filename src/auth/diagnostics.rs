//! Per-phase handshake diagnostics for health reporting.

use crate::error::AuthPhase;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;

/// Outcome of the most recent attempt at a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Pending,
    Ok,
    Skipped,
    Failed,
}

/// One phase's last observed result.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseRecord {
    pub status: PhaseStatus,
    pub http_status: Option<u16>,
    pub timestamp: Option<DateTime<Utc>>,
    pub request_id: Option<String>,
    pub detail: Option<String>,
}

impl Default for PhaseRecord {
    fn default() -> Self {
        Self {
            status: PhaseStatus::Pending,
            http_status: None,
            timestamp: None,
            request_id: None,
            detail: None,
        }
    }
}

/// Serializable view for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    pub phases: BTreeMap<&'static str, PhaseRecord>,
    pub session_state: crate::auth::SessionState,
    pub session_ready: bool,
    pub account_selected: bool,
    pub auth_strategy: Option<&'static str>,
    pub last_init: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub bootstrap_runs: u64,
    pub bootstrap_failures: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    phases: BTreeMap<&'static str, PhaseRecord>,
    bootstrap_runs: u64,
    bootstrap_failures: u64,
    last_error: Option<String>,
}

/// Records handshake progress. Written by the pipeline only.
#[derive(Debug, Default)]
pub struct Diagnostics {
    inner: RwLock<Inner>,
}

impl Diagnostics {
    pub fn new() -> Self {
        let diagnostics = Self::default();
        {
            let mut inner = diagnostics.inner.write();
            for phase in AuthPhase::ALL {
                inner.phases.insert(phase.as_str(), PhaseRecord::default());
            }
        }
        diagnostics
    }

    /// Start of a pipeline run: every phase goes back to pending.
    pub fn begin_run(&self) {
        let mut inner = self.inner.write();
        inner.bootstrap_runs += 1;
        for phase in AuthPhase::ALL {
            inner.phases.insert(phase.as_str(), PhaseRecord::default());
        }
    }

    pub fn record(
        &self,
        phase: AuthPhase,
        status: PhaseStatus,
        http_status: Option<u16>,
        request_id: Option<String>,
        detail: Option<String>,
        at: DateTime<Utc>,
    ) {
        self.inner.write().phases.insert(
            phase.as_str(),
            PhaseRecord {
                status,
                http_status,
                timestamp: Some(at),
                request_id,
                detail,
            },
        );
    }

    pub fn ok(&self, phase: AuthPhase, http_status: u16, request_id: Option<String>, at: DateTime<Utc>) {
        self.record(phase, PhaseStatus::Ok, Some(http_status), request_id, None, at);
    }

    pub fn skipped(&self, phase: AuthPhase, at: DateTime<Utc>) {
        self.record(phase, PhaseStatus::Skipped, None, None, Some("still fresh".into()), at);
    }

    pub fn failed(&self, phase: AuthPhase, err: &crate::error::BrokerError, at: DateTime<Utc>) {
        let http_status = match err {
            crate::error::BrokerError::AuthenticationFailed { status, .. } => *status,
            crate::error::BrokerError::Unauthorized { status, .. } => Some(*status),
            crate::error::BrokerError::Http { status, .. } => Some(*status),
            crate::error::BrokerError::SessionExpired(_) => Some(410),
            _ => None,
        };
        self.record(phase, PhaseStatus::Failed, http_status, None, Some(err.to_string()), at);
    }

    pub fn finish_run(&self, outcome: &crate::error::Result<()>) {
        let mut inner = self.inner.write();
        match outcome {
            Ok(()) => inner.last_error = None,
            Err(e) => {
                inner.bootstrap_failures += 1;
                inner.last_error = Some(e.to_string());
            }
        }
    }

    pub fn phase(&self, phase: AuthPhase) -> PhaseRecord {
        self.inner
            .read()
            .phases
            .get(phase.as_str())
            .cloned()
            .unwrap_or_default()
    }

    pub fn bootstrap_runs(&self) -> u64 {
        self.inner.read().bootstrap_runs
    }

    pub fn snapshot(&self, session: &crate::auth::Session) -> DiagnosticsSnapshot {
        let inner = self.inner.read();
        DiagnosticsSnapshot {
            phases: inner.phases.clone(),
            session_state: session.state(),
            session_ready: session.session_ready,
            account_selected: session.account_selected,
            auth_strategy: session.auth_strategy.as_ref().map(|s| s.label()),
            last_init: session.last_init,
            last_heartbeat: session.last_heartbeat,
            bootstrap_runs: inner.bootstrap_runs,
            bootstrap_failures: inner.bootstrap_failures,
            last_error: inner.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Session;
    use crate::error::BrokerError;

    #[test]
    fn test_new_has_all_phases_pending() {
        let diagnostics = Diagnostics::new();
        for phase in AuthPhase::ALL {
            assert_eq!(diagnostics.phase(phase).status, PhaseStatus::Pending);
        }
    }

    #[test]
    fn test_run_overwrites_previous_records() {
        let diagnostics = Diagnostics::new();
        let now = Utc::now();

        diagnostics.begin_run();
        diagnostics.ok(AuthPhase::OAuth, 200, Some("req-1".into()), now);
        diagnostics.failed(
            AuthPhase::Sso,
            &BrokerError::auth_failed(AuthPhase::Sso, Some(400), "bad jwt"),
            now,
        );
        diagnostics.finish_run(&Err(BrokerError::auth_failed(AuthPhase::Sso, Some(400), "bad jwt")));

        assert_eq!(diagnostics.phase(AuthPhase::OAuth).request_id.as_deref(), Some("req-1"));
        assert_eq!(diagnostics.phase(AuthPhase::Sso).http_status, Some(400));

        diagnostics.begin_run();
        assert_eq!(diagnostics.phase(AuthPhase::OAuth).status, PhaseStatus::Pending);

        let snapshot = diagnostics.snapshot(&Session::new());
        assert_eq!(snapshot.bootstrap_runs, 2);
        assert_eq!(snapshot.bootstrap_failures, 1);
        assert!(snapshot.last_error.unwrap().contains("bad jwt"));
    }
}
