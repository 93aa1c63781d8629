//! Gateway authentication.
//!
//! - `signer`: RS256 client assertions
//! - `session`: per-tenant tokens and flags
//! - `pipeline`: OAuth → SSO → validate → init handshake
//! - `keepalive`: single-flight readiness checks and heartbeats
//! - `diagnostics`: per-phase status for health reporting

mod diagnostics;
mod keepalive;
mod pipeline;
mod session;
mod signer;
mod single_flight;

pub use diagnostics::{Diagnostics, DiagnosticsSnapshot, PhaseRecord, PhaseStatus};
pub use keepalive::SessionController;
pub use pipeline::{choose_account, AuthPipeline, Freshness, PipelineSettings};
pub use session::{AuthStrategy, Session, SessionState};
pub use signer::AssertionSigner;
pub use single_flight::SingleFlight;

/// Endpoint paths used by the handshake.
pub mod paths {
    pub use super::pipeline::{
        ACCOUNTS_PATH, INIT_PATH, LOGOUT_PATH, SELECT_ACCOUNT_PATH, SSO_SESSIONS_PATH, TICKLE_PATH,
        TOKEN_PATH, VALIDATE_PATH,
    };
}
