//! Client portal gateway access.
//!
//! - `http`: raw transport and status mapping
//! - `authed`: session-aware calls used by every adapter
//! - `types`: response payloads

pub mod authed;
pub mod http;
pub mod types;

pub use authed::AuthedGateway;
pub use http::{ApiRequest, ApiResponse, Base, GatewayHttp, TimeoutClass};
