//! # Zero-DTE Broker
//!
//! Session management, contract resolution and order execution against the
//! Interactive Brokers client portal API, for a same-day options engine.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `auth`: OAuth / SSO handshake, session keepalive, diagnostics
//! - `gateway`: REST transport and authenticated call wrapper
//! - `account`: Balances, positions and assignment detection
//! - `market`: Strike windows, contract resolution, quotes and chains
//! - `orders`: Order placement, brackets, cancellation and reconciliation
//! - `persistence`: Order ledger and audit trail (SQLite / in-memory)
//! - `client`: Per-tenant facade tying the layers together
//! - `utils`: Decimal helpers and injectable time

pub mod account;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod market;
pub mod orders;
pub mod persistence;
pub mod utils;

pub use client::{BrokerClient, ClientParts};
pub use config::Config;
pub use error::{BrokerError, Result};
