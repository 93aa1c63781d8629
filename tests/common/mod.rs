//! Shared fixtures: a mock gateway that completes the handshake, a client
//! wired to it with manual time, and request counters.
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use rsa::RsaPrivateKey;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zero_dte_broker::auth::AssertionSigner;
use zero_dte_broker::config::Config;
use zero_dte_broker::persistence::MemoryStore;
use zero_dte_broker::utils::{ManualClock, RecordingSleeper};
use zero_dte_broker::{BrokerClient, ClientParts};

pub const ACCOUNT: &str = "DU1234567";

pub const TOKEN: &str = "/oauth2/api/v1/token";
pub const SSO: &str = "/gw/api/v1/sso-sessions";
pub const VALIDATE: &str = "/v1/api/sso/validate";
pub const INIT: &str = "/v1/api/iserver/auth/ssodh/init";
pub const ACCOUNTS: &str = "/v1/api/iserver/accounts";
pub const TICKLE: &str = "/v1/api/tickle";
pub const LOGOUT: &str = "/v1/api/logout";

pub fn api(p: &str) -> String {
    format!("/v1/api{p}")
}

fn test_key() -> RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("generate test key"))
        .clone()
}

pub fn signer() -> Arc<AssertionSigner> {
    Arc::new(AssertionSigner::from_key(
        "TESTCONS",
        "main",
        "trader1",
        None,
        test_key(),
    ))
}

/// Friday 2025-12-05 10:00 New York.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 12, 5, 15, 0, 0).unwrap()
}

pub fn test_config(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.gateway = config.gateway.clone().with_base(&server.uri());
    config.credentials.client_id = "TESTCONS".into();
    config.credentials.credential = "trader1".into();
    config
}

pub fn ok_json(body: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(body)
}

/// Mount a happy-path handshake. Tests override individual steps by
/// mounting a higher-priority mock for the same path.
pub async fn mount_handshake(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(TOKEN))
        .respond_with(ok_json(json!({
            "access_token": "oauth-token",
            "token_type": "Bearer",
            "expires_in": 600
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path(SSO))
        .respond_with(ok_json(json!({"access_token": "sso-token", "expires_in": 540, "active": true})))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(VALIDATE))
        .respond_with(ok_json(json!({"RESULT": true, "USER_NAME": "trader1"})))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path(INIT))
        .respond_with(ok_json(json!({"authenticated": true, "connected": true, "competing": false})))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(ACCOUNTS))
        .respond_with(ok_json(json!({"accounts": [ACCOUNT], "selectedAccount": ACCOUNT})))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(TICKLE))
        .respond_with(ok_json(json!({
            "session": "abc",
            "iserver": {"authStatus": {"authenticated": true, "connected": true}}
        })))
        .mount(server)
        .await;
}

pub struct Harness {
    pub server: MockServer,
    pub client: BrokerClient,
    pub clock: ManualClock,
    pub sleeper: RecordingSleeper,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    /// Mock gateway with the handshake mounted.
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        Self::with_server(server)
    }

    /// Client against an already configured server.
    pub fn with_server(server: MockServer) -> Self {
        let config = test_config(&server);
        Self::with_config(server, config)
    }

    pub fn with_config(server: MockServer, config: Config) -> Self {
        let clock = ManualClock::new(start_time());
        let sleeper = RecordingSleeper::new();
        let store = Arc::new(MemoryStore::new());
        let client = BrokerClient::with_parts(ClientParts {
            config,
            signer: signer(),
            clock: Arc::new(clock.clone()),
            sleeper: Arc::new(sleeper.clone()),
            ledger: store.clone(),
            audit: store.clone(),
        })
        .expect("client");

        Self {
            server,
            client,
            clock,
            sleeper,
            store,
        }
    }

    /// Requests received for `p` (exact path).
    pub async fn hits(&self, p: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == p)
            .count()
    }
}
