//! RS256 client assertions for the OAuth and SSO handshake phases.
//!
//! Each phase gets its own compact JWS:
//! - OAuth token exchange: `iss = sub = client_id`, `aud = "/token"`, valid 60s
//! - SSO session creation: `credential`, `iss`, optional allow-listed `ip`, valid 24h
//!
//! The private key is never logged; `Debug` redacts it.

use crate::config::CredentialsConfig;
use crate::error::{BrokerError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use serde::Serialize;
use sha2::Sha256;

/// Audience claim of the OAuth client assertion.
pub const TOKEN_AUDIENCE: &str = "/token";

/// Lifetime of the OAuth client assertion.
pub const OAUTH_ASSERTION_TTL_SECS: i64 = 60;

/// Backdating of `iat` on the OAuth assertion to absorb clock skew.
pub const OAUTH_ASSERTION_SKEW_SECS: i64 = 10;

/// Lifetime of the SSO session assertion.
pub const SSO_ASSERTION_TTL_SECS: i64 = 86_400;

#[derive(Debug, Serialize)]
struct JwsHeader<'a> {
    alg: &'static str,
    typ: &'static str,
    kid: &'a str,
}

#[derive(Debug, Serialize)]
struct OAuthClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'static str,
    exp: i64,
    iat: i64,
}

#[derive(Debug, Serialize)]
struct SsoClaims<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<&'a str>,
    credential: &'a str,
    iss: &'a str,
    exp: i64,
    iat: i64,
}

/// Builds the signed assertions used during the handshake.
pub struct AssertionSigner {
    client_id: String,
    key_id: String,
    credential: String,
    allowed_ip: Option<String>,
    signing_key: SigningKey<Sha256>,
}

impl std::fmt::Debug for AssertionSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssertionSigner")
            .field("client_id", &self.client_id)
            .field("key_id", &self.key_id)
            .field("credential", &self.credential)
            .field("allowed_ip", &self.allowed_ip)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

impl AssertionSigner {
    /// Create a signer from a PEM key (PKCS#8 or PKCS#1).
    pub fn new(
        client_id: impl Into<String>,
        key_id: impl Into<String>,
        credential: impl Into<String>,
        allowed_ip: Option<String>,
        private_key_pem: &str,
    ) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_key_pem))
            .map_err(|e| BrokerError::Signing(format!("failed to parse private key: {e}")))?;

        Ok(Self::from_key(client_id, key_id, credential, allowed_ip, private_key))
    }

    /// Create a signer from an already-decoded key.
    pub fn from_key(
        client_id: impl Into<String>,
        key_id: impl Into<String>,
        credential: impl Into<String>,
        allowed_ip: Option<String>,
        private_key: RsaPrivateKey,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            key_id: key_id.into(),
            credential: credential.into(),
            allowed_ip: allowed_ip.filter(|ip| !ip.is_empty()),
            signing_key: SigningKey::<Sha256>::new(private_key),
        }
    }

    /// Create a signer from the credentials section of the config.
    pub fn from_config(creds: &CredentialsConfig) -> Result<Self> {
        let pem = creds
            .load_private_key_pem()
            .map_err(|e| BrokerError::Configuration(format!("{e:#}")))?;
        Self::new(
            creds.client_id.clone(),
            creds.client_key_id.clone(),
            creds.credential.clone(),
            creds.allowed_ip.clone(),
            &pem,
        )
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Assertion for the client-credentials token exchange.
    pub fn oauth_assertion(&self, now: DateTime<Utc>) -> Result<String> {
        let now = now.timestamp();
        let claims = OAuthClaims {
            iss: &self.client_id,
            sub: &self.client_id,
            aud: TOKEN_AUDIENCE,
            exp: now + OAUTH_ASSERTION_TTL_SECS,
            iat: now - OAUTH_ASSERTION_SKEW_SECS,
        };
        self.sign(&claims)
    }

    /// Assertion posted as the body of the SSO session request.
    pub fn sso_assertion(&self, now: DateTime<Utc>) -> Result<String> {
        let now = now.timestamp();
        let claims = SsoClaims {
            ip: self.allowed_ip.as_deref(),
            credential: &self.credential,
            iss: &self.client_id,
            exp: now + SSO_ASSERTION_TTL_SECS,
            iat: now,
        };
        self.sign(&claims)
    }

    fn sign<C: Serialize>(&self, claims: &C) -> Result<String> {
        let header = JwsHeader {
            alg: "RS256",
            typ: "JWT",
            kid: &self.key_id,
        };
        let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let claims = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let payload = format!("{header}.{claims}");

        let signature = self
            .signing_key
            .try_sign(payload.as_bytes())
            .map_err(|e| BrokerError::Signing(e.to_string()))?;

        Ok(format!(
            "{payload}.{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}
