//! HMAC-SHA256 request signing.
//!
//! Two schemes share one primitive:
//! - Stream handshake: `HMAC(secret, "GET/realtime" + expires_ms)`
//! - REST (v5 header scheme): `HMAC(secret, timestamp + api_key + recv_window + payload)`
//!   where `payload` is the canonical query string (GET) or the canonical
//!   JSON body (POST).
//!
//! Parameters are canonicalised by sorting keys, so a signature depends
//! only on the parameter set and never on insertion order. The exact bytes
//! that were signed are kept on [`SignedRequest`] and are what the REST
//! client sends.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::credential::Credential;

type HmacSha256 = Hmac<Sha256>;

/// Verb and path fixed by the stream protocol for the auth handshake.
pub const AUTH_VERB_PATH: &str = "GET/realtime";

/// Error types for signing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Payload serialization failed: {0}")]
    Serialize(String),
}

pub type SignerResult<T> = Result<T, SignerError>;

/// HTTP method of a signed REST call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// Signed stream handshake: `{op: "auth", args: [api_key, expires, signature]}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHandshake {
    pub api_key: String,
    pub expires_at_ms: u64,
    pub signature: String,
}

/// A REST request together with the signature over its exact serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub method: HttpMethod,
    pub path: String,
    /// Ordered by key, so serialization is deterministic.
    pub query_params: BTreeMap<String, String>,
    /// Canonical JSON body for POST requests.
    pub body: Option<String>,
    pub timestamp_ms: u64,
    pub recv_window_ms: u64,
    pub signature: String,
}

impl SignedRequest {
    /// `key=value` pairs joined by `&`, keys ascending.
    pub fn query_string(&self) -> String {
        canonicalize(&self.query_params)
    }

    /// The request-specific part of the signed string.
    pub fn payload(&self) -> String {
        match self.method {
            HttpMethod::Get => self.query_string(),
            HttpMethod::Post => self.body.clone().unwrap_or_default(),
        }
    }
}

/// Deterministic hex-encoded HMAC-SHA256 of `payload`.
pub fn sign(secret: &[u8], payload: &str) -> SignerResult<String> {
    if secret.is_empty() {
        return Err(SignerError::InvalidCredential("secret is empty".to_string()));
    }
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| SignerError::InvalidCredential(e.to_string()))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Sort keys ascending and join as `key=value` pairs separated by `&`.
pub fn canonicalize(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Signature for the stream handshake.
///
/// The API key is not part of the signed string; it is validated here
/// because a handshake without one can never succeed.
pub fn build_auth_signature(secret: &[u8], api_key: &str, expires_at_ms: u64) -> SignerResult<String> {
    validate_api_key(api_key)?;
    sign(secret, &format!("{AUTH_VERB_PATH}{expires_at_ms}"))
}

/// Signature over canonicalised parameters.
pub fn build_rest_signature(secret: &[u8], params: &BTreeMap<String, String>) -> SignerResult<String> {
    sign(secret, &canonicalize(params))
}

fn validate_api_key(api_key: &str) -> SignerResult<()> {
    if api_key.is_empty() {
        return Err(SignerError::InvalidCredential("api key is empty".to_string()));
    }
    if api_key.chars().any(char::is_whitespace) {
        return Err(SignerError::InvalidCredential(
            "api key contains whitespace".to_string(),
        ));
    }
    Ok(())
}

/// Signs handshakes and REST requests for one credential.
///
/// Holds no mutable state; clone freely across tasks.
#[derive(Debug, Clone)]
pub struct Signer {
    credential: Credential,
}

impl Signer {
    /// Create a signer, rejecting empty or malformed credentials up front.
    pub fn new(credential: Credential) -> SignerResult<Self> {
        validate_api_key(credential.key_id())?;
        if credential.secret().is_empty() {
            return Err(SignerError::InvalidCredential("secret is empty".to_string()));
        }
        Ok(Self { credential })
    }

    pub fn api_key(&self) -> &str {
        self.credential.key_id()
    }

    /// Build a handshake that expires at `expires_at_ms`.
    pub fn auth_handshake(&self, expires_at_ms: u64) -> SignerResult<AuthHandshake> {
        let signature = build_auth_signature(self.credential.secret(), self.api_key(), expires_at_ms)?;
        Ok(AuthHandshake {
            api_key: self.api_key().to_string(),
            expires_at_ms,
            signature,
        })
    }

    /// Sign a REST request using the v5 header scheme.
    pub fn sign_request(
        &self,
        method: HttpMethod,
        path: &str,
        params: BTreeMap<String, String>,
        timestamp_ms: u64,
        recv_window_ms: u64,
    ) -> SignerResult<SignedRequest> {
        let (query_params, body) = match method {
            HttpMethod::Get => (params, None),
            HttpMethod::Post => {
                let body = serde_json::to_string(&params)
                    .map_err(|e| SignerError::Serialize(e.to_string()))?;
                (BTreeMap::new(), Some(body))
            }
        };

        let mut request = SignedRequest {
            method,
            path: path.to_string(),
            query_params,
            body,
            timestamp_ms,
            recv_window_ms,
            signature: String::new(),
        };

        let prehash = format!(
            "{timestamp_ms}{}{recv_window_ms}{}",
            self.api_key(),
            request.payload()
        );
        request.signature = sign(self.credential.secret(), &prehash)?;
        Ok(request)
    }
}
