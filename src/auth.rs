use crate::error::ApiError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum_extra::TypedHeader;
use chrono::Utc;
use constant_time_eq::constant_time_eq;
use headers::{authorization::Bearer, Authorization};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use std::env;

const TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

/// Signs and verifies bearer tokens of the form `user_id.expiry.signature`,
/// HMAC-SHA256 over the first two parts. Verification is the precondition
/// the pipeline consumes; issuing credentials is the identity service's job.
#[derive(Clone)]
pub struct TokenSigner {
    secret: String,
}

impl TokenSigner {
    pub fn from_env() -> Result<Self> {
        let secret = env::var("AUTH_TOKEN_SECRET").context("AUTH_TOKEN_SECRET not set")?;
        Ok(Self { secret })
    }

    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    pub fn sign(&self, user_id: &str) -> String {
        self.sign_with_expiry(user_id, Utc::now().timestamp() + TOKEN_TTL_SECS)
    }

    pub fn sign_with_expiry(&self, user_id: &str, expires_at: i64) -> String {
        let payload = format!("{}.{}", user_id, expires_at);
        format!("{}.{}", payload, hex::encode(self.mac(&payload)))
    }

    /// Returns the user id when the signature checks out and the token has
    /// not expired.
    pub fn verify(&self, token: &str) -> Option<String> {
        self.verify_at(token, Utc::now().timestamp())
    }

    fn verify_at(&self, token: &str, now: i64) -> Option<String> {
        let (payload, sig_hex) = token.rsplit_once('.')?;
        let (user_id, expiry) = payload.rsplit_once('.')?;
        let expiry: i64 = expiry.parse().ok()?;
        let expected = hex::decode(sig_hex).ok()?;
        let computed = self.mac(payload);
        if expected.len() != computed.len() || !constant_time_eq(&computed, &expected) {
            return None;
        }
        if now >= expiry || user_id.is_empty() {
            return None;
        }
        Some(user_id.to_string())
    }

    fn mac(&self, payload: &str) -> Vec<u8> {
        // HMAC accepts keys of any length, so this cannot fail.
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

/// Resolve the caller from a typed bearer header.
pub fn bearer_user(
    signer: &TokenSigner,
    auth: Option<&TypedHeader<Authorization<Bearer>>>,
) -> Result<String, ApiError> {
    let auth = auth.ok_or_else(|| ApiError::Unauthorized("Missing bearer token".into()))?;
    signer
        .verify(auth.token())
        .ok_or_else(|| ApiError::Unauthorized("Invalid or expired token".into()))
}

/// External credential check: email and password in, a user id out (or None
/// for bad credentials).
#[async_trait]
pub trait IdentityApi: Send + Sync {
    async fn authenticate(&self, email: &str, password: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct HttpIdentity {
    client: Client,
    url: String,
}

impl HttpIdentity {
    pub fn from_env() -> Result<Self> {
        let url = env::var("IDENTITY_URL").context("IDENTITY_URL not set")?;
        Ok(Self { client: Client::new(), url })
    }
}

#[async_trait]
impl IdentityApi for HttpIdentity {
    async fn authenticate(&self, email: &str, password: &str) -> Result<Option<String>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct VerifyResponse {
            user_id: String,
        }

        let res = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await
            .context("Identity service request failed")?;
        if res.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        if !res.status().is_success() {
            anyhow::bail!("Identity service returned status {}", res.status());
        }
        let body: VerifyResponse = res
            .json()
            .await
            .context("Identity service returned an unreadable response")?;
        Ok(Some(body.user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        let signer = TokenSigner::new("test-secret");
        let token = signer.sign_with_expiry("user-1", 2_000_000_000);
        assert_eq!(signer.verify_at(&token, 1_000_000_000), Some("user-1".into()));
    }

    #[test]
    fn expired_token_is_rejected() {
        let signer = TokenSigner::new("test-secret");
        let token = signer.sign_with_expiry("user-1", 1_000);
        assert_eq!(signer.verify_at(&token, 1_000), None);
        assert_eq!(signer.verify_at(&token, 2_000), None);
    }

    #[test]
    fn tampered_token_is_rejected() {
        let signer = TokenSigner::new("test-secret");
        let token = signer.sign_with_expiry("user-1", 2_000_000_000);
        let forged = token.replace("user-1", "user-2");
        assert_eq!(signer.verify_at(&forged, 1_000_000_000), None);

        let other = TokenSigner::new("other-secret");
        assert_eq!(other.verify_at(&token, 1_000_000_000), None);
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        let signer = TokenSigner::new("test-secret");
        assert_eq!(signer.verify_at("", 0), None);
        assert_eq!(signer.verify_at("a.b", 0), None);
        assert_eq!(signer.verify_at("a.b.nothex", 0), None);
    }
}
