//! Signed action tokens carried by post-creation links.
//!
//! A token is `base64url(json claims) "." base64url(HMAC-SHA256(claims part))`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::errors::NotificationError;

type HmacSha256 = Hmac<Sha256>;

/// Client the action links are issued for.
pub const ACCOUNT_CLIENT_ID: &str = "account";

/// Claims of an "execute actions" token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionToken {
    #[serde(rename = "jti")]
    pub token_id: String,
    #[serde(rename = "sub")]
    pub identity_id: String,
    #[serde(rename = "rqac")]
    pub required_actions: Vec<String>,
    #[serde(rename = "azp")]
    pub client_id: String,
    /// Seconds since the Unix epoch.
    #[serde(rename = "exp")]
    pub expiration: i64,
}

impl ActionToken {
    pub fn new(
        identity_id: impl Into<String>,
        required_actions: Vec<String>,
        issued_at: DateTime<Utc>,
        lifespan_secs: u64,
    ) -> Self {
        let lifespan = i64::try_from(lifespan_secs).unwrap_or(i64::MAX);
        Self {
            token_id: uuid::Uuid::new_v4().to_string(),
            identity_id: identity_id.into(),
            required_actions,
            client_id: ACCOUNT_CLIENT_ID.to_string(),
            expiration: issued_at.timestamp().saturating_add(lifespan),
        }
    }

    /// Encode and sign the token.
    pub fn serialize(&self, secret: &[u8]) -> Result<String, NotificationError> {
        let claims =
            serde_json::to_vec(self).map_err(|e| NotificationError::TokenError(e.to_string()))?;
        let payload = URL_SAFE_NO_PAD.encode(claims);
        let signature = URL_SAFE_NO_PAD.encode(sign(secret, payload.as_bytes())?);
        Ok(format!("{}.{}", payload, signature))
    }

    /// Check the signature and expiration of an encoded token.
    pub fn verify(
        encoded: &str,
        secret: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Self, NotificationError> {
        let (payload, signature) = encoded
            .split_once('.')
            .ok_or_else(|| NotificationError::TokenError("malformed token".into()))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|e| NotificationError::TokenError(format!("bad signature encoding: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| NotificationError::TokenError(e.to_string()))?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| NotificationError::TokenError("signature mismatch".into()))?;

        let claims = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| NotificationError::TokenError(format!("bad claims encoding: {}", e)))?;
        let token: ActionToken = serde_json::from_slice(&claims)
            .map_err(|e| NotificationError::TokenError(e.to_string()))?;

        if token.expiration < now.timestamp() {
            return Err(NotificationError::TokenError("token expired".into()));
        }
        Ok(token)
    }
}

fn sign(secret: &[u8], message: &[u8]) -> Result<Vec<u8>, NotificationError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| NotificationError::TokenError(e.to_string()))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Link that consumes an action token.
pub fn action_link(public_url: &str, key: &str) -> String {
    format!(
        "{}/login-actions/action-token?key={}",
        public_url.trim_end_matches('/'),
        key
    )
}
