use anyhow::anyhow;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chatline::protocol::UserId;
use chatline::time::now_secs;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::RelayError;

type HmacSha256 = Hmac<Sha256>;

/// Issues and verifies user tokens.
///
/// Token format: `base64url(user_id|expires_unix_secs|hex(hmac_sha256))`.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
    ttl_secs: u64,
}

impl TokenSigner {
    pub fn new(secret: impl AsRef<[u8]>, ttl_secs: u64) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            ttl_secs,
        }
    }

    fn mac(&self, payload: &str) -> Result<HmacSha256, hmac::digest::InvalidLength> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)?;
        mac.update(payload.as_bytes());
        Ok(mac)
    }

    pub fn issue(&self, user_id: UserId) -> anyhow::Result<String> {
        self.issue_at(user_id, now_secs())
    }

    pub fn issue_at(&self, user_id: UserId, now: u64) -> anyhow::Result<String> {
        let payload = format!("{}|{}", user_id, now.saturating_add(self.ttl_secs));
        let signature = self
            .mac(&payload)
            .map_err(|e| anyhow!("invalid token secret: {e}"))?
            .finalize()
            .into_bytes();
        let token = format!("{}|{}", payload, hex::encode(signature));
        Ok(URL_SAFE_NO_PAD.encode(token.as_bytes()))
    }

    pub fn verify(&self, token: &str) -> Result<UserId, RelayError> {
        self.verify_at(token, now_secs())
    }

    pub fn verify_at(&self, token: &str, now: u64) -> Result<UserId, RelayError> {
        let invalid = || RelayError::Unauthorized("invalid token".to_string());

        let decoded = URL_SAFE_NO_PAD.decode(token.as_bytes()).map_err(|_| invalid())?;
        let text = String::from_utf8(decoded).map_err(|_| invalid())?;

        let mut parts = text.splitn(3, '|');
        let (Some(user), Some(expires), Some(sig_hex)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        let signature = hex::decode(sig_hex).map_err(|_| invalid())?;
        self.mac(&format!("{user}|{expires}"))
            .map_err(|_| invalid())?
            .verify_slice(&signature)
            .map_err(|_| invalid())?;

        let expires: u64 = expires.parse().map_err(|_| invalid())?;
        if now > expires {
            return Err(RelayError::Unauthorized("token expired".to_string()));
        }
        user.parse().map_err(|_| invalid())
    }
}

/// Constant-time comparison for the internal service secret.
pub fn secret_matches(provided: &str, expected: &str) -> bool {
    !provided.is_empty() && provided.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() == 1
}
