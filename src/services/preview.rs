//! Short-lived capability tokens for the preview proxy URL.
//!
//! A token is `{expires}.{base64url(hmac(file_id.expires))}`. It lets a
//! browser element (an `<img>` or `<video>`) fetch one file without
//! carrying the caller's credentials.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac, digest::generic_array::GenericArray};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 block size, the HMAC key length.
const BLOCK_LEN: usize = 64;

/// HMAC's key schedule done up front: long keys are hashed, short keys are
/// zero-padded. MACs are identical to keying with the raw secret.
fn block_key(secret: &[u8]) -> [u8; BLOCK_LEN] {
    let mut block = [0u8; BLOCK_LEN];
    if secret.len() > BLOCK_LEN {
        let digest = Sha256::digest(secret);
        block[..digest.len()].copy_from_slice(&digest);
    } else {
        block[..secret.len()].copy_from_slice(secret);
    }
    block
}

#[derive(Clone)]
pub struct PreviewSigner {
    key: [u8; BLOCK_LEN],
    ttl_secs: u64,
}

impl PreviewSigner {
    /// Without a configured secret a random per-process key is used, so
    /// tokens do not survive a restart.
    pub fn new(secret: Option<&str>, ttl_secs: u64) -> Self {
        let key = match secret.map(str::trim).filter(|s| !s.is_empty()) {
            Some(secret) => block_key(secret.as_bytes()),
            None => {
                warn!("no preview secret configured; using a random per-process key");
                let mut key = [0u8; BLOCK_LEN];
                for chunk in key.chunks_mut(16) {
                    chunk.copy_from_slice(Uuid::new_v4().as_bytes());
                }
                key
            }
        };
        Self {
            key,
            ttl_secs: ttl_secs.max(1),
        }
    }

    fn mac(&self, file_id: i64, expires: i64) -> HmacSha256 {
        let mut mac = <HmacSha256 as Mac>::new(GenericArray::from_slice(&self.key));
        mac.update(format!("{}.{}", file_id, expires).as_bytes());
        mac
    }

    pub fn token(&self, file_id: i64, now: DateTime<Utc>) -> String {
        let expires = now.timestamp() + self.ttl_secs as i64;
        let signature = self.mac(file_id, expires).finalize().into_bytes();
        format!("{}.{}", expires, URL_SAFE_NO_PAD.encode(signature))
    }

    /// True when `token` was issued for `file_id` and has not expired.
    pub fn verify(&self, file_id: i64, token: &str, now: DateTime<Utc>) -> bool {
        let Some((expires, signature)) = token.split_once('.') else {
            return false;
        };
        let Ok(expires) = expires.parse::<i64>() else {
            return false;
        };
        if now.timestamp() > expires {
            return false;
        }
        let Ok(signature) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        self.mac(file_id, expires).verify_slice(&signature).is_ok()
    }

    /// `{scheme}://{host}/files/{id}/stream?mode=preview&token=…`
    pub fn url(&self, scheme: &str, host: &str, file_id: i64, now: DateTime<Utc>) -> String {
        format!(
            "{}://{}/files/{}/stream?mode=preview&token={}",
            scheme,
            host,
            file_id,
            self.token(file_id, now)
        )
    }
}

/// Where the caller reached us, used to build links on the same origin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestOrigin {
    pub scheme: String,
    pub host: String,
}

impl Default for RequestOrigin {
    fn default() -> Self {
        Self {
            scheme: "http".into(),
            host: "localhost".into(),
        }
    }
}
