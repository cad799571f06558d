//! Request signing: nonces from `GET /api/nonce` and HMAC-SHA256 over
//! `nonce || body`.
//!
//! Edge functions verify signatures themselves. The proxy only checks them
//! when `verify_signatures` is switched on, in which case every nonce is
//! single-use and expires after five minutes.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

use crate::store::SharedStore;

type HmacSha256 = Hmac<Sha256>;

pub const NONCE_HEADER: &str = "x-nonce";
pub const SIGNATURE_HEADER: &str = "x-signature";
pub const NONCE_TTL_SECS: i64 = 5 * 60;

/// Compute the hex HMAC-SHA256 of `nonce` followed by `body`.
pub fn compute_signature(secret: &str, nonce: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(nonce.as_bytes());
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// 16 random bytes, hex-encoded.
pub fn generate_nonce() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Valid,
    MissingHeaders,
    /// Nonce was never issued, already used, or expired.
    UnknownNonce,
    Mismatch,
}

/// Issues nonces and, when tracking is on, checks signed requests.
#[derive(Clone)]
pub struct NonceLedger {
    store: SharedStore<DateTime<Utc>>,
    secret: Arc<str>,
    track: bool,
}

impl NonceLedger {
    /// `track` remembers issued nonces so they can be verified and consumed.
    pub fn new(store: SharedStore<DateTime<Utc>>, secret: &str, track: bool) -> Self {
        Self {
            store,
            secret: Arc::from(secret),
            track,
        }
    }

    pub fn store(&self) -> SharedStore<DateTime<Utc>> {
        Arc::clone(&self.store)
    }

    pub async fn issue(&self, now: DateTime<Utc>) -> Result<String> {
        let nonce = generate_nonce();
        if self.track {
            let expires_at = now + Duration::seconds(NONCE_TTL_SECS);
            self.store.set(&nonce, expires_at, expires_at).await?;
        }
        Ok(nonce)
    }

    /// Check `signature` over `nonce || body`, consuming the nonce.
    pub async fn verify(
        &self,
        nonce: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<SignatureCheck> {
        let (Some(nonce), Some(signature)) = (nonce, signature) else {
            return Ok(SignatureCheck::MissingHeaders);
        };

        let Some(expires_at) = self.store.get(nonce).await? else {
            return Ok(SignatureCheck::UnknownNonce);
        };
        // Whoever removes the nonce owns it; a concurrent verifier loses.
        if !self.store.delete(nonce).await? || now > expires_at {
            return Ok(SignatureCheck::UnknownNonce);
        }

        let expected = compute_signature(&self.secret, nonce, body);
        if constant_time_eq(expected.as_bytes(), signature.to_ascii_lowercase().as_bytes()) {
            Ok(SignatureCheck::Valid)
        } else {
            Ok(SignatureCheck::Mismatch)
        }
    }
}
