//! Recency attestations.
//!
//! The backend signs `(nonce, timestamp, issuer)` tuples and hands them to
//! relays it has just synchronized with. Endpoints that can reach several
//! relays ask each for its blob and prefer the relay holding the freshest
//! valid one.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::crypto::{Ed25519PublicKey, Ed25519Signature, Keypair};
use crate::error::{CoreError, Result};

/// Current recency blob version.
pub const RECENCY_VERSION: u8 = 1;

const SIGNING_DOMAIN: &[u8] = b"bundlenet/recency/v1";

/// The signed tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecencyBlob {
    pub version: u8,
    pub nonce: u64,
    /// Unix milliseconds at issue time.
    pub timestamp_ms: i64,
    pub issuer: Ed25519PublicKey,
}

impl RecencyBlob {
    /// Bytes covered by the issuer signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SIGNING_DOMAIN.len() + 1 + 8 + 8 + 32);
        out.extend_from_slice(SIGNING_DOMAIN);
        out.push(self.version);
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out.extend_from_slice(self.issuer.as_bytes());
        out
    }
}

/// A recency blob plus the issuer's signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRecencyBlob {
    pub blob: RecencyBlob,
    pub signature: Ed25519Signature,
}

/// Acceptance rules for recency blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecencyPolicy {
    pub max_age: Duration,
    pub future_skew: Duration,
    /// When set, blobs from any other issuer are rejected.
    pub expected_issuer: Option<Ed25519PublicKey>,
}

impl RecencyPolicy {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            future_skew: Duration::from_secs(60),
            expected_issuer: None,
        }
    }

    pub fn with_issuer(mut self, issuer: Ed25519PublicKey) -> Self {
        self.expected_issuer = Some(issuer);
        self
    }

    pub fn with_future_skew(mut self, skew: Duration) -> Self {
        self.future_skew = skew;
        self
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Sign a fresh recency blob.
pub fn sign_recency_blob(issuer: &Keypair, nonce: u64, timestamp_ms: i64) -> SignedRecencyBlob {
    let blob = RecencyBlob {
        version: RECENCY_VERSION,
        nonce,
        timestamp_ms,
        issuer: issuer.public_key(),
    };
    let signature = issuer.sign(&blob.signing_bytes());
    SignedRecencyBlob { blob, signature }
}

impl SignedRecencyBlob {
    /// Check the blob against `policy` at time `now_ms`.
    ///
    /// Issuer, signature, then age are checked; the first failure is returned.
    pub fn verify(&self, policy: &RecencyPolicy, now_ms: i64) -> Result<()> {
        if self.blob.version != RECENCY_VERSION {
            return Err(CoreError::DecodingError(format!(
                "unsupported recency version {}",
                self.blob.version
            )));
        }
        if let Some(expected) = &policy.expected_issuer {
            if *expected != self.blob.issuer {
                return Err(CoreError::RecencyIssuerMismatch);
            }
        }
        self.blob
            .issuer
            .verify(&self.blob.signing_bytes(), &self.signature)?;

        let age_ms = now_ms.saturating_sub(self.blob.timestamp_ms);
        let max_age_ms = duration_ms(policy.max_age);
        if age_ms > max_age_ms {
            return Err(CoreError::StaleRecencyBlob { age_ms, max_age_ms });
        }
        // i64::MIN has no negation; saturating keeps such a blob rejected.
        let ahead_ms = age_ms.saturating_neg();
        if ahead_ms > duration_ms(policy.future_skew) {
            return Err(CoreError::FutureRecencyBlob { ahead_ms });
        }
        Ok(())
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| CoreError::EncodingError(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))
    }
}

/// Boolean form of [`SignedRecencyBlob::verify`] against the current clock.
///
/// A `false` result means "skip this relay", never a hard failure.
pub fn verify_recency_blob(blob: &SignedRecencyBlob, max_age: Duration) -> bool {
    blob.verify(&RecencyPolicy::new(max_age), now_millis()).is_ok()
}

/// Pick the candidate whose blob is valid and has the newest timestamp.
///
/// Invalid blobs are skipped. Ties keep the earlier candidate.
pub fn select_freshest<K, I>(candidates: I, policy: &RecencyPolicy, now_ms: i64) -> Option<K>
where
    I: IntoIterator<Item = (K, SignedRecencyBlob)>,
{
    let mut best: Option<(K, i64)> = None;
    for (key, blob) in candidates {
        if blob.verify(policy, now_ms).is_err() {
            continue;
        }
        let ts = blob.blob.timestamp_ms;
        if best.as_ref().map_or(true, |(_, best_ts)| ts > *best_ts) {
            best = Some((key, ts));
        }
    }
    best.map(|(key, _)| key)
}

/// Current time in Unix milliseconds.
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
