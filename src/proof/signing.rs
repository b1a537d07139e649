//! HMAC-SHA256 proof signatures and attestation.
//!
//! The signed payload is the canonical JSON of
//! `{authority, policy_hash, signed_at, spec_hash}` with `signed_at` rendered
//! as RFC 3339 at millisecond precision. Signatures travel as standard base64.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use super::canonical::{canonical_json, CanonicalError};
use crate::types::{PolicyDecision, ProofBundle, ProofSignature};

type HmacSha256 = Hmac<Sha256>;

/// Minimum accepted secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Errors from signing operations.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    /// Secret is too short to be a signing key.
    #[error("signing secret for {authority} is {len} bytes, need at least {MIN_SECRET_LEN}")]
    WeakSecret {
        /// Authority the secret belongs to.
        authority: String,
        /// Actual length.
        len: usize,
    },
    /// HMAC could not be keyed.
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    /// Payload could not be canonicalized.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

/// Secret key material for one authority.
#[derive(Clone)]
pub struct SigningKey {
    secret: Vec<u8>,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl SigningKey {
    /// Wrap raw secret bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::WeakSecret`] when shorter than [`MIN_SECRET_LEN`].
    pub fn new(authority: &str, secret: impl Into<Vec<u8>>) -> Result<Self, SigningError> {
        let secret = secret.into();
        if secret.len() < MIN_SECRET_LEN {
            return Err(SigningError::WeakSecret {
                authority: authority.to_owned(),
                len: secret.len(),
            });
        }
        Ok(Self { secret })
    }

    fn mac(&self) -> Result<HmacSha256, SigningError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|e| SigningError::InvalidKey(e.to_string()))
    }

    /// Base64 HMAC of `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::InvalidKey`] if the MAC cannot be keyed.
    pub fn sign(&self, payload: &[u8]) -> Result<String, SigningError> {
        let mut mac = self.mac()?;
        mac.update(payload);
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    /// Constant-time check of a base64 signature. Malformed input is `false`.
    pub fn verify(&self, payload: &[u8], sig_b64: &str) -> bool {
        let Ok(expected) = BASE64.decode(sig_b64.as_bytes()) else {
            return false;
        };
        let Ok(mut mac) = self.mac() else {
            return false;
        };
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    }
}

#[derive(Serialize)]
struct SignedPayload<'a> {
    authority: &'a str,
    policy_hash: &'a str,
    signed_at: String,
    spec_hash: &'a str,
}

/// Canonical bytes covered by a proof signature.
///
/// # Errors
///
/// Returns [`SigningError::Canonical`] if serialization fails.
pub fn signing_payload(
    policy_hash: &str,
    spec_hash: &str,
    authority: &str,
    signed_at: DateTime<Utc>,
) -> Result<Vec<u8>, SigningError> {
    let payload = SignedPayload {
        authority,
        policy_hash,
        signed_at: signed_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        spec_hash,
    };
    Ok(canonical_json(&payload)?.into_bytes())
}

/// Verification keys by authority.
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    keys: BTreeMap<String, SigningKey>,
}

impl Keyring {
    /// Empty keyring; every signature fails against it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the key for `authority`.
    pub fn insert(&mut self, authority: impl Into<String>, key: SigningKey) {
        self.keys.insert(authority.into(), key);
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with_key(mut self, authority: impl Into<String>, key: SigningKey) -> Self {
        self.insert(authority, key);
        self
    }

    /// Whether the keyring knows `authority`.
    pub fn contains(&self, authority: &str) -> bool {
        self.keys.contains_key(authority)
    }

    /// Number of authorities.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no authority is configured.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Verify the signature block of `proof`.
    ///
    /// Unknown authorities and malformed signatures verify as `false`.
    pub fn verify_proof(&self, proof: &ProofBundle) -> bool {
        let Some(key) = self.keys.get(&proof.signature.authority) else {
            return false;
        };
        let Ok(payload) = signing_payload(
            &proof.policy_hash,
            &proof.spec_hash,
            &proof.signature.authority,
            proof.signature.signed_at,
        ) else {
            return false;
        };
        key.verify(&payload, &proof.signature.sig)
    }
}

/// Issues signed proof bundles on behalf of one authority.
#[derive(Debug, Clone)]
pub struct Attestor {
    authority: String,
    key: SigningKey,
}

impl Attestor {
    /// Create an attestor.
    pub fn new(authority: impl Into<String>, key: SigningKey) -> Self {
        Self {
            authority: authority.into(),
            key,
        }
    }

    /// Authority name written into issued proofs.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Keyring that verifies this attestor's proofs.
    pub fn keyring(&self) -> Keyring {
        Keyring::new().with_key(self.authority.clone(), self.key.clone())
    }

    /// Issue a proof binding `spec_hash` to `policy_hash`.
    ///
    /// # Errors
    ///
    /// Returns a [`SigningError`] if the payload cannot be signed.
    pub fn issue(
        &self,
        spec_hash: &str,
        policy_hash: &str,
        decision: PolicyDecision,
        now: DateTime<Utc>,
    ) -> Result<ProofBundle, SigningError> {
        let payload = signing_payload(policy_hash, spec_hash, &self.authority, now)?;
        let sig = self.key.sign(&payload)?;
        Ok(ProofBundle {
            policy_decision: decision,
            policy_hash: policy_hash.to_owned(),
            spec_hash: spec_hash.to_owned(),
            signature: ProofSignature {
                authority: self.authority.clone(),
                signed_at: now,
                sig,
            },
        })
    }
}

/// Generate a fresh random secret, base64 encoded.
pub fn generate_secret() -> String {
    use rand::RngCore;

    let mut bytes = [0u8; MIN_SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}
