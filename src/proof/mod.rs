//! Proof bundle verification.
//!
//! [`ProofVerifier::verify`] runs every check and collects all failures so
//! the caller gets complete diagnostics in one pass. Verification is pure
//! computation: no IO, no clock reads.

pub mod canonical;
pub mod signing;

use std::collections::BTreeSet;

use serde::Serialize;

use crate::types::{ErrorCode, PolicyDecision, ProofBundle};

use self::signing::Keyring;

/// A single verification check that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProofCheck {
    /// Spec hash in the proof differs from the recomputed hash.
    SpecHashMismatch,
    /// Policy hash in the proof differs from the current snapshot.
    PolicyHashMismatch,
    /// Signing authority is revoked.
    SignerRevoked,
    /// Signature does not verify.
    SignatureInvalid,
    /// Proof records a failing policy decision.
    DecisionNotPass,
}

impl ProofCheck {
    /// Decision code reported for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::SpecHashMismatch => ErrorCode::SpecHashMismatch,
            Self::PolicyHashMismatch => ErrorCode::PolicyHashMismatch,
            Self::SignerRevoked => ErrorCode::SignerRevoked,
            Self::SignatureInvalid => ErrorCode::SignatureInvalid,
            Self::DecisionNotPass => ErrorCode::PolicyDenied,
        }
    }

    /// Human-readable explanation.
    pub fn describe(&self, proof: &ProofBundle) -> String {
        match self {
            Self::SpecHashMismatch => format!(
                "agent spec no longer matches its proof (proof binds {})",
                proof.spec_hash
            ),
            Self::PolicyHashMismatch => format!(
                "proof was issued against policy {} which is no longer current",
                proof.policy_hash
            ),
            Self::SignerRevoked => format!(
                "proof signer '{}' has been revoked",
                proof.signature.authority
            ),
            Self::SignatureInvalid => format!(
                "proof signature by '{}' does not verify",
                proof.signature.authority
            ),
            Self::DecisionNotPass => "proof records a failing policy decision".to_owned(),
        }
    }
}

/// Outcome of verifying one proof bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyResult {
    /// True when no check failed.
    pub ok: bool,
    /// Every failed check, in check order.
    pub failed_checks: Vec<ProofCheck>,
}

/// Verifies proof bundles against the live spec, policy and signer state.
#[derive(Debug, Clone)]
pub struct ProofVerifier {
    keyring: Keyring,
}

impl ProofVerifier {
    /// Create a verifier trusting the authorities in `keyring`.
    pub fn new(keyring: Keyring) -> Self {
        Self { keyring }
    }

    /// Trusted verification keys.
    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// Run every check against `proof`.
    ///
    /// Order: spec hash, policy hash, revocation, signature, recorded
    /// decision. No short-circuit.
    pub fn verify(
        &self,
        proof: &ProofBundle,
        current_policy_hash: &str,
        recomputed_spec_hash: &str,
        revoked_signers: &BTreeSet<String>,
    ) -> VerifyResult {
        let mut failed_checks = Vec::new();

        if proof.spec_hash != recomputed_spec_hash {
            failed_checks.push(ProofCheck::SpecHashMismatch);
        }
        if proof.policy_hash != current_policy_hash {
            failed_checks.push(ProofCheck::PolicyHashMismatch);
        }
        if revoked_signers.contains(&proof.signature.authority) {
            failed_checks.push(ProofCheck::SignerRevoked);
        }
        if !self.keyring.verify_proof(proof) {
            failed_checks.push(ProofCheck::SignatureInvalid);
        }
        if proof.policy_decision != PolicyDecision::Pass {
            failed_checks.push(ProofCheck::DecisionNotPass);
        }

        VerifyResult {
            ok: failed_checks.is_empty(),
            failed_checks,
        }
    }
}
