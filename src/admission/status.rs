//! Governance status derivation.
//!
//! The cached status on an agent record is a read optimisation. This is the
//! rule it must always agree with.

use chrono::{DateTime, Utc};

use crate::policy::PolicySnapshot;
use crate::proof::{ProofCheck, ProofVerifier};
use crate::types::{AgentRecord, AgentSpec, GovernanceStatus};

/// Recompute the status of `record` from its mode, proof and the snapshot.
///
/// Returns `None` when the status cannot be determined (governed agent whose
/// policy set is not loaded); callers keep the cached value then.
///
/// - sandbox spec: `SANDBOX`
/// - invalidated, proof missing, or a failed integrity check (spec hash,
///   signature, revoked signer): `GOVERNED_INVALIDATED`
/// - stale policy hash, a FAIL decision in the proof, or expired:
///   `GOVERNED_RESTRICTED`
/// - otherwise `GOVERNED_VALID`, whatever the cached status says
pub fn derive_status(
    record: &AgentRecord,
    snapshot: Option<&PolicySnapshot>,
    verifier: &ProofVerifier,
    spec_hash: &str,
    now: DateTime<Utc>,
) -> Option<(GovernanceStatus, String)> {
    let AgentSpec::Governed(spec) = &record.spec else {
        return Some((GovernanceStatus::Sandbox, "sandbox agent".to_owned()));
    };
    let snapshot = snapshot?;

    if let Some(invalidation) = snapshot.invalidation(&record.id) {
        return Some((
            GovernanceStatus::GovernedInvalidated,
            invalidation.reason.clone(),
        ));
    }
    let Some(proof) = &spec.governance.proof else {
        return Some((
            GovernanceStatus::GovernedInvalidated,
            "proof bundle missing".to_owned(),
        ));
    };

    let result = verifier.verify(proof, &snapshot.hash, spec_hash, &snapshot.revoked_signers);
    if let Some(check) = result
        .failed_checks
        .iter()
        .find(|c| !matches!(c, ProofCheck::PolicyHashMismatch | ProofCheck::DecisionNotPass))
    {
        return Some((GovernanceStatus::GovernedInvalidated, check.describe(proof)));
    }
    if result.failed_checks.contains(&ProofCheck::PolicyHashMismatch) {
        return Some((
            GovernanceStatus::GovernedRestricted,
            "proof is bound to a superseded policy version".to_owned(),
        ));
    }
    if result.failed_checks.contains(&ProofCheck::DecisionNotPass) {
        return Some((
            GovernanceStatus::GovernedRestricted,
            "proof records unresolved policy violations".to_owned(),
        ));
    }
    if record.is_expired_at(now) {
        return Some((
            GovernanceStatus::GovernedRestricted,
            "governance approval expired".to_owned(),
        ));
    }
    Some((GovernanceStatus::GovernedValid, "proof verified".to_owned()))
}
