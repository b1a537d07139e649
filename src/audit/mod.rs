//! Governance decision trail.
//!
//! [`GovernanceLogger`] writes one structured `tracing` event per decision
//! and forwards the same record to the configured [`AuditSink`]. Sink
//! failures are logged, never propagated: an audit outage must not turn an
//! admission decision into an error.

pub mod metrics;

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::admission::InterceptorDecision;
use crate::drift::DriftReport;
use crate::remediation::RemediationResult;
use crate::store::AuditSink;
use crate::types::{Actor, GovernanceStatus};

/// Audit record discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionCode {
    /// Admission allowed without advisories.
    AdmissionAllowed,
    /// Admission allowed with advisory reasons.
    AdmissionRestricted,
    /// Admission denied.
    AdmissionDenied,
    /// Promotion approved and proof issued.
    PromotionApproved,
    /// Promotion denied by policy.
    PromotionDenied,
    /// Policy bundle hot-reloaded.
    PolicyReloaded,
    /// Policy hot-reload failed; snapshot unchanged.
    PolicyReloadFailed,
    /// Agents added to the invalidation map.
    AgentsInvalidated,
    /// Agent removed from the invalidation map.
    InvalidationCleared,
    /// Signer added to the revocation set.
    SignerRevoked,
    /// Signer removed from the revocation set.
    SignerUnrevoked,
    /// Drift detected for an agent.
    DriftDetected,
    /// Proof re-issued against a new policy version.
    ProofReattested,
    /// Remediation plan applied (fully or partially).
    RemediationApplied,
    /// Remediation plan could not be applied.
    RemediationFailed,
    /// Cached governance status changed.
    StatusChanged,
}

impl DecisionCode {
    /// Wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdmissionAllowed => "ADMISSION_ALLOWED",
            Self::AdmissionRestricted => "ADMISSION_RESTRICTED",
            Self::AdmissionDenied => "ADMISSION_DENIED",
            Self::PromotionApproved => "PROMOTION_APPROVED",
            Self::PromotionDenied => "PROMOTION_DENIED",
            Self::PolicyReloaded => "POLICY_RELOADED",
            Self::PolicyReloadFailed => "POLICY_RELOAD_FAILED",
            Self::AgentsInvalidated => "AGENTS_INVALIDATED",
            Self::InvalidationCleared => "INVALIDATION_CLEARED",
            Self::SignerRevoked => "SIGNER_REVOKED",
            Self::SignerUnrevoked => "SIGNER_UNREVOKED",
            Self::DriftDetected => "DRIFT_DETECTED",
            Self::ProofReattested => "PROOF_REATTESTED",
            Self::RemediationApplied => "REMEDIATION_APPLIED",
            Self::RemediationFailed => "REMEDIATION_FAILED",
            Self::StatusChanged => "STATUS_CHANGED",
        }
    }
}

/// Structured governance logger.
pub struct GovernanceLogger {
    sink: Option<Arc<dyn AuditSink>>,
}

impl std::fmt::Debug for GovernanceLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceLogger")
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl GovernanceLogger {
    /// Logger forwarding to `sink`.
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Logger that only emits `tracing` events.
    pub fn tracing_only() -> Self {
        Self { sink: None }
    }

    /// Record an admission decision.
    pub async fn admission(&self, agent_id: &str, decision: &InterceptorDecision) {
        let code = if decision.deny {
            DecisionCode::AdmissionDenied
        } else if decision.restrict {
            DecisionCode::AdmissionRestricted
        } else {
            DecisionCode::AdmissionAllowed
        };
        info!(
            agent_id,
            deny = decision.deny,
            restrict = decision.restrict,
            error_codes = ?decision.error_codes,
            "admission decision"
        );
        self.emit(
            code,
            json!({
                "agent_id": agent_id,
                "allow": decision.allow,
                "deny": decision.deny,
                "restrict": decision.restrict,
                "reasons": decision.reasons,
                "error_codes": decision.error_codes,
            }),
        )
        .await;
    }

    /// Record a promotion outcome.
    pub async fn promotion(&self, agent_id: &str, actor: &Actor, approved: bool, reasons: &[String]) {
        let code = if approved {
            DecisionCode::PromotionApproved
        } else {
            DecisionCode::PromotionDenied
        };
        info!(agent_id, actor = %actor.id, approved, "promotion decision");
        self.emit(
            code,
            json!({
                "agent_id": agent_id,
                "actor": actor,
                "approved": approved,
                "reasons": reasons,
            }),
        )
        .await;
    }

    /// Record a successful hot-reload.
    pub async fn policy_reloaded(&self, policy_set: &str, actor: &Actor, old_hash: &str, new_hash: &str) {
        info!(policy_set, actor = %actor.id, old_hash, new_hash, "policy reloaded");
        self.emit(
            DecisionCode::PolicyReloaded,
            json!({
                "policy_set": policy_set,
                "actor": actor,
                "old_hash": old_hash,
                "new_hash": new_hash,
            }),
        )
        .await;
    }

    /// Record a failed hot-reload.
    pub async fn policy_reload_failed(&self, policy_set: &str, actor: &Actor, error: &str) {
        warn!(policy_set, actor = %actor.id, error, "policy reload failed");
        self.emit(
            DecisionCode::PolicyReloadFailed,
            json!({ "policy_set": policy_set, "actor": actor, "error": error }),
        )
        .await;
    }

    /// Record invalidation of one or more agents.
    pub async fn agents_invalidated(&self, agent_ids: &[String], reason: &str) {
        warn!(count = agent_ids.len(), reason, "agents invalidated");
        self.emit(
            DecisionCode::AgentsInvalidated,
            json!({ "agent_ids": agent_ids, "reason": reason }),
        )
        .await;
    }

    /// Record removal of an invalidation.
    pub async fn invalidation_cleared(&self, agent_id: &str) {
        info!(agent_id, "invalidation cleared");
        self.emit(DecisionCode::InvalidationCleared, json!({ "agent_id": agent_id }))
            .await;
    }

    /// Record a revocation change.
    pub async fn signer(&self, authority: &str, revoked: bool) {
        let code = if revoked {
            DecisionCode::SignerRevoked
        } else {
            DecisionCode::SignerUnrevoked
        };
        warn!(authority, revoked, "signer trust changed");
        self.emit(code, json!({ "authority": authority })).await;
    }

    /// Record a drift report.
    pub async fn drift(&self, report: &DriftReport) {
        warn!(
            agent_id = %report.agent_id,
            drift_type = %report.drift_type,
            severity = %report.severity,
            "drift detected"
        );
        self.emit(
            DecisionCode::DriftDetected,
            serde_json::to_value(report).unwrap_or_else(|_| json!({ "agent_id": report.agent_id })),
        )
        .await;
    }

    /// Record a proof re-attestation.
    pub async fn reattested(&self, agent_id: &str, policy_hash: &str) {
        info!(agent_id, policy_hash, "proof re-attested");
        self.emit(
            DecisionCode::ProofReattested,
            json!({ "agent_id": agent_id, "policy_hash": policy_hash }),
        )
        .await;
    }

    /// Record a remediation result.
    pub async fn remediation(&self, result: &RemediationResult) {
        let code = if result.failed_count() == 0 {
            DecisionCode::RemediationApplied
        } else {
            DecisionCode::RemediationFailed
        };
        info!(
            agent_id = %result.agent_id,
            dry_run = result.dry_run,
            applied = result.applied_count(),
            failed = result.failed_count(),
            "remediation result"
        );
        self.emit(
            code,
            serde_json::to_value(result).unwrap_or_else(|_| json!({ "agent_id": result.agent_id })),
        )
        .await;
    }

    /// Record a cached status transition.
    pub async fn status_changed(
        &self,
        agent_id: &str,
        from: GovernanceStatus,
        to: GovernanceStatus,
        reason: &str,
    ) {
        info!(agent_id, %from, %to, reason, "governance status changed");
        self.emit(
            DecisionCode::StatusChanged,
            json!({ "agent_id": agent_id, "from": from, "to": to, "reason": reason }),
        )
        .await;
    }

    async fn emit(&self, code: DecisionCode, mut context: serde_json::Value) {
        let Some(sink) = &self.sink else {
            return;
        };
        if let serde_json::Value::Object(map) = &mut context {
            map.insert("decision_id".to_owned(), json!(Uuid::new_v4().to_string()));
            map.insert("recorded_at".to_owned(), json!(Utc::now().to_rfc3339()));
        }
        if let Err(e) = sink.record(code, &context).await {
            warn!(code = code.as_str(), error = %e, "failed to write audit record");
        }
    }
}
