//! Drift detection for governed agents.
//!
//! A scan reads the agent store and the current snapshots and classifies
//! each governed agent. It never writes: running it twice with no state
//! change yields the same [`DriftSummary`], and it is safe to run alongside
//! admission checks. Full scans never overlap; see [`DriftDetector::try_scan_at`].

pub mod scheduler;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::policy::evaluator::{
    EvaluationSubject, PolicyEvaluator, PolicyViolation, PromotionContext, ViolationDetail,
};
use crate::policy::{PolicyRegistry, PolicySnapshot};
use crate::proof::canonical::spec_hash;
use crate::proof::{ProofCheck, ProofVerifier};
use crate::store::{AgentStore, StoreError};
use crate::types::{Actor, AgentRecord};

/// Kind of divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftType {
    /// Live policy now rejects the agent.
    PolicyChange,
    /// Live spec no longer matches the proof.
    SpecTamper,
    /// Approval lifetime is over.
    Expired,
    /// Proof no longer verifies for another reason (signer, signature,
    /// invalidation, missing proof).
    Invalid,
}

impl DriftType {
    /// Wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyChange => "policy_change",
            Self::SpecTamper => "spec_tamper",
            Self::Expired => "expired",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for DriftType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drift severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Must be acted on immediately.
    Critical,
    /// Should be acted on soon.
    High,
    /// Needs attention.
    Medium,
    /// Informational.
    Low,
}

impl Severity {
    /// Wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the operator (or reconciliation) should do about a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    /// Every violation has a scope-reducing fix.
    AutoRemediate,
    /// A human has to look at it.
    ManualReview,
    /// The agent must stop running.
    Invalidate,
    /// Renew the approval or run restricted.
    Renew,
}

/// One drifted agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftReport {
    /// Agent identifier.
    pub agent_id: String,
    /// Policy set the agent is bound to.
    pub policy_set: String,
    /// Classification.
    pub drift_type: DriftType,
    /// Severity.
    pub severity: Severity,
    /// Human-readable explanation.
    pub details: String,
    /// Policy violations, for `policy_change`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<PolicyViolation>,
    /// Suggested follow-up.
    pub recommended_action: RecommendedAction,
}

/// Result of a full scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DriftSummary {
    /// Governed agents evaluated.
    pub total_scanned: usize,
    /// Agents with a report.
    pub total_drifted: usize,
    /// Governed agents whose policy set is not loaded.
    pub skipped: usize,
    /// Report count per type.
    pub by_type: BTreeMap<DriftType, usize>,
    /// Report count per severity.
    pub by_severity: BTreeMap<Severity, usize>,
    /// Reports, sorted by agent id.
    pub reports: Vec<DriftReport>,
}

impl DriftSummary {
    fn push(&mut self, report: DriftReport) {
        let by_type = self.by_type.entry(report.drift_type).or_insert(0);
        *by_type = by_type.saturating_add(1);
        let by_severity = self.by_severity.entry(report.severity).or_insert(0);
        *by_severity = by_severity.saturating_add(1);
        self.total_drifted = self.total_drifted.saturating_add(1);
        self.reports.push(report);
    }
}

/// Errors from a scan.
#[derive(Debug, thiserror::Error)]
pub enum DriftError {
    /// The agent store could not be read.
    #[error("agent store unavailable: {0}")]
    Store(#[from] StoreError),
    /// Agent does not exist.
    #[error("agent '{0}' not found")]
    NotFound(String),
}

/// Classifies governed agents against the live policy.
pub struct DriftDetector {
    registry: Arc<PolicyRegistry>,
    agents: Arc<dyn AgentStore>,
    evaluator: Arc<dyn PolicyEvaluator>,
    verifier: ProofVerifier,
    actor: Actor,
    scan_guard: Mutex<()>,
}

impl fmt::Debug for DriftDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriftDetector").finish_non_exhaustive()
    }
}

impl DriftDetector {
    /// Wire a detector.
    pub fn new(
        registry: Arc<PolicyRegistry>,
        agents: Arc<dyn AgentStore>,
        evaluator: Arc<dyn PolicyEvaluator>,
        verifier: ProofVerifier,
    ) -> Self {
        Self {
            registry,
            agents,
            evaluator,
            verifier,
            actor: Actor::system("drift-detector"),
            scan_guard: Mutex::new(()),
        }
    }

    /// Classify one agent against `snapshot`. `None` means no drift.
    ///
    /// Checked in priority order, first match wins: missing proof, spec
    /// tamper, expiry, policy change, then remaining proof failures. A stale
    /// policy hash alone is not drift; reconciliation re-attests it.
    pub fn detect(
        &self,
        record: &AgentRecord,
        snapshot: &PolicySnapshot,
        now: DateTime<Utc>,
    ) -> Option<DriftReport> {
        let subject = EvaluationSubject::governed(record)?;
        let policy_set = subject.governance.policy_set.clone();
        let report = |drift_type, severity, details: String, action| DriftReport {
            agent_id: record.id.clone(),
            policy_set: policy_set.clone(),
            drift_type,
            severity,
            details,
            violations: Vec::new(),
            recommended_action: action,
        };

        let Some(proof) = subject.governance.proof.as_ref() else {
            return Some(report(
                DriftType::Invalid,
                Severity::Critical,
                "governed agent has no proof bundle".to_owned(),
                RecommendedAction::Invalidate,
            ));
        };

        let live_hash = match spec_hash(&record.spec) {
            Ok(hash) => hash,
            Err(e) => {
                return Some(report(
                    DriftType::Invalid,
                    Severity::Critical,
                    format!("spec could not be hashed: {e}"),
                    RecommendedAction::Invalidate,
                ));
            }
        };
        if live_hash != proof.spec_hash {
            return Some(report(
                DriftType::SpecTamper,
                Severity::Critical,
                format!(
                    "live spec hashes to {live_hash} but proof binds {}",
                    proof.spec_hash
                ),
                RecommendedAction::Invalidate,
            ));
        }

        if let Some(expires_at) = record.expires_at.filter(|at| *at < now) {
            return Some(report(
                DriftType::Expired,
                Severity::Medium,
                format!(
                    "approval expired at {}",
                    expires_at.to_rfc3339_opts(SecondsFormat::Secs, true)
                ),
                RecommendedAction::Renew,
            ));
        }

        let ctx = PromotionContext {
            actor: &self.actor,
            policy: &snapshot.bundle,
        };
        let evaluation = self.evaluator.evaluate(&subject, &ctx);
        if !evaluation.allow {
            let fixable = evaluation
                .denies
                .iter()
                .all(|d| !matches!(d.detail, ViolationDetail::None));
            let mut drifted = report(
                DriftType::PolicyChange,
                Severity::High,
                format!(
                    "policy {} v{} rejects the agent: {}",
                    snapshot.policy_set,
                    snapshot.version,
                    evaluation.reasons().join("; ")
                ),
                if fixable {
                    RecommendedAction::AutoRemediate
                } else {
                    RecommendedAction::ManualReview
                },
            );
            drifted.violations = evaluation.denies;
            return Some(drifted);
        }

        let mut problems = Vec::new();
        if let Some(invalidation) = snapshot.invalidation(&record.id) {
            problems.push(format!("agent was invalidated: {}", invalidation.reason));
        }
        let result = self.verifier.verify(
            proof,
            &snapshot.hash,
            &live_hash,
            &snapshot.revoked_signers,
        );
        problems.extend(
            result
                .failed_checks
                .iter()
                .filter(|c| **c != ProofCheck::PolicyHashMismatch)
                .map(|c| c.describe(proof)),
        );
        if !problems.is_empty() {
            return Some(report(
                DriftType::Invalid,
                Severity::High,
                problems.join("; "),
                RecommendedAction::Invalidate,
            ));
        }
        None
    }

    /// Classify `agent_id` against its current snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`DriftError`] if the agent cannot be loaded.
    pub async fn detect_agent(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DriftReport>, DriftError> {
        let record = self
            .agents
            .get(agent_id)
            .await?
            .ok_or_else(|| DriftError::NotFound(agent_id.to_owned()))?;
        let Some(snapshot) = record.policy_set().and_then(|s| self.registry.get_snapshot(s))
        else {
            return Ok(None);
        };
        Ok(self.detect(&record, &snapshot, now))
    }

    /// Full scan as of now. Waits for an in-flight scan to finish first.
    ///
    /// # Errors
    ///
    /// Returns [`DriftError`] if the agent store cannot be read.
    pub async fn run_drift_scan(&self) -> Result<DriftSummary, DriftError> {
        self.scan_at(Utc::now()).await
    }

    /// Full scan as of `now`. Waits for an in-flight scan to finish first.
    ///
    /// # Errors
    ///
    /// Returns [`DriftError`] if the agent store cannot be read.
    pub async fn scan_at(&self, now: DateTime<Utc>) -> Result<DriftSummary, DriftError> {
        let _guard = self.scan_guard.lock().await;
        self.scan_locked(now).await
    }

    /// Full scan as of `now`, or `None` if another scan is running.
    ///
    /// # Errors
    ///
    /// Returns [`DriftError`] if the agent store cannot be read.
    pub async fn try_scan_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DriftSummary>, DriftError> {
        let Ok(_guard) = self.scan_guard.try_lock() else {
            debug!("drift scan already running; skipping");
            return Ok(None);
        };
        self.scan_locked(now).await.map(Some)
    }

    /// Scan only the agents bound to `policy_set`.
    ///
    /// # Errors
    ///
    /// Returns [`DriftError`] if the agent store cannot be read.
    pub async fn scan_policy_set(
        &self,
        policy_set: &str,
        now: DateTime<Utc>,
    ) -> Result<DriftSummary, DriftError> {
        let records = self.agents.list_governed().await?;
        Ok(self.summarize(
            records
                .iter()
                .filter(|r| r.policy_set() == Some(policy_set)),
            now,
        ))
    }

    async fn scan_locked(&self, now: DateTime<Utc>) -> Result<DriftSummary, DriftError> {
        let records = self.agents.list_governed().await?;
        Ok(self.summarize(records.iter(), now))
    }

    fn summarize<'a>(
        &self,
        records: impl Iterator<Item = &'a AgentRecord>,
        now: DateTime<Utc>,
    ) -> DriftSummary {
        let mut summary = DriftSummary::default();
        let mut reports = Vec::new();
        for record in records {
            let Some(snapshot) = record.policy_set().and_then(|s| self.registry.get_snapshot(s))
            else {
                summary.skipped = summary.skipped.saturating_add(1);
                continue;
            };
            summary.total_scanned = summary.total_scanned.saturating_add(1);
            if let Some(report) = self.detect(record, &snapshot, now) {
                reports.push(report);
            }
        }
        reports.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        for report in reports {
            summary.push(report);
        }
        summary
    }
}
