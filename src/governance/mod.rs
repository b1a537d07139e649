//! Governance service: the operations exposed to the transport layer.
//!
//! Owns one instance of every component and wires them together. Hot
//! reloads and scans end in reconciliation, which turns drift reports into
//! status changes, invalidations and bounded remediation.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::admission::{standard_chain, AdmissionController, InterceptorDecision};
use crate::audit::metrics::{Counter, GovernanceMetrics};
use crate::audit::GovernanceLogger;
use crate::config::{AdmissionConfig, Config};
use crate::drift::scheduler::ScheduledScan;
use crate::drift::{DriftDetector, DriftError, DriftReport, DriftSummary, DriftType};
use crate::policy::evaluator::{EvaluationSubject, PolicyEvaluator, PolicyViolation, PromotionContext};
use crate::policy::watcher::PolicyUpdate;
use crate::policy::{PolicyBundle, PolicyRegistry, PolicySnapshot, RegistryError};
use crate::proof::canonical::{bundle_hash, spec_hash, CanonicalError};
use crate::proof::signing::{Attestor, Keyring, SigningError};
use crate::proof::ProofVerifier;
use crate::remediation::{
    generate_remediation_plan, ApplyOptions, BatchOptions, RemediationEngine, RemediationError,
    RemediationResult,
};
use crate::store::{AgentStore, StoreError};
use crate::types::{
    Actor, ActorRole, AgentRecord, AgentSpec, Economics, GovernanceConfig, GovernanceStatus,
    GovernedSpec, PolicyDecision, ProofBundle,
};

// ---------------------------------------------------------------------------
// Settings and request types
// ---------------------------------------------------------------------------

/// Reconciliation behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernanceSettings {
    /// Re-issue proofs for compliant agents after their policy set reloads.
    pub reattest_on_reload: bool,
    /// Reconcile after periodic scans.
    pub auto_reconcile: bool,
    /// Apply all-safe remediation plans without approval.
    pub auto_apply_safe: bool,
    /// Largest batch reconciliation may remediate at once.
    pub max_blast_radius: usize,
}

impl Default for GovernanceSettings {
    fn default() -> Self {
        Self {
            reattest_on_reload: true,
            auto_reconcile: true,
            auto_apply_safe: false,
            max_blast_radius: 10,
        }
    }
}

impl GovernanceSettings {
    /// Settings taken from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            reattest_on_reload: config.policy.reattest_on_reload,
            auto_reconcile: config.drift.auto_reconcile,
            auto_apply_safe: config.remediation.auto_apply_safe,
            max_blast_radius: config.remediation.max_blast_radius,
        }
    }
}

/// Governance block a sandbox agent asks to be promoted with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionRequest {
    /// Policy set to bind the agent to.
    pub policy_set: String,
    /// Requested capabilities.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Requested spend.
    #[serde(default)]
    pub economics: Economics,
    /// When the approval lapses, if ever.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Result of a promotion attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromotionOutcome {
    /// Agent that asked.
    pub agent_id: String,
    /// Whether the agent is now governed.
    pub approved: bool,
    /// Every violation when denied.
    pub violations: Vec<PolicyViolation>,
    /// Issued proof when approved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<ProofBundle>,
}

/// Result of a hot reload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReloadReport {
    /// Policy set that changed.
    pub policy_set: String,
    /// New snapshot version.
    pub version: u64,
    /// Hash before the reload, `"none"` on first load.
    pub old_hash: String,
    /// Hash of the adopted bundle.
    pub new_hash: String,
    /// Agents invalidated by the reload.
    pub invalidated_agent_ids: Vec<String>,
    /// Everything reconciliation did.
    pub reconciliation: ReconcileReport,
    /// Set when the bundle was adopted but reconciliation could not finish.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile_error: Option<String>,
}

/// What reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// Newly invalidated agents.
    pub invalidated: Vec<String>,
    /// Agents moved to `GOVERNED_RESTRICTED`.
    pub restricted: Vec<String>,
    /// Compliant agents given a proof for the new policy hash.
    pub reattested: Vec<String>,
    /// Agents remediated automatically.
    pub remediated: Vec<String>,
    /// Agents whose automatic remediation did not run, with the reason.
    pub rejected: Vec<(String, String)>,
}

/// Errors from governance operations.
#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    /// Actor lacks the role for the operation.
    #[error("actor '{actor}' may not {operation}")]
    Forbidden {
        /// Actor id.
        actor: String,
        /// What was attempted.
        operation: &'static str,
    },
    /// Agent does not exist.
    #[error("agent '{0}' not found")]
    AgentNotFound(String),
    /// Only sandbox agents can be promoted.
    #[error("agent '{0}' is already governed")]
    AlreadyGoverned(String),
    /// Governed specs are only created by promotion.
    #[error("agent '{0}' carries a governed spec; register it as sandbox and promote it")]
    GovernedRegistration(String),
    /// No snapshot is loaded for the policy set.
    #[error("no policy loaded for policy set '{0}'")]
    PolicySetNotLoaded(String),
    /// Registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Agent store failure.
    #[error("agent store error: {0}")]
    Store(#[from] StoreError),
    /// Drift scan failure.
    #[error(transparent)]
    Drift(#[from] DriftError),
    /// Remediation failure.
    #[error(transparent)]
    Remediation(#[from] RemediationError),
    /// Spec could not be hashed.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    /// Proof could not be signed.
    #[error(transparent)]
    Signing(#[from] SigningError),
}

/// Shared collaborators a service is built from.
pub struct GovernanceDeps {
    /// Policy snapshots.
    pub registry: Arc<PolicyRegistry>,
    /// Agent records.
    pub agents: Arc<dyn AgentStore>,
    /// Policy backend.
    pub evaluator: Arc<dyn PolicyEvaluator>,
    /// Issues proofs on promotion, remediation and re-attestation.
    pub attestor: Attestor,
    /// Keys trusted when verifying proofs.
    pub keyring: Keyring,
    /// Audit trail.
    pub logger: Arc<GovernanceLogger>,
    /// Counters.
    pub metrics: Arc<GovernanceMetrics>,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Entry point for every governance operation.
pub struct GovernanceService {
    registry: Arc<PolicyRegistry>,
    agents: Arc<dyn AgentStore>,
    evaluator: Arc<dyn PolicyEvaluator>,
    attestor: Attestor,
    admission: AdmissionController,
    detector: DriftDetector,
    remediation: RemediationEngine,
    logger: Arc<GovernanceLogger>,
    metrics: Arc<GovernanceMetrics>,
    settings: GovernanceSettings,
}

impl std::fmt::Debug for GovernanceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceService")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl GovernanceService {
    /// Build the service with the standard interceptor chain.
    pub fn new(
        deps: GovernanceDeps,
        admission: &AdmissionConfig,
        settings: GovernanceSettings,
    ) -> Self {
        let verifier = ProofVerifier::new(deps.keyring);
        let chain = standard_chain(verifier.clone(), admission);
        let admission = AdmissionController::new(
            Arc::clone(&deps.registry),
            Arc::clone(&deps.agents),
            chain,
            verifier.clone(),
            Arc::clone(&deps.logger),
            Arc::clone(&deps.metrics),
        );
        let detector = DriftDetector::new(
            Arc::clone(&deps.registry),
            Arc::clone(&deps.agents),
            Arc::clone(&deps.evaluator),
            verifier,
        );
        let remediation = RemediationEngine::new(
            Arc::clone(&deps.agents),
            Arc::clone(&deps.registry),
            Arc::clone(&deps.evaluator),
            deps.attestor.clone(),
            Arc::clone(&deps.logger),
            Arc::clone(&deps.metrics),
        );
        Self {
            registry: deps.registry,
            agents: deps.agents,
            evaluator: deps.evaluator,
            attestor: deps.attestor,
            admission,
            detector,
            remediation,
            logger: deps.logger,
            metrics: deps.metrics,
            settings,
        }
    }

    /// Policy registry.
    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    /// Counters.
    pub fn metrics(&self) -> &Arc<GovernanceMetrics> {
        &self.metrics
    }

    /// Drift detector.
    pub fn detector(&self) -> &DriftDetector {
        &self.detector
    }

    /// Remediation engine.
    pub fn remediation(&self) -> &RemediationEngine {
        &self.remediation
    }

    // -- admission ----------------------------------------------------------

    /// Decide whether `agent_id` may start.
    pub async fn check_admission(&self, agent_id: &str) -> InterceptorDecision {
        self.admission.check_admission(agent_id).await
    }

    /// Decide whether `agent_id` may start, as of `now`.
    pub async fn check_admission_at(&self, agent_id: &str, now: DateTime<Utc>) -> InterceptorDecision {
        self.admission.check_admission_at(agent_id, now).await
    }

    // -- registration -------------------------------------------------------

    /// Store a new sandbox agent. See [`register_sandbox_at`](Self::register_sandbox_at).
    ///
    /// # Errors
    ///
    /// See [`register_sandbox_at`](Self::register_sandbox_at).
    pub async fn register_sandbox(
        &self,
        agent_id: &str,
        spec: AgentSpec,
    ) -> Result<AgentRecord, GovernanceError> {
        self.register_sandbox_at(agent_id, spec, Utc::now()).await
    }

    /// Store `spec` as a fresh sandbox record created at `now`.
    ///
    /// Status, timestamps and expiry are derived here, never taken from the
    /// caller. Re-registering a sandbox agent restarts its lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError::GovernedRegistration`] for a governed spec,
    /// [`GovernanceError::AlreadyGoverned`] if `agent_id` is already
    /// governed, or a store error.
    pub async fn register_sandbox_at(
        &self,
        agent_id: &str,
        spec: AgentSpec,
        now: DateTime<Utc>,
    ) -> Result<AgentRecord, GovernanceError> {
        let AgentSpec::Sandbox(spec) = spec else {
            return Err(GovernanceError::GovernedRegistration(agent_id.to_owned()));
        };
        if let Some(existing) = self.agents.get(agent_id).await? {
            if existing.is_governed() {
                return Err(GovernanceError::AlreadyGoverned(agent_id.to_owned()));
            }
        }
        let record = AgentRecord::new_sandbox(agent_id, spec, now);
        self.agents.save(&record).await?;
        info!(agent_id, expires_at = ?record.expires_at, "sandbox agent registered");
        Ok(record)
    }

    // -- promotion ----------------------------------------------------------

    /// Promote a sandbox agent to governed.
    ///
    /// A denied promotion is an `Ok` outcome listing every violation.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError`] if the agent is missing or already
    /// governed, the policy set is not loaded, or persistence fails.
    pub async fn promote(
        &self,
        agent_id: &str,
        request: PromotionRequest,
        actor: &Actor,
    ) -> Result<PromotionOutcome, GovernanceError> {
        self.promote_at(agent_id, request, actor, Utc::now()).await
    }

    /// [`promote`](Self::promote) as of `now`.
    ///
    /// # Errors
    ///
    /// See [`promote`](Self::promote).
    pub async fn promote_at(
        &self,
        agent_id: &str,
        request: PromotionRequest,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<PromotionOutcome, GovernanceError> {
        self.metrics.incr(Counter::PromotionAttempts);

        let mut record = self
            .agents
            .get(agent_id)
            .await?
            .ok_or_else(|| GovernanceError::AgentNotFound(agent_id.to_owned()))?;
        let AgentSpec::Sandbox(sandbox) = &record.spec else {
            return Err(GovernanceError::AlreadyGoverned(agent_id.to_owned()));
        };
        let snapshot = self
            .registry
            .get_snapshot(&request.policy_set)
            .ok_or_else(|| GovernanceError::PolicySetNotLoaded(request.policy_set.clone()))?;

        let governance = GovernanceConfig {
            policy_set: request.policy_set,
            capabilities: request.capabilities,
            economics: request.economics,
            proof: None,
        };
        let evaluation = {
            let subject = EvaluationSubject::promotion(&record, &governance);
            let ctx = PromotionContext {
                actor,
                policy: &snapshot.bundle,
            };
            self.evaluator.evaluate(&subject, &ctx)
        };
        if !evaluation.allow {
            self.metrics.incr(Counter::PromotionDenied);
            self.logger
                .promotion(agent_id, actor, false, &evaluation.reasons())
                .await;
            info!(agent_id, violations = evaluation.denies.len(), "promotion denied");
            return Ok(PromotionOutcome {
                agent_id: agent_id.to_owned(),
                approved: false,
                violations: evaluation.denies,
                proof: None,
            });
        }

        let mut spec = AgentSpec::Governed(GovernedSpec {
            anatomy: sandbox.anatomy.clone(),
            governance,
        });
        let hash = spec_hash(&spec)?;
        let proof = self
            .attestor
            .issue(&hash, &snapshot.hash, PolicyDecision::Pass, now)?;
        if let AgentSpec::Governed(governed) = &mut spec {
            governed.governance.proof = Some(proof.clone());
        }

        let previous = record.status;
        let reason = format!("promoted by {}", actor.id);
        record.spec = spec;
        record.expires_at = request.expires_at;
        record.status = GovernanceStatus::GovernedValid;
        record.status_reason = Some(reason.clone());
        record.updated_at = now;
        self.agents.save(&record).await?;

        self.logger.promotion(agent_id, actor, true, &[]).await;
        self.logger
            .status_changed(agent_id, previous, GovernanceStatus::GovernedValid, &reason)
            .await;
        info!(agent_id, policy_set = %snapshot.policy_set, "agent promoted");
        Ok(PromotionOutcome {
            agent_id: agent_id.to_owned(),
            approved: true,
            violations: Vec::new(),
            proof: Some(proof),
        })
    }

    // -- policy -------------------------------------------------------------

    /// Adopt `bundle` for `policy_set` and reconcile the agents bound to it.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError::Forbidden`] for actors without the
    /// policy-admin role, or a registry error if the bundle was not adopted.
    /// The current snapshot is unchanged in both cases.
    pub async fn hot_reload_policy(
        &self,
        policy_set: &str,
        bundle: PolicyBundle,
        actor: &Actor,
    ) -> Result<ReloadReport, GovernanceError> {
        if actor.role != ActorRole::PolicyAdmin {
            self.metrics.incr(Counter::PolicyReloadFailure);
            self.logger
                .policy_reload_failed(policy_set, actor, "actor is not a policy admin")
                .await;
            return Err(GovernanceError::Forbidden {
                actor: actor.id.clone(),
                operation: "reload policy",
            });
        }

        let outcome = match self.registry.hot_reload(policy_set, bundle).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics.incr(Counter::PolicyReloadFailure);
                self.logger
                    .policy_reload_failed(policy_set, actor, &e.to_string())
                    .await;
                return Err(e.into());
            }
        };
        self.metrics.incr(Counter::PolicyReloadSuccess);
        self.logger
            .policy_reloaded(policy_set, actor, &outcome.old_hash, &outcome.new_hash)
            .await;

        let (reconciliation, reconcile_error) =
            match self.reconcile_policy_set(policy_set, Utc::now()).await {
                Ok(report) => (report, None),
                Err(e) => {
                    warn!(policy_set, error = %e, "reconciliation after reload failed");
                    (ReconcileReport::default(), Some(e.to_string()))
                }
            };

        Ok(ReloadReport {
            policy_set: outcome.policy_set,
            version: outcome.version,
            old_hash: outcome.old_hash,
            new_hash: outcome.new_hash,
            invalidated_agent_ids: reconciliation.invalidated.clone(),
            reconciliation,
            reconcile_error,
        })
    }

    /// Hot-reload a bundle picked up by the directory watcher. Unchanged
    /// bundles are ignored; failures are logged and leave the snapshot as is.
    pub async fn apply_policy_update(&self, update: PolicyUpdate) -> Option<ReloadReport> {
        if let Some(current) = self.registry.get_snapshot(&update.policy_set) {
            match bundle_hash(&update.bundle) {
                Ok(hash) if hash == current.hash => {
                    debug!(policy_set = %update.policy_set, "policy file unchanged");
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %update.path.display(), error = %e, "policy file could not be hashed");
                    return None;
                }
            }
        }

        let actor = Actor::system("policy-watcher");
        match self
            .hot_reload_policy(&update.policy_set, update.bundle, &actor)
            .await
        {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(path = %update.path.display(), error = %e, "policy file rejected");
                None
            }
        }
    }

    // -- signers and invalidation --------------------------------------------

    /// Revoke `authority`. Returns whether it was newly revoked.
    ///
    /// # Errors
    ///
    /// Returns a registry error if the revocation cannot be persisted.
    pub async fn revoke_signer(&self, authority: &str) -> Result<bool, GovernanceError> {
        let added = self.registry.add_revoked_signer(authority).await?;
        if added {
            self.logger.signer(authority, true).await;
        }
        Ok(added)
    }

    /// Restore trust in `authority`. Returns whether it was revoked.
    ///
    /// # Errors
    ///
    /// Returns a registry error if the change cannot be persisted.
    pub async fn unrevoke_signer(&self, authority: &str) -> Result<bool, GovernanceError> {
        let removed = self.registry.remove_revoked_signer(authority).await?;
        if removed {
            self.logger.signer(authority, false).await;
        }
        Ok(removed)
    }

    /// Drop `agent_id` from the invalidation map.
    ///
    /// # Errors
    ///
    /// Returns a registry error if the change cannot be persisted.
    pub async fn clear_invalidation(&self, agent_id: &str) -> Result<bool, GovernanceError> {
        let cleared = self.registry.clear_invalidation(agent_id).await?;
        if cleared {
            self.logger.invalidation_cleared(agent_id).await;
        }
        Ok(cleared)
    }

    // -- drift ---------------------------------------------------------------

    /// Scan every governed agent, then reconcile when configured to.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError`] if the agent store cannot be read.
    pub async fn run_drift_scan(&self) -> Result<DriftSummary, GovernanceError> {
        let now = Utc::now();
        let summary = self.detector.scan_at(now).await?;
        self.after_scan(&summary, now).await;
        Ok(summary)
    }

    async fn after_scan(&self, summary: &DriftSummary, now: DateTime<Utc>) {
        self.metrics.incr(Counter::DriftScans);
        self.metrics.add(
            Counter::DriftDetected,
            u64::try_from(summary.total_drifted).unwrap_or(u64::MAX),
        );
        for report in &summary.reports {
            self.logger.drift(report).await;
        }
        info!(
            scanned = summary.total_scanned,
            drifted = summary.total_drifted,
            skipped = summary.skipped,
            "drift scan complete"
        );

        if self.settings.auto_reconcile && !summary.reports.is_empty() {
            match self.reconcile(&summary.reports, now).await {
                Ok(report) => debug!(?report, "post-scan reconciliation complete"),
                Err(e) => warn!(error = %e, "post-scan reconciliation failed"),
            }
        }
    }

    // -- remediation ---------------------------------------------------------

    /// Detect drift on `agent_id` and apply the resulting plan.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError`] if the agent is missing or the plan needs
    /// approval and `force` is not set.
    pub async fn remediate(
        &self,
        agent_id: &str,
        options: ApplyOptions,
    ) -> Result<RemediationResult, GovernanceError> {
        let now = Utc::now();
        let Some(report) = self.detector.detect_agent(agent_id, now).await.map_err(|e| match e {
            DriftError::NotFound(id) => GovernanceError::AgentNotFound(id),
            other => other.into(),
        })?
        else {
            return Ok(RemediationResult::nothing_to_do(agent_id));
        };
        let Some(plan) = generate_remediation_plan(&report) else {
            return Ok(RemediationResult::nothing_to_do(agent_id));
        };
        Ok(self.remediation.apply_at(&plan, options, now).await?)
    }

    // -- reconciliation -------------------------------------------------------

    /// Reconcile every governed agent bound to `policy_set`.
    ///
    /// Compliant agents holding a proof for an older policy hash are
    /// re-attested; drifted ones are handed to [`reconcile`](Self::reconcile).
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError`] if the agent store or registry fails.
    pub async fn reconcile_policy_set(
        &self,
        policy_set: &str,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, GovernanceError> {
        let Some(snapshot) = self.registry.get_snapshot(policy_set) else {
            return Ok(ReconcileReport::default());
        };
        let records = self.agents.list_governed().await?;

        let mut drifts = Vec::new();
        let mut stale = Vec::new();
        for record in records
            .into_iter()
            .filter(|r| r.policy_set() == Some(policy_set))
        {
            match self.detector.detect(&record, &snapshot, now) {
                Some(report) => drifts.push(report),
                None => {
                    let outdated = record
                        .proof()
                        .is_some_and(|p| p.policy_hash != snapshot.hash);
                    if outdated && self.settings.reattest_on_reload {
                        stale.push(record);
                    }
                }
            }
        }

        let mut report = self.reconcile(&drifts, now).await?;
        for record in stale {
            let id = record.id.clone();
            match self.reattest(record, &snapshot, now).await {
                Ok(()) => report.reattested.push(id),
                Err(e) => {
                    warn!(agent_id = %id, error = %e, "re-attestation failed");
                    report.rejected.push((id, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Act on drift reports.
    ///
    /// spec_tamper and invalid agents are invalidated; expired agents are
    /// restricted; policy_change agents are remediated in one bounded batch
    /// when their plan is all-safe and auto-apply is on, otherwise
    /// restricted (safe plan) or invalidated (plan needing approval).
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError`] if the registry or agent store fails.
    pub async fn reconcile(
        &self,
        drifts: &[DriftReport],
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, GovernanceError> {
        let mut report = ReconcileReport::default();
        let mut to_invalidate: Vec<&DriftReport> = Vec::new();
        let mut to_restrict: Vec<(String, String)> = Vec::new();
        let mut auto_batch: Vec<DriftReport> = Vec::new();

        for drift in drifts {
            match drift.drift_type {
                DriftType::SpecTamper | DriftType::Invalid => to_invalidate.push(drift),
                DriftType::Expired => to_restrict.push((drift.agent_id.clone(), drift.details.clone())),
                DriftType::PolicyChange => match generate_remediation_plan(drift) {
                    Some(plan) if plan.is_safe() && self.settings.auto_apply_safe => {
                        auto_batch.push(drift.clone());
                    }
                    Some(plan) if plan.is_safe() => {
                        to_restrict.push((drift.agent_id.clone(), drift.details.clone()));
                    }
                    _ => to_invalidate.push(drift),
                },
            }
        }

        if !auto_batch.is_empty() {
            let options = BatchOptions {
                max_blast_radius: self.settings.max_blast_radius,
                apply: ApplyOptions::default(),
            };
            match self.remediation.batch_remediation(&auto_batch, options).await {
                Ok(batch) => {
                    report.remediated = batch
                        .results
                        .iter()
                        .filter(|r| r.reattested)
                        .map(|r| r.agent_id.clone())
                        .collect();
                    for (agent_id, reason) in batch.rejected {
                        to_restrict.push((agent_id.clone(), reason.clone()));
                        report.rejected.push((agent_id, reason));
                    }
                }
                Err(e) => {
                    warn!(error = %e, "automatic remediation refused");
                    for drift in &auto_batch {
                        to_restrict.push((drift.agent_id.clone(), drift.details.clone()));
                        report.rejected.push((drift.agent_id.clone(), e.to_string()));
                    }
                }
            }
        }

        for drift in to_invalidate {
            let reason = format!("{}: {}", drift.drift_type, drift.details);
            let added = self
                .registry
                .invalidate_agents(std::slice::from_ref(&drift.agent_id), &reason, now)
                .await?;
            if !added.is_empty() {
                self.metrics.add(
                    Counter::InvalidationEvents,
                    u64::try_from(added.len()).unwrap_or(u64::MAX),
                );
                self.logger.agents_invalidated(&added, &reason).await;
                report.invalidated.extend(added);
            }
            self.set_status(&drift.agent_id, GovernanceStatus::GovernedInvalidated, &reason)
                .await?;
        }

        for (agent_id, reason) in to_restrict {
            if self
                .set_status(&agent_id, GovernanceStatus::GovernedRestricted, &reason)
                .await?
            {
                report.restricted.push(agent_id);
            }
        }

        if !report.invalidated.is_empty() || !report.restricted.is_empty() {
            info!(
                invalidated = report.invalidated.len(),
                restricted = report.restricted.len(),
                remediated = report.remediated.len(),
                "reconciliation applied"
            );
        }
        Ok(report)
    }

    /// Write `status` if it differs from the cached one. Returns whether it changed.
    async fn set_status(
        &self,
        agent_id: &str,
        status: GovernanceStatus,
        reason: &str,
    ) -> Result<bool, GovernanceError> {
        let Some(record) = self.agents.get(agent_id).await? else {
            return Ok(false);
        };
        if record.status == status {
            return Ok(false);
        }
        self.agents.update_status(agent_id, status, reason).await?;
        self.logger
            .status_changed(agent_id, record.status, status, reason)
            .await;
        Ok(true)
    }

    async fn reattest(
        &self,
        mut record: AgentRecord,
        snapshot: &PolicySnapshot,
        now: DateTime<Utc>,
    ) -> Result<(), GovernanceError> {
        let hash = spec_hash(&record.spec)?;
        let proof = self
            .attestor
            .issue(&hash, &snapshot.hash, PolicyDecision::Pass, now)?;
        if let AgentSpec::Governed(spec) = &mut record.spec {
            spec.governance.proof = Some(proof);
        }
        let previous = record.status;
        let reason = format!(
            "re-attested against {} v{}",
            snapshot.policy_set, snapshot.version
        );
        record.status = GovernanceStatus::GovernedValid;
        record.status_reason = Some(reason.clone());
        record.updated_at = now;
        self.agents.save(&record).await?;

        self.logger.reattested(&record.id, &snapshot.hash).await;
        if previous != GovernanceStatus::GovernedValid {
            self.logger
                .status_changed(&record.id, previous, GovernanceStatus::GovernedValid, &reason)
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl ScheduledScan for GovernanceService {
    async fn run_scheduled_scan(&self) -> anyhow::Result<bool> {
        let now = Utc::now();
        let Some(summary) = self.detector.try_scan_at(now).await? else {
            return Ok(false);
        };
        self.after_scan(&summary, now).await;
        Ok(true)
    }
}
