//! Bounded remediation of drifted agents.
//!
//! Plans are applied one action at a time. Each successful action is
//! re-evaluated and saved together with a fresh proof bound to the changed
//! spec, so the stored spec and proof never disagree. A failed action does
//! not roll back earlier ones; the result reports every action
//! individually. The last saved proof is PASS with `GOVERNED_VALID` when
//! the agent now complies, FAIL with `GOVERNED_RESTRICTED` when it does not.

pub mod plan;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

pub use self::plan::{
    generate_remediation_plan, ActionType, BlastRadius, RemediationAction, RemediationPlan,
};
use crate::audit::metrics::{Counter, GovernanceMetrics};
use crate::audit::GovernanceLogger;
use crate::drift::DriftReport;
use crate::policy::evaluator::{
    EvaluationSubject, PolicyEvaluator, PromotionContext, BUDGET_FIELD, CAPABILITIES_FIELD,
    TEMPERATURE_FIELD,
};
use crate::policy::{PolicyRegistry, PolicySnapshot};
use crate::proof::canonical::{spec_hash, CanonicalError};
use crate::proof::signing::{Attestor, SigningError};
use crate::store::{AgentStore, StoreError};
use crate::types::{Actor, AgentRecord, AgentSpec, GovernanceStatus, PolicyDecision};

/// Errors that stop a plan or batch before any action runs.
#[derive(Debug, thiserror::Error)]
pub enum RemediationError {
    /// Plan contains unsafe actions and `force` was not set.
    #[error("remediation plan for '{agent_id}' requires approval")]
    ApprovalRequired {
        /// Agent the plan applies to.
        agent_id: String,
    },
    /// Batch is larger than the allowed blast radius.
    #[error("batch of {count} drifted agents exceeds max blast radius {max}")]
    BlastRadiusExceeded {
        /// Drift reports in the batch.
        count: usize,
        /// Configured limit.
        max: usize,
    },
    /// Agent does not exist.
    #[error("agent '{0}' not found")]
    AgentNotFound(String),
    /// Agent store failure.
    #[error("agent store error: {0}")]
    Store(#[from] StoreError),
    /// No snapshot is loaded for the plan's policy set.
    #[error("no policy loaded for policy set '{0}'")]
    SnapshotMissing(String),
    /// Spec could not be hashed.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    /// Proof could not be signed.
    #[error(transparent)]
    Signing(#[from] SigningError),
}

/// How to apply a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyOptions {
    /// Validate only; write nothing.
    pub dry_run: bool,
    /// Apply even if the plan requires approval. Unsafe actions are still
    /// never executed automatically.
    pub force: bool,
}

/// Batch limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchOptions {
    /// Maximum number of drift reports a batch may touch.
    pub max_blast_radius: usize,
    /// Per-plan options.
    pub apply: ApplyOptions,
}

/// Outcome of one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Written.
    Applied,
    /// Would be written (dry run).
    WouldApply,
    /// Not executed.
    Skipped,
    /// Attempted and failed.
    Failed,
}

/// Per-action report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionOutcome {
    /// The action.
    pub action: RemediationAction,
    /// What happened.
    pub status: ActionStatus,
    /// Explanation for skipped or failed actions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Result of applying one plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemediationResult {
    /// Agent the plan applied to.
    pub agent_id: String,
    /// Whether this was a dry run.
    pub dry_run: bool,
    /// One entry per plan action.
    pub outcomes: Vec<ActionOutcome>,
    /// Status after remediation, if it changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_status: Option<GovernanceStatus>,
    /// Whether a fresh proof was issued.
    pub reattested: bool,
}

impl RemediationResult {
    /// Result for an agent that needed nothing.
    pub fn nothing_to_do(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_owned(),
            dry_run: false,
            outcomes: Vec::new(),
            new_status: None,
            reattested: false,
        }
    }

    /// Actions written.
    pub fn applied_count(&self) -> usize {
        self.count(ActionStatus::Applied)
    }

    /// Actions that failed.
    pub fn failed_count(&self) -> usize {
        self.count(ActionStatus::Failed)
    }

    fn count(&self, status: ActionStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

/// Result of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchResult {
    /// Plans that ran.
    pub results: Vec<RemediationResult>,
    /// Agents whose plan could not run, with the reason.
    pub rejected: Vec<(String, String)>,
}

/// Turns drift into corrective actions.
pub struct RemediationEngine {
    agents: Arc<dyn AgentStore>,
    registry: Arc<PolicyRegistry>,
    evaluator: Arc<dyn PolicyEvaluator>,
    attestor: Attestor,
    logger: Arc<GovernanceLogger>,
    metrics: Arc<GovernanceMetrics>,
    actor: Actor,
}

impl std::fmt::Debug for RemediationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemediationEngine")
            .field("authority", &self.attestor.authority())
            .finish_non_exhaustive()
    }
}

impl RemediationEngine {
    /// Wire an engine.
    pub fn new(
        agents: Arc<dyn AgentStore>,
        registry: Arc<PolicyRegistry>,
        evaluator: Arc<dyn PolicyEvaluator>,
        attestor: Attestor,
        logger: Arc<GovernanceLogger>,
        metrics: Arc<GovernanceMetrics>,
    ) -> Self {
        Self {
            agents,
            registry,
            evaluator,
            attestor,
            logger,
            metrics,
            actor: Actor::system("remediation"),
        }
    }

    /// Plan for `drift`. See [`generate_remediation_plan`].
    pub fn generate_remediation_plan(&self, drift: &DriftReport) -> Option<RemediationPlan> {
        generate_remediation_plan(drift)
    }

    /// Apply `plan` now.
    ///
    /// # Errors
    ///
    /// Returns [`RemediationError::ApprovalRequired`] for an unforced plan
    /// needing approval, or an error if the agent or its policy snapshot
    /// cannot be loaded. Nothing is written in those cases.
    /// Per-action failures are reported in the result, not as errors.
    pub async fn apply_remediation_plan(
        &self,
        plan: &RemediationPlan,
        options: ApplyOptions,
    ) -> Result<RemediationResult, RemediationError> {
        self.apply_at(plan, options, Utc::now()).await
    }

    /// Apply `plan` as of `now`.
    ///
    /// # Errors
    ///
    /// See [`apply_remediation_plan`](Self::apply_remediation_plan).
    pub async fn apply_at(
        &self,
        plan: &RemediationPlan,
        options: ApplyOptions,
        now: DateTime<Utc>,
    ) -> Result<RemediationResult, RemediationError> {
        if plan.requires_approval && !options.force {
            return Err(RemediationError::ApprovalRequired {
                agent_id: plan.agent_id.clone(),
            });
        }

        let mut record = self
            .agents
            .get(&plan.agent_id)
            .await?
            .ok_or_else(|| RemediationError::AgentNotFound(plan.agent_id.clone()))?;
        let snapshot = self
            .registry
            .get_snapshot(&plan.policy_set)
            .ok_or_else(|| RemediationError::SnapshotMissing(plan.policy_set.clone()))?;
        let previous = record.status;

        let mut outcomes = Vec::with_capacity(plan.actions.len());
        let mut changed = false;
        for action in &plan.actions {
            let outcome = if !action.safe {
                outcome(action, ActionStatus::Skipped, Some("requires manual review".to_owned()))
            } else {
                let mut candidate = record.clone();
                match apply_action(&mut candidate, action) {
                    Ok(false) => outcome(
                        action,
                        ActionStatus::Skipped,
                        Some("already within policy".to_owned()),
                    ),
                    Ok(true) if options.dry_run => outcome(action, ActionStatus::WouldApply, None),
                    Ok(true) => match self.attest(&mut candidate, &snapshot, now) {
                        // The spec change and its proof land in a single save.
                        Ok(()) => match self.agents.save(&candidate).await {
                            Ok(()) => {
                                record = candidate;
                                changed = true;
                                outcome(action, ActionStatus::Applied, None)
                            }
                            Err(e) => outcome(action, ActionStatus::Failed, Some(e.to_string())),
                        },
                        Err(e) => outcome(action, ActionStatus::Failed, Some(e.to_string())),
                    },
                    Err(message) => outcome(action, ActionStatus::Failed, Some(message)),
                }
            };
            outcomes.push(outcome);
        }

        let mut result = RemediationResult {
            agent_id: plan.agent_id.clone(),
            dry_run: options.dry_run,
            outcomes,
            new_status: None,
            reattested: false,
        };

        if changed {
            let status = record.status;
            self.logger.reattested(&record.id, &snapshot.hash).await;
            if previous != status {
                let reason = record.status_reason.clone().unwrap_or_default();
                self.logger
                    .status_changed(&record.id, previous, status, &reason)
                    .await;
            }
            info!(agent_id = %record.id, %status, "agent re-attested after remediation");
            result.new_status = Some(status);
            result.reattested = true;
        }

        let applied = u64::try_from(result.applied_count()).unwrap_or(u64::MAX);
        let failed = u64::try_from(result.failed_count()).unwrap_or(u64::MAX);
        self.metrics.add(Counter::RemediationApplied, applied);
        self.metrics.add(Counter::RemediationFailed, failed);
        self.logger.remediation(&result).await;
        Ok(result)
    }

    /// Re-evaluate `record` in memory and bind a fresh proof to its current spec.
    fn attest(
        &self,
        record: &mut AgentRecord,
        snapshot: &PolicySnapshot,
        now: DateTime<Utc>,
    ) -> Result<(), RemediationError> {
        let allow = match EvaluationSubject::governed(record) {
            Some(subject) => {
                let ctx = PromotionContext {
                    actor: &self.actor,
                    policy: &snapshot.bundle,
                };
                self.evaluator.evaluate(&subject, &ctx).allow
            }
            None => false,
        };
        let (decision, status, reason) = if allow {
            (
                PolicyDecision::Pass,
                GovernanceStatus::GovernedValid,
                "remediated and re-attested",
            )
        } else {
            (
                PolicyDecision::Fail,
                GovernanceStatus::GovernedRestricted,
                "partially remediated; violations remain",
            )
        };

        let hash = spec_hash(&record.spec)?;
        let proof = self.attestor.issue(&hash, &snapshot.hash, decision, now)?;
        if let AgentSpec::Governed(spec) = &mut record.spec {
            spec.governance.proof = Some(proof);
        }
        record.status = status;
        record.status_reason = Some(reason.to_owned());
        record.updated_at = now;
        Ok(())
    }

    /// Remediate every report in `drifts`.
    ///
    /// Refuses the whole batch, touching nothing, when it holds more reports
    /// than `options.max_blast_radius`. Otherwise each plan runs
    /// independently; a plan that cannot run is listed in
    /// [`BatchResult::rejected`].
    ///
    /// # Errors
    ///
    /// Returns [`RemediationError::BlastRadiusExceeded`] before any action.
    pub async fn batch_remediation(
        &self,
        drifts: &[DriftReport],
        options: BatchOptions,
    ) -> Result<BatchResult, RemediationError> {
        if drifts.len() > options.max_blast_radius {
            warn!(
                count = drifts.len(),
                max = options.max_blast_radius,
                "remediation batch rejected by blast radius"
            );
            return Err(RemediationError::BlastRadiusExceeded {
                count: drifts.len(),
                max: options.max_blast_radius,
            });
        }

        let mut batch = BatchResult::default();
        for drift in drifts {
            let Some(plan) = generate_remediation_plan(drift) else {
                continue;
            };
            match self.apply_remediation_plan(&plan, options.apply).await {
                Ok(result) => batch.results.push(result),
                Err(e) => batch.rejected.push((drift.agent_id.clone(), e.to_string())),
            }
        }
        Ok(batch)
    }
}

fn outcome(action: &RemediationAction, status: ActionStatus, message: Option<String>) -> ActionOutcome {
    ActionOutcome {
        action: action.clone(),
        status,
        message,
    }
}

/// Apply one safe action to `record` in memory.
///
/// `Ok(true)` if the record changed, `Ok(false)` if it already complied.
fn apply_action(record: &mut AgentRecord, action: &RemediationAction) -> Result<bool, String> {
    let AgentSpec::Governed(spec) = &mut record.spec else {
        return Err("only governed agents can be remediated".to_owned());
    };

    match (action.action_type, action.field.as_str()) {
        (ActionType::LowerLimit, BUDGET_FIELD) => {
            let limit = number(&action.new_value)?;
            let budget = &mut spec.governance.economics.monthly_budget_usd;
            if *budget <= limit {
                return Ok(false);
            }
            *budget = limit;
            Ok(true)
        }
        (ActionType::LowerLimit, TEMPERATURE_FIELD) => {
            let limit = number(&action.new_value)?;
            let Some(reasoning) = spec.anatomy.reasoning.as_mut() else {
                return Ok(false);
            };
            match reasoning.temperature {
                Some(t) if t > limit => {
                    reasoning.temperature = Some(limit);
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
        (ActionType::RemoveValues, CAPABILITIES_FIELD) => {
            let values = action
                .old_value
                .as_array()
                .ok_or_else(|| "remove action carries no values".to_owned())?;
            let mut removed = false;
            for value in values.iter().filter_map(Value::as_str) {
                removed |= spec.governance.capabilities.remove(value);
            }
            Ok(removed)
        }
        (action_type, field) => Err(format!(
            "no automatic {action_type:?} handler for field '{field}'"
        )),
    }
}

fn number(value: &Value) -> Result<f64, String> {
    value
        .as_f64()
        .ok_or_else(|| format!("expected a number, got {value}"))
}
