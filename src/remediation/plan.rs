//! Remediation plan generation.
//!
//! An action is safe only when it narrows scope: lowering a numeric field to
//! the policy maximum or removing disallowed values. Everything else becomes
//! a manual-review action and forces approval.

use serde::Serialize;
use serde_json::{json, Value};

use crate::drift::{DriftReport, DriftType};
use crate::policy::evaluator::ViolationDetail;

/// What an action does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Lower a numeric field to the policy maximum.
    LowerLimit,
    /// Remove disallowed entries from a set-valued field.
    RemoveValues,
    /// Nothing automatic; a human has to decide.
    ManualReview,
}

/// One corrective step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemediationAction {
    /// Kind of action.
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// Dotted field path, or the drift type for manual review.
    pub field: String,
    /// Value observed when the plan was made.
    pub old_value: Value,
    /// Value the action writes.
    pub new_value: Value,
    /// Why.
    pub reason: String,
    /// Whether the action may run without approval.
    pub safe: bool,
}

/// Coarse size of a plan's impact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlastRadius {
    /// One or two safe field changes.
    Low,
    /// More than two safe field changes.
    Medium,
    /// Includes an unsafe action.
    High,
}

/// Corrective actions for one agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemediationPlan {
    /// Agent the plan applies to.
    pub agent_id: String,
    /// Policy set the plan was computed against.
    pub policy_set: String,
    /// Drift that triggered the plan.
    pub drift_type: DriftType,
    /// Actions, in application order.
    pub actions: Vec<RemediationAction>,
    /// True iff any action is unsafe.
    pub requires_approval: bool,
    /// Impact classification.
    pub blast_radius: BlastRadius,
}

impl RemediationPlan {
    /// Whether every action is safe.
    pub fn is_safe(&self) -> bool {
        !self.requires_approval
    }
}

/// Map a drift report to a plan. `None` when there is nothing to do.
pub fn generate_remediation_plan(drift: &DriftReport) -> Option<RemediationPlan> {
    let actions: Vec<RemediationAction> = match drift.drift_type {
        DriftType::PolicyChange => drift
            .violations
            .iter()
            .map(|violation| match &violation.detail {
                ViolationDetail::OverLimit {
                    field,
                    actual,
                    limit,
                } => RemediationAction {
                    action_type: ActionType::LowerLimit,
                    field: field.clone(),
                    old_value: json!(actual),
                    new_value: json!(limit),
                    reason: violation.message.clone(),
                    safe: true,
                },
                ViolationDetail::DisallowedValues { field, values } => RemediationAction {
                    action_type: ActionType::RemoveValues,
                    field: field.clone(),
                    old_value: json!(values),
                    new_value: json!([]),
                    reason: violation.message.clone(),
                    safe: true,
                },
                ViolationDetail::None => {
                    manual_review(&format!("rule:{}", violation.rule.as_str()), &violation.message)
                }
            })
            .collect(),
        DriftType::SpecTamper | DriftType::Expired | DriftType::Invalid => {
            vec![manual_review(drift.drift_type.as_str(), &drift.details)]
        }
    };

    if actions.is_empty() {
        return None;
    }

    let requires_approval = actions.iter().any(|a| !a.safe);
    let blast_radius = if requires_approval {
        BlastRadius::High
    } else if actions.len() > 2 {
        BlastRadius::Medium
    } else {
        BlastRadius::Low
    };

    Some(RemediationPlan {
        agent_id: drift.agent_id.clone(),
        policy_set: drift.policy_set.clone(),
        drift_type: drift.drift_type,
        actions,
        requires_approval,
        blast_radius,
    })
}

fn manual_review(field: &str, reason: &str) -> RemediationAction {
    RemediationAction {
        action_type: ActionType::ManualReview,
        field: field.to_owned(),
        old_value: Value::Null,
        new_value: Value::Null,
        reason: reason.to_owned(),
        safe: false,
    }
}
