//! Pure policy evaluation.
//!
//! Every rule runs independently and all violations are collected, so a
//! reviewer sees the complete list in one pass. Evaluation reads nothing but
//! its arguments; it is called at promotion time and again, with the live
//! bundle, during drift detection.

use std::collections::BTreeSet;

use serde::Serialize;

use super::{PolicyBundle, COMPLIANCE_ROLE_CLASS, DEFAULT_ALLOWED_CAPABILITIES};
use crate::types::{
    Actor, ActorRole, AgentRecord, AgentSpec, Anatomy, ErrorCode, GovernanceConfig,
    SandboxConstraints,
};

/// Field path of the monthly budget.
pub const BUDGET_FIELD: &str = "governance.economics.monthly_budget_usd";
/// Field path of the capability list.
pub const CAPABILITIES_FIELD: &str = "governance.capabilities";
/// Field path of the reasoning temperature.
pub const TEMPERATURE_FIELD: &str = "anatomy.reasoning.temperature";

/// Rule that produced a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    /// Actor must hold an admin role.
    ActorRole,
    /// Anatomy must be non-empty.
    AnatomyPresent,
    /// Sandbox containment flags must be off before promotion.
    SandboxContainment,
    /// Capabilities must be on the allow-list.
    CapabilityAllowList,
    /// Compliance agents must stay under the temperature ceiling.
    ComplianceTemperature,
    /// Budget must stay under the organisation limit.
    BudgetLimit,
}

impl RuleId {
    /// Wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActorRole => "actor_role",
            Self::AnatomyPresent => "anatomy_present",
            Self::SandboxContainment => "sandbox_containment",
            Self::CapabilityAllowList => "capability_allow_list",
            Self::ComplianceTemperature => "compliance_temperature",
            Self::BudgetLimit => "budget_limit",
        }
    }
}

/// Structured detail that remediation can act on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationDetail {
    /// Nothing machine-actionable.
    None,
    /// A numeric field is above its ceiling.
    OverLimit {
        /// Dotted field path.
        field: String,
        /// Current value.
        actual: f64,
        /// Policy maximum.
        limit: f64,
    },
    /// A set-valued field contains disallowed entries.
    DisallowedValues {
        /// Dotted field path.
        field: String,
        /// Offending entries.
        values: Vec<String>,
    },
}

/// One rule violation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyViolation {
    /// Rule that fired.
    pub rule: RuleId,
    /// Decision code reported to callers.
    pub code: ErrorCode,
    /// Human-readable explanation.
    pub message: String,
    /// Machine-actionable detail.
    pub detail: ViolationDetail,
}

/// Result of evaluating a policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    /// True iff `denies` is empty.
    pub allow: bool,
    /// Every violation found.
    pub denies: Vec<PolicyViolation>,
}

impl Evaluation {
    fn from_denies(denies: Vec<PolicyViolation>) -> Self {
        Self {
            allow: denies.is_empty(),
            denies,
        }
    }

    /// Violation messages.
    pub fn reasons(&self) -> Vec<String> {
        self.denies.iter().map(|d| d.message.clone()).collect()
    }

    /// Distinct decision codes, in first-seen order.
    pub fn error_codes(&self) -> Vec<ErrorCode> {
        let mut codes = Vec::new();
        for deny in &self.denies {
            if !codes.contains(&deny.code) {
                codes.push(deny.code);
            }
        }
        codes
    }
}

/// Who is asking and under which bundle.
#[derive(Debug, Clone, Copy)]
pub struct PromotionContext<'a> {
    /// Actor behind the request.
    pub actor: &'a Actor,
    /// Bundle to evaluate against.
    pub policy: &'a PolicyBundle,
}

/// The agent view a policy is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationSubject<'a> {
    /// Agent identifier, for messages.
    pub agent_id: &'a str,
    /// Agent anatomy.
    pub anatomy: &'a Anatomy,
    /// Containment flags when the agent is still a sandbox.
    pub sandbox: Option<&'a SandboxConstraints>,
    /// Requested or current governance block.
    pub governance: &'a GovernanceConfig,
}

impl<'a> EvaluationSubject<'a> {
    /// View of an already-governed agent. `None` for sandbox agents.
    pub fn governed(record: &'a AgentRecord) -> Option<Self> {
        match &record.spec {
            AgentSpec::Governed(spec) => Some(Self {
                agent_id: &record.id,
                anatomy: &spec.anatomy,
                sandbox: None,
                governance: &spec.governance,
            }),
            AgentSpec::Sandbox(_) => None,
        }
    }

    /// View of a sandbox agent requesting `governance`.
    pub fn promotion(record: &'a AgentRecord, governance: &'a GovernanceConfig) -> Self {
        let sandbox = match &record.spec {
            AgentSpec::Sandbox(spec) => Some(&spec.sandbox_constraints),
            AgentSpec::Governed(_) => None,
        };
        Self {
            agent_id: &record.id,
            anatomy: record.spec.anatomy(),
            sandbox,
            governance,
        }
    }
}

/// Pluggable policy backend.
pub trait PolicyEvaluator: Send + Sync {
    /// Evaluate `subject` under `ctx`. Must be side-effect free.
    fn evaluate(&self, subject: &EvaluationSubject<'_>, ctx: &PromotionContext<'_>) -> Evaluation;
}

/// Built-in rule set.
#[derive(Debug, Clone)]
pub struct RuleBasedEvaluator {
    allowed_capabilities: BTreeSet<String>,
}

impl Default for RuleBasedEvaluator {
    fn default() -> Self {
        Self {
            allowed_capabilities: DEFAULT_ALLOWED_CAPABILITIES
                .iter()
                .map(|c| (*c).to_owned())
                .collect(),
        }
    }
}

impl RuleBasedEvaluator {
    /// Evaluator using the built-in capability allow-list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluator falling back to `allowed` when a bundle carries no list.
    pub fn with_allowed_capabilities(allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed_capabilities: allowed.into_iter().collect(),
        }
    }

    fn allow_list<'a>(&'a self, policy: &'a PolicyBundle) -> &'a BTreeSet<String> {
        policy
            .allowed_capabilities
            .as_ref()
            .unwrap_or(&self.allowed_capabilities)
    }
}

impl PolicyEvaluator for RuleBasedEvaluator {
    fn evaluate(&self, subject: &EvaluationSubject<'_>, ctx: &PromotionContext<'_>) -> Evaluation {
        let mut denies = Vec::new();

        if ctx.actor.role == ActorRole::Viewer {
            denies.push(PolicyViolation {
                rule: RuleId::ActorRole,
                code: ErrorCode::PolicyDenied,
                message: format!(
                    "actor '{}' has role '{}'; agent_admin or policy_admin is required",
                    ctx.actor.id,
                    ctx.actor.role.as_str()
                ),
                detail: ViolationDetail::None,
            });
        }

        if subject.anatomy.is_empty() {
            denies.push(PolicyViolation {
                rule: RuleId::AnatomyPresent,
                code: ErrorCode::PolicyDenied,
                message: format!("agent '{}' has an empty anatomy", subject.agent_id),
                detail: ViolationDetail::None,
            });
        }

        if let Some(sandbox) = subject.sandbox {
            let mut flags = Vec::new();
            if sandbox.external_calls {
                flags.push("external_calls");
            }
            if sandbox.persistent_writes {
                flags.push("persistent_writes");
            }
            if !flags.is_empty() {
                denies.push(PolicyViolation {
                    rule: RuleId::SandboxContainment,
                    code: ErrorCode::ContainmentViolation,
                    message: format!(
                        "sandbox containment must be restored before promotion ({} enabled)",
                        flags.join(", ")
                    ),
                    detail: ViolationDetail::None,
                });
            }
        }

        let allowed = self.allow_list(ctx.policy);
        let disallowed: Vec<String> = subject
            .governance
            .capabilities
            .iter()
            .filter(|c| !allowed.contains(*c))
            .cloned()
            .collect();
        if !disallowed.is_empty() {
            denies.push(PolicyViolation {
                rule: RuleId::CapabilityAllowList,
                code: ErrorCode::CapabilityDenied,
                message: format!("capabilities not on the allow-list: {}", disallowed.join(", ")),
                detail: ViolationDetail::DisallowedValues {
                    field: CAPABILITIES_FIELD.to_owned(),
                    values: disallowed,
                },
            });
        }

        if subject.anatomy.role_class.as_deref() == Some(COMPLIANCE_ROLE_CLASS) {
            let limit = ctx.policy.compliance.max_temperature;
            if let Some(temperature) = subject.anatomy.temperature() {
                if temperature > limit {
                    denies.push(PolicyViolation {
                        rule: RuleId::ComplianceTemperature,
                        code: ErrorCode::PolicyDenied,
                        message: format!(
                            "compliance agents require temperature <= {limit}, got {temperature}"
                        ),
                        detail: ViolationDetail::OverLimit {
                            field: TEMPERATURE_FIELD.to_owned(),
                            actual: temperature,
                            limit,
                        },
                    });
                }
            }
        }

        let budget = subject.governance.economics.monthly_budget_usd;
        let limit = ctx.policy.org_limits.max_monthly_budget_usd;
        if budget > limit {
            denies.push(PolicyViolation {
                rule: RuleId::BudgetLimit,
                code: ErrorCode::BudgetExceeded,
                message: format!(
                    "monthly budget ${budget} exceeds organisation limit ${limit}"
                ),
                detail: ViolationDetail::OverLimit {
                    field: BUDGET_FIELD.to_owned(),
                    actual: budget,
                    limit,
                },
            });
        }

        Evaluation::from_denies(denies)
    }
}
