//! Policy bundles, evaluation and the live snapshot registry.
//!
//! A [`PolicyBundle`] is the unit that gets hashed, persisted, versioned and
//! hot-reloaded. Evaluation is behind the [`evaluator::PolicyEvaluator`]
//! trait so a compiled-policy backend can replace the rule-based one without
//! touching admission or the registry.

pub mod evaluator;
pub mod registry;
pub mod watcher;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub use self::evaluator::{
    Evaluation, EvaluationSubject, PolicyEvaluator, PolicyViolation, PromotionContext,
    RuleBasedEvaluator, RuleId, ViolationDetail,
};
pub use self::registry::{PolicyRegistry, PolicySnapshot, RegistryError, ReloadOutcome};

/// Capabilities a governed agent may declare when the bundle has no list.
pub const DEFAULT_ALLOWED_CAPABILITIES: &[&str] = &[
    "read_documents",
    "search_knowledge",
    "summarize",
    "draft_content",
    "send_notification",
    "query_database",
    "call_internal_api",
    "schedule_task",
];

/// Role class subject to the compliance temperature ceiling.
pub const COMPLIANCE_ROLE_CLASS: &str = "compliance";

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// One version of a policy set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyBundle {
    /// Author-assigned version label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Opaque rule documents. Hashed, not interpreted by the rule-based evaluator.
    #[serde(default)]
    pub rules: Vec<serde_json::Value>,
    /// Capability allow-list. Falls back to the evaluator's list when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_capabilities: Option<BTreeSet<String>>,
    /// Organisation-wide limits.
    #[serde(default)]
    pub org_limits: OrgLimits,
    /// Compliance constraints.
    #[serde(default)]
    pub compliance: ComplianceLimits,
}

/// Organisation-wide limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgLimits {
    /// Ceiling for `governance.economics.monthly_budget_usd`.
    #[serde(default = "default_max_monthly_budget_usd")]
    pub max_monthly_budget_usd: f64,
}

impl Default for OrgLimits {
    fn default() -> Self {
        Self {
            max_monthly_budget_usd: default_max_monthly_budget_usd(),
        }
    }
}

fn default_max_monthly_budget_usd() -> f64 {
    1000.0
}

/// Compliance constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceLimits {
    /// Temperature ceiling for compliance-class agents.
    #[serde(default = "default_max_temperature")]
    pub max_temperature: f64,
}

impl Default for ComplianceLimits {
    fn default() -> Self {
        Self {
            max_temperature: default_max_temperature(),
        }
    }
}

fn default_max_temperature() -> f64 {
    0.3
}

impl PolicyBundle {
    /// Parse a bundle from JSON text.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the document is not a bundle.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
