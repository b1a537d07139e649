//! Core governance data model.
//!
//! Agent specs are a tagged union ([`AgentSpec::Sandbox`] |
//! [`AgentSpec::Governed`]) so every field access is an exhaustive match.
//! The persisted proof bundle shape is a cross-version wire contract; field
//! names here must not change.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Agent records
// ---------------------------------------------------------------------------

/// Stored agent: volatile envelope plus the immutable spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Stable agent identifier.
    pub id: String,
    /// When the record was first created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
    /// Hard expiry, if any. Sandbox agents always carry one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Cached governance status. Re-derivable; never the source of truth.
    pub status: GovernanceStatus,
    /// Why the status last changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    /// The agent specification.
    pub spec: AgentSpec,
}

impl AgentRecord {
    /// Create a new sandbox agent record expiring after `auto_expiry_hours`.
    pub fn new_sandbox(id: impl Into<String>, spec: SandboxSpec, now: DateTime<Utc>) -> Self {
        let hours = i64::from(spec.sandbox_constraints.auto_expiry_hours);
        let expires_at = now.checked_add_signed(Duration::hours(hours));
        Self {
            id: id.into(),
            created_at: now,
            updated_at: now,
            expires_at,
            status: GovernanceStatus::Sandbox,
            status_reason: None,
            spec: AgentSpec::Sandbox(spec),
        }
    }

    /// Whether the agent runs under governance (any `GOVERNED_*` status).
    pub fn is_governed(&self) -> bool {
        matches!(self.spec, AgentSpec::Governed(_))
    }

    /// Governance block of a governed agent.
    pub fn governance(&self) -> Option<&GovernanceConfig> {
        match &self.spec {
            AgentSpec::Governed(governed) => Some(&governed.governance),
            AgentSpec::Sandbox(_) => None,
        }
    }

    /// Policy set a governed agent is bound to.
    pub fn policy_set(&self) -> Option<&str> {
        self.governance().map(|g| g.policy_set.as_str())
    }

    /// Proof bundle of a governed agent, if one was issued.
    pub fn proof(&self) -> Option<&ProofBundle> {
        self.governance().and_then(|g| g.proof.as_ref())
    }

    /// Whether `expires_at` is set and strictly before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }
}

/// Agent specification, tagged by operating mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AgentSpec {
    /// Unapproved, contained agent.
    Sandbox(SandboxSpec),
    /// Promoted agent bound to a verified proof.
    Governed(GovernedSpec),
}

impl AgentSpec {
    /// Shared anatomy of either variant.
    pub fn anatomy(&self) -> &Anatomy {
        match self {
            Self::Sandbox(spec) => &spec.anatomy,
            Self::Governed(spec) => &spec.anatomy,
        }
    }

    /// Short mode label used in logs.
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Sandbox(_) => "sandbox",
            Self::Governed(_) => "governed",
        }
    }
}

/// Sandbox variant of an agent spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSpec {
    /// What the agent is made of.
    pub anatomy: Anatomy,
    /// Local runtime limits.
    #[serde(default)]
    pub local_constraints: LocalConstraints,
    /// Containment flags.
    pub sandbox_constraints: SandboxConstraints,
}

/// Governed variant of an agent spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernedSpec {
    /// What the agent is made of.
    pub anatomy: Anatomy,
    /// Governance binding.
    pub governance: GovernanceConfig,
}

/// Agent anatomy: role, reasoning settings and free-form components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Anatomy {
    /// Role class, e.g. `"compliance"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_class: Option<String>,
    /// Reasoning parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
    /// Remaining anatomy components (prompts, tools, memory, ...).
    #[serde(flatten)]
    pub components: BTreeMap<String, Value>,
}

impl Anatomy {
    /// True when no anatomy field at all is present.
    pub fn is_empty(&self) -> bool {
        self.role_class.is_none() && self.reasoning.is_none() && self.components.is_empty()
    }

    /// Reasoning temperature, if configured.
    pub fn temperature(&self) -> Option<f64> {
        self.reasoning.as_ref().and_then(|r| r.temperature)
    }
}

/// Reasoning parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Model identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

/// Local runtime limits for sandbox agents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConstraints {
    /// Maximum wall-clock runtime per run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_secs: Option<u64>,
    /// Maximum tokens per run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    /// Tools the sandbox may call locally.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
}

/// Sandbox containment flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConstraints {
    /// Whether the agent wants to call external services.
    #[serde(default)]
    pub external_calls: bool,
    /// Whether the agent wants durable writes.
    #[serde(default)]
    pub persistent_writes: bool,
    /// Lifetime of the sandbox in hours.
    #[serde(default = "default_auto_expiry_hours")]
    pub auto_expiry_hours: u32,
}

impl Default for SandboxConstraints {
    fn default() -> Self {
        Self {
            external_calls: false,
            persistent_writes: false,
            auto_expiry_hours: default_auto_expiry_hours(),
        }
    }
}

fn default_auto_expiry_hours() -> u32 {
    72
}

impl SandboxConstraints {
    /// Both containment flags are off.
    pub fn is_contained(&self) -> bool {
        !self.external_calls && !self.persistent_writes
    }
}

/// Governance binding of a promoted agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Policy set the agent is governed by.
    pub policy_set: String,
    /// Declared capabilities.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Spending limits.
    #[serde(default)]
    pub economics: Economics,
    /// Proof of compliance issued at promotion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<ProofBundle>,
}

/// Spending limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Economics {
    /// Monthly budget in USD.
    #[serde(default)]
    pub monthly_budget_usd: f64,
}

// ---------------------------------------------------------------------------
// Proof bundle (wire contract)
// ---------------------------------------------------------------------------

/// Outcome recorded in a proof bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyDecision {
    /// Policy evaluation passed.
    Pass,
    /// Policy evaluation failed.
    Fail,
}

/// Signed evidence that a spec was approved against a policy version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofBundle {
    /// Decision at signing time.
    pub policy_decision: PolicyDecision,
    /// `sha256:<hex>` of the policy bundle.
    pub policy_hash: String,
    /// `sha256:<hex>` of the canonical agent spec.
    pub spec_hash: String,
    /// Detached signature.
    pub signature: ProofSignature,
}

/// Signature block of a proof bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofSignature {
    /// Signing authority.
    pub authority: String,
    /// Signing time.
    pub signed_at: DateTime<Utc>,
    /// Base64 signature over the canonical payload.
    pub sig: String,
}

// ---------------------------------------------------------------------------
// Governance status
// ---------------------------------------------------------------------------

/// Cached governance status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GovernanceStatus {
    /// Contained, unapproved agent.
    Sandbox,
    /// Governed agent with a valid proof.
    GovernedValid,
    /// Governed agent running under restrictions pending remediation.
    GovernedRestricted,
    /// Governed agent that must not run.
    GovernedInvalidated,
}

impl GovernanceStatus {
    /// Persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sandbox => "SANDBOX",
            Self::GovernedValid => "GOVERNED_VALID",
            Self::GovernedRestricted => "GOVERNED_RESTRICTED",
            Self::GovernedInvalidated => "GOVERNED_INVALIDATED",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SANDBOX" => Some(Self::Sandbox),
            "GOVERNED_VALID" => Some(Self::GovernedValid),
            "GOVERNED_RESTRICTED" => Some(Self::GovernedRestricted),
            "GOVERNED_INVALIDATED" => Some(Self::GovernedInvalidated),
            _ => None,
        }
    }

    /// Any of the `GOVERNED_*` states.
    pub fn is_governed(&self) -> bool {
        !matches!(self, Self::Sandbox)
    }
}

impl fmt::Display for GovernanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Group an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorGroup {
    /// Proof verification failures.
    Proof,
    /// Sandbox containment failures.
    Sandbox,
    /// Policy evaluation failures.
    Policy,
    /// Resource limit failures.
    Resource,
    /// Runtime and lookup failures.
    Runtime,
}

/// Machine-readable decision code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Governed agent has no proof bundle.
    ProofMissing,
    /// Proof spec hash does not match the live spec.
    SpecHashMismatch,
    /// Proof policy hash does not match the current snapshot.
    PolicyHashMismatch,
    /// Proof signature does not verify.
    SignatureInvalid,
    /// Proof signer has been revoked.
    SignerRevoked,
    /// Sandbox lifetime is over.
    SandboxExpired,
    /// Sandbox requests production capabilities.
    ContainmentViolation,
    /// Policy could not be evaluated.
    PolicyEvaluationFailed,
    /// Policy rule denied the request.
    PolicyDenied,
    /// Budget above the organisation limit.
    BudgetExceeded,
    /// Too many starts in the window.
    RateLimitExceeded,
    /// Capability outside the allow-list.
    CapabilityDenied,
    /// Agent does not exist.
    AgentNotFound,
    /// Agent was invalidated.
    AgentInvalidated,
    /// A collaborator needed for the decision is unavailable.
    RuntimeUnavailable,
    /// An interceptor failed; treated as a veto.
    InterceptorError,
}

impl ErrorCode {
    /// Wire form of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProofMissing => "PROOF_MISSING",
            Self::SpecHashMismatch => "SPEC_HASH_MISMATCH",
            Self::PolicyHashMismatch => "POLICY_HASH_MISMATCH",
            Self::SignatureInvalid => "SIGNATURE_INVALID",
            Self::SignerRevoked => "SIGNER_REVOKED",
            Self::SandboxExpired => "SANDBOX_EXPIRED",
            Self::ContainmentViolation => "CONTAINMENT_VIOLATION",
            Self::PolicyEvaluationFailed => "POLICY_EVALUATION_FAILED",
            Self::PolicyDenied => "POLICY_DENIED",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::CapabilityDenied => "CAPABILITY_DENIED",
            Self::AgentNotFound => "AGENT_NOT_FOUND",
            Self::AgentInvalidated => "AGENT_INVALIDATED",
            Self::RuntimeUnavailable => "RUNTIME_UNAVAILABLE",
            Self::InterceptorError => "INTERCEPTOR_ERROR",
        }
    }

    /// Taxonomy group.
    pub fn group(&self) -> ErrorGroup {
        match self {
            Self::ProofMissing
            | Self::SpecHashMismatch
            | Self::PolicyHashMismatch
            | Self::SignatureInvalid
            | Self::SignerRevoked => ErrorGroup::Proof,
            Self::SandboxExpired | Self::ContainmentViolation => ErrorGroup::Sandbox,
            Self::PolicyEvaluationFailed | Self::PolicyDenied => ErrorGroup::Policy,
            Self::BudgetExceeded | Self::RateLimitExceeded | Self::CapabilityDenied => {
                ErrorGroup::Resource
            }
            Self::AgentNotFound
            | Self::AgentInvalidated
            | Self::RuntimeUnavailable
            | Self::InterceptorError => ErrorGroup::Runtime,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Actors
// ---------------------------------------------------------------------------

/// Role of the human or system actor behind an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    /// Read-only access.
    Viewer,
    /// May create and promote agents.
    AgentAdmin,
    /// May change policy.
    PolicyAdmin,
}

impl ActorRole {
    /// Wire form of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::AgentAdmin => "agent_admin",
            Self::PolicyAdmin => "policy_admin",
        }
    }
}

/// Actor performing a governance operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Actor identifier.
    pub id: String,
    /// Actor role.
    pub role: ActorRole,
}

impl Actor {
    /// Build an actor.
    pub fn new(id: impl Into<String>, role: ActorRole) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    /// Internal actor used by background reconciliation.
    pub fn system(component: &str) -> Self {
        Self::new(format!("system:{component}"), ActorRole::PolicyAdmin)
    }
}
