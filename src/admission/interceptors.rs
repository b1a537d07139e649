//! Built-in validators for the two agent modes.

use chrono::{Duration, SecondsFormat};

use super::{AdmissionContext, Interceptor, InterceptorDecision, InterceptorError};
use crate::proof::ProofVerifier;
use crate::types::{AgentSpec, ErrorCode};

/// Name of [`SandboxValidator`].
pub const SANDBOX_VALIDATOR: &str = "sandbox_validator";
/// Name of [`GovernedValidator`].
pub const GOVERNED_VALIDATOR: &str = "governed_validator";

/// Enforces sandbox lifetime and containment. Governed agents pass through.
#[derive(Debug, Clone)]
pub struct SandboxValidator {
    expiry_warning: Duration,
}

impl SandboxValidator {
    /// Warn when a sandbox expires within `expiry_warning_hours`.
    pub fn new(expiry_warning_hours: u32) -> Self {
        Self {
            expiry_warning: Duration::hours(i64::from(expiry_warning_hours)),
        }
    }
}

impl Default for SandboxValidator {
    fn default() -> Self {
        Self::new(24)
    }
}

impl Interceptor for SandboxValidator {
    fn name(&self) -> &str {
        SANDBOX_VALIDATOR
    }

    fn execute(&self, ctx: &AdmissionContext) -> Result<InterceptorDecision, InterceptorError> {
        let AgentSpec::Sandbox(spec) = &ctx.agent.spec else {
            return Ok(InterceptorDecision::allow());
        };

        let mut failures = Vec::new();
        if let Some(expires_at) = ctx.agent.expires_at.filter(|at| *at < ctx.now) {
            failures.push((
                ErrorCode::SandboxExpired,
                format!(
                    "sandbox expired at {}",
                    expires_at.to_rfc3339_opts(SecondsFormat::Secs, true)
                ),
            ));
        }
        if spec.sandbox_constraints.external_calls {
            failures.push((
                ErrorCode::ContainmentViolation,
                "sandbox agents may not make external calls".to_owned(),
            ));
        }
        if spec.sandbox_constraints.persistent_writes {
            failures.push((
                ErrorCode::ContainmentViolation,
                "sandbox agents may not perform persistent writes".to_owned(),
            ));
        }
        if !failures.is_empty() {
            return Ok(InterceptorDecision::deny_all(failures));
        }

        let Some(expires_at) = ctx.agent.expires_at else {
            return Ok(InterceptorDecision::advisory("sandbox has no expiry set"));
        };
        let warn_after = ctx.now.checked_add_signed(self.expiry_warning);
        if warn_after.is_some_and(|w| expires_at <= w) {
            return Ok(InterceptorDecision::advisory(format!(
                "sandbox expires soon ({})",
                expires_at.to_rfc3339_opts(SecondsFormat::Secs, true)
            )));
        }
        Ok(InterceptorDecision::allow())
    }
}

/// Verifies the proof of a governed agent against the live snapshot.
/// Sandbox agents pass through.
#[derive(Debug, Clone)]
pub struct GovernedValidator {
    verifier: ProofVerifier,
}

impl GovernedValidator {
    /// Validator using `verifier`.
    pub fn new(verifier: ProofVerifier) -> Self {
        Self { verifier }
    }
}

impl Interceptor for GovernedValidator {
    fn name(&self) -> &str {
        GOVERNED_VALIDATOR
    }

    fn execute(&self, ctx: &AdmissionContext) -> Result<InterceptorDecision, InterceptorError> {
        let AgentSpec::Governed(spec) = &ctx.agent.spec else {
            return Ok(InterceptorDecision::allow());
        };

        let Some(proof) = &spec.governance.proof else {
            return Ok(InterceptorDecision::deny(
                ErrorCode::ProofMissing,
                format!("governed agent '{}' has no proof bundle", ctx.agent.id),
            ));
        };
        let Some(snapshot) = &ctx.snapshot else {
            return Ok(InterceptorDecision::deny(
                ErrorCode::PolicyEvaluationFailed,
                format!(
                    "no policy is loaded for policy set '{}'",
                    spec.governance.policy_set
                ),
            ));
        };

        let mut failures = Vec::new();
        if let Some(invalidation) = snapshot.invalidation(&ctx.agent.id) {
            failures.push((
                ErrorCode::AgentInvalidated,
                format!("agent was invalidated: {}", invalidation.reason),
            ));
        }
        let result = self.verifier.verify(
            proof,
            &snapshot.hash,
            &ctx.spec_hash,
            &snapshot.revoked_signers,
        );
        for check in &result.failed_checks {
            failures.push((check.error_code(), check.describe(proof)));
        }
        if !failures.is_empty() {
            return Ok(InterceptorDecision::deny_all(failures));
        }

        if ctx.agent.is_expired_at(ctx.now) {
            return Ok(InterceptorDecision::advisory(
                "governance approval has expired; agent runs restricted until renewed",
            ));
        }
        Ok(InterceptorDecision::allow())
    }
}
