//! Admission control.
//!
//! An [`InterceptorChain`] runs registered [`Interceptor`]s in order over one
//! immutable [`AdmissionContext`]. The first deny is terminal. An interceptor
//! that errors or panics is a deny with [`ErrorCode::InterceptorError`], never
//! "no opinion". Advisory reasons from interceptors that allowed turn the
//! final allow into a restricted allow.

pub mod controller;
pub mod interceptors;
pub mod rate_limit;
pub mod status;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::policy::PolicySnapshot;
use crate::types::{AgentRecord, ErrorCode};

pub use self::controller::{standard_chain, AdmissionController};
pub use self::interceptors::{GovernedValidator, SandboxValidator};
pub use self::rate_limit::RateLimitInterceptor;
pub use self::status::derive_status;

/// Outcome of one interceptor or of the whole chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterceptorDecision {
    /// The agent may start.
    pub allow: bool,
    /// The agent must not start. Terminal.
    pub deny: bool,
    /// The agent may start, with advisories.
    pub restrict: bool,
    /// Human-readable reasons, in the order produced.
    pub reasons: Vec<String>,
    /// Machine-readable codes, in the order produced.
    pub error_codes: Vec<ErrorCode>,
}

impl InterceptorDecision {
    /// Plain allow with no advisories.
    pub fn allow() -> Self {
        Self {
            allow: true,
            deny: false,
            restrict: false,
            reasons: Vec::new(),
            error_codes: Vec::new(),
        }
    }

    /// Allow carrying one advisory reason.
    pub fn advisory(reason: impl Into<String>) -> Self {
        Self {
            allow: true,
            deny: false,
            restrict: true,
            reasons: vec![reason.into()],
            error_codes: Vec::new(),
        }
    }

    /// Deny with one reason and code.
    pub fn deny(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            deny: true,
            restrict: false,
            reasons: vec![reason.into()],
            error_codes: vec![code],
        }
    }

    /// Deny with several `(code, reason)` pairs. Empty input is still a deny.
    pub fn deny_all(failures: Vec<(ErrorCode, String)>) -> Self {
        if failures.is_empty() {
            return Self::deny(ErrorCode::PolicyDenied, "denied without a stated reason");
        }
        let mut decision = Self {
            allow: false,
            deny: true,
            restrict: false,
            reasons: Vec::with_capacity(failures.len()),
            error_codes: Vec::with_capacity(failures.len()),
        };
        for (code, reason) in failures {
            decision.reasons.push(reason);
            if !decision.error_codes.contains(&code) {
                decision.error_codes.push(code);
            }
        }
        decision
    }

    /// Whether any code in `self` is `code`.
    pub fn has_code(&self, code: ErrorCode) -> bool {
        self.error_codes.contains(&code)
    }
}

/// Everything an interceptor may look at. Built before the chain runs; no IO
/// happens inside the chain.
#[derive(Debug, Clone)]
pub struct AdmissionContext {
    /// Agent requesting admission.
    pub agent: AgentRecord,
    /// Snapshot of the agent's policy set, if governed and loaded.
    pub snapshot: Option<Arc<PolicySnapshot>>,
    /// Spec hash recomputed from the live record.
    pub spec_hash: String,
    /// Decision time.
    pub now: DateTime<Utc>,
}

/// Errors an interceptor may return. Always converted to a deny.
#[derive(Debug, thiserror::Error)]
pub enum InterceptorError {
    /// Interceptor could not reach a decision.
    #[error("{0}")]
    Failed(String),
    /// Interceptor state is unusable.
    #[error("interceptor state unavailable: {0}")]
    Unavailable(String),
}

/// One admission check.
pub trait Interceptor: Send + Sync {
    /// Name used in logs and error reasons.
    fn name(&self) -> &str;

    /// Decide on `ctx`.
    ///
    /// # Errors
    ///
    /// Any error is treated by the chain as a deny.
    fn execute(&self, ctx: &AdmissionContext) -> Result<InterceptorDecision, InterceptorError>;
}

/// Ordered, fail-closed interceptor pipeline.
#[derive(Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.interceptors.iter().map(|i| i.name().to_owned()))
            .finish()
    }
}

impl InterceptorChain {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `interceptor`; it runs after everything registered before it.
    pub fn register(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.register(interceptor);
        self
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Run the chain once.
    pub fn run(&self, ctx: &AdmissionContext) -> InterceptorDecision {
        if self.interceptors.is_empty() {
            return InterceptorDecision::deny(
                ErrorCode::InterceptorError,
                "no admission interceptors are registered",
            );
        }

        let mut reasons = Vec::new();
        let mut error_codes: Vec<ErrorCode> = Vec::new();

        for interceptor in &self.interceptors {
            let decision = invoke(interceptor.as_ref(), ctx);
            reasons.extend(decision.reasons);
            for code in decision.error_codes {
                if !error_codes.contains(&code) {
                    error_codes.push(code);
                }
            }

            if decision.deny {
                debug!(
                    agent_id = %ctx.agent.id,
                    interceptor = interceptor.name(),
                    "admission vetoed"
                );
                if reasons.is_empty() {
                    reasons.push(format!("denied by {}", interceptor.name()));
                }
                if error_codes.is_empty() {
                    error_codes.push(ErrorCode::PolicyDenied);
                }
                return InterceptorDecision {
                    allow: false,
                    deny: true,
                    restrict: false,
                    reasons,
                    error_codes,
                };
            }
        }

        let restrict = !reasons.is_empty();
        InterceptorDecision {
            allow: true,
            deny: false,
            restrict,
            reasons,
            error_codes,
        }
    }
}

fn invoke(interceptor: &dyn Interceptor, ctx: &AdmissionContext) -> InterceptorDecision {
    let name = interceptor.name();
    match catch_unwind(AssertUnwindSafe(|| interceptor.execute(ctx))) {
        Ok(Ok(decision)) if decision.allow || decision.deny => decision,
        Ok(Ok(_)) => InterceptorDecision::deny(
            ErrorCode::InterceptorError,
            format!("interceptor '{name}' returned neither allow nor deny"),
        ),
        Ok(Err(e)) => {
            warn!(interceptor = name, error = %e, "interceptor failed");
            InterceptorDecision::deny(
                ErrorCode::InterceptorError,
                format!("interceptor '{name}' failed: {e}"),
            )
        }
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());
            warn!(interceptor = name, panic = %message, "interceptor panicked");
            InterceptorDecision::deny(
                ErrorCode::InterceptorError,
                format!("interceptor '{name}' panicked: {message}"),
            )
        }
    }
}
