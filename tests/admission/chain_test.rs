//! Chain semantics: ordered, fail-closed, first deny wins.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proptest::prelude::*;

use gatekeeper::admission::{
    AdmissionContext, Interceptor, InterceptorChain, InterceptorDecision, InterceptorError,
    RateLimitInterceptor, SandboxValidator,
};
use gatekeeper::config::AdmissionConfig;
use gatekeeper::admission::standard_chain;
use gatekeeper::proof::ProofVerifier;
use gatekeeper::types::{AgentRecord, AgentSpec, ErrorCode};

use crate::support::{attestor, sandbox_record, t0};

fn ctx(agent: AgentRecord) -> AdmissionContext {
    AdmissionContext {
        agent,
        snapshot: None,
        spec_hash: "sha256:unused".to_owned(),
        now: t0(),
    }
}

/// Counts calls and returns a fixed decision.
struct Spy {
    name: &'static str,
    calls: AtomicUsize,
    decision: InterceptorDecision,
}

impl Spy {
    fn new(name: &'static str, decision: InterceptorDecision) -> Arc<Self> {
        Arc::new(Self {
            name,
            calls: AtomicUsize::new(0),
            decision,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Interceptor for Spy {
    fn name(&self) -> &str {
        self.name
    }

    fn execute(&self, _ctx: &AdmissionContext) -> Result<InterceptorDecision, InterceptorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.decision.clone())
    }
}

struct Failing;

impl Interceptor for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    fn execute(&self, _ctx: &AdmissionContext) -> Result<InterceptorDecision, InterceptorError> {
        Err(InterceptorError::Failed("backend timed out".to_owned()))
    }
}

struct Panicking;

impl Interceptor for Panicking {
    fn name(&self) -> &str {
        "panicking"
    }

    fn execute(&self, _ctx: &AdmissionContext) -> Result<InterceptorDecision, InterceptorError> {
        panic!("interceptor bug");
    }
}

#[test]
fn erroring_interceptor_fails_closed() {
    let after = Spy::new("after", InterceptorDecision::allow());
    let chain = InterceptorChain::new()
        .with(Arc::new(Failing))
        .with(after.clone());
    let decision = chain.run(&ctx(sandbox_record("agent-1")));
    assert!(decision.deny);
    assert!(!decision.allow);
    assert!(decision.has_code(ErrorCode::InterceptorError));
    assert!(!decision.reasons.is_empty());
    assert_eq!(after.calls(), 0);
}

#[test]
fn panicking_interceptor_fails_closed() {
    let chain = InterceptorChain::new().with(Arc::new(Panicking));
    let decision = chain.run(&ctx(sandbox_record("agent-1")));
    assert!(decision.deny);
    assert!(decision.has_code(ErrorCode::InterceptorError));
}

#[test]
fn first_deny_short_circuits() {
    let first = Spy::new("first", InterceptorDecision::allow());
    let veto = Spy::new(
        "veto",
        InterceptorDecision::deny(ErrorCode::PolicyDenied, "no"),
    );
    let last = Spy::new("last", InterceptorDecision::allow());
    let chain = InterceptorChain::new()
        .with(first.clone())
        .with(veto.clone())
        .with(last.clone());

    let decision = chain.run(&ctx(sandbox_record("agent-1")));
    assert!(decision.deny);
    assert_eq!(decision.reasons, vec!["no".to_owned()]);
    assert_eq!((first.calls(), veto.calls(), last.calls()), (1, 1, 0));
    assert_eq!(chain.names(), vec!["first", "veto", "last"]);
}

#[test]
fn undecided_interceptor_is_a_deny() {
    let undecided = InterceptorDecision {
        allow: false,
        deny: false,
        restrict: false,
        reasons: Vec::new(),
        error_codes: Vec::new(),
    };
    let chain = InterceptorChain::new().with(Spy::new("undecided", undecided));
    let decision = chain.run(&ctx(sandbox_record("agent-1")));
    assert!(decision.deny);
    assert!(decision.has_code(ErrorCode::InterceptorError));
}

#[test]
fn bare_deny_still_carries_reason_and_code() {
    let bare = InterceptorDecision {
        allow: false,
        deny: true,
        restrict: false,
        reasons: Vec::new(),
        error_codes: Vec::new(),
    };
    let chain = InterceptorChain::new().with(Spy::new("terse", bare));
    let decision = chain.run(&ctx(sandbox_record("agent-1")));
    assert!(decision.deny);
    assert!(!decision.reasons.is_empty());
    assert!(!decision.error_codes.is_empty());
}

#[test]
fn empty_chain_denies() {
    let decision = InterceptorChain::new().run(&ctx(sandbox_record("agent-1")));
    assert!(decision.deny);
    assert!(decision.has_code(ErrorCode::InterceptorError));
}

#[test]
fn advisories_turn_allow_into_restrict() {
    let chain = InterceptorChain::new()
        .with(Spy::new("quiet", InterceptorDecision::allow()))
        .with(Spy::new("noisy", InterceptorDecision::advisory("watch this")));
    let decision = chain.run(&ctx(sandbox_record("agent-1")));
    assert!(decision.allow);
    assert!(decision.restrict);
    assert_eq!(decision.reasons, vec!["watch this".to_owned()]);

    let clean = InterceptorChain::new()
        .with(Spy::new("quiet", InterceptorDecision::allow()))
        .run(&ctx(sandbox_record("agent-1")));
    assert!(clean.allow);
    assert!(!clean.restrict);
}

#[test]
fn standard_chain_order() {
    let verifier = ProofVerifier::new(attestor().keyring());
    let chain = standard_chain(verifier.clone(), &AdmissionConfig::default());
    assert_eq!(chain.names(), vec!["sandbox_validator", "governed_validator"]);

    let limited = AdmissionConfig {
        max_starts_per_window: 3,
        ..AdmissionConfig::default()
    };
    let chain = standard_chain(verifier, &limited);
    assert_eq!(
        chain.names(),
        vec!["sandbox_validator", "governed_validator", "rate_limiter"]
    );
}

fn start_at(limiter: &RateLimitInterceptor, id: &str, offset_secs: i64) -> InterceptorDecision {
    let mut context = ctx(sandbox_record(id));
    context.now = t0() + chrono::Duration::seconds(offset_secs);
    limiter.execute(&context).expect("limiter available")
}

#[test]
fn rate_window_slides_on_the_admission_clock() {
    let limiter = RateLimitInterceptor::new(60, 2);
    assert!(start_at(&limiter, "agent-1", 0).allow);
    assert!(start_at(&limiter, "agent-1", 30).allow);
    assert!(start_at(&limiter, "agent-1", 59).deny);
    // The first start has aged out.
    assert!(start_at(&limiter, "agent-1", 61).allow);
    assert!(start_at(&limiter, "agent-1", 62).deny);
}

#[test]
fn oversized_rate_window_keeps_every_start() {
    let limiter = RateLimitInterceptor::new(u64::MAX, 2);
    assert!(start_at(&limiter, "agent-1", 0).allow);
    assert!(start_at(&limiter, "agent-1", 1).allow);
    let third = start_at(&limiter, "agent-1", 2);
    assert!(third.deny);
    assert!(third.has_code(ErrorCode::RateLimitExceeded));
}

#[test]
fn idle_agents_are_dropped_from_the_limiter() {
    let limiter = RateLimitInterceptor::new(60, 5);
    start_at(&limiter, "agent-1", 0);
    start_at(&limiter, "agent-2", 0);
    assert_eq!(limiter.tracked_agents(), 2);
    start_at(&limiter, "agent-3", 120);
    assert_eq!(limiter.tracked_agents(), 1);
}

proptest! {
    #[test]
    fn external_calls_are_always_contained(
        persistent_writes in any::<bool>(),
        expiry_hours in 0u32..500,
        offset_hours in -100i64..100,
    ) {
        let mut record = sandbox_record("agent-1");
        if let AgentSpec::Sandbox(spec) = &mut record.spec {
            spec.sandbox_constraints.external_calls = true;
            spec.sandbox_constraints.persistent_writes = persistent_writes;
            spec.sandbox_constraints.auto_expiry_hours = expiry_hours;
        }
        let mut context = ctx(record);
        context.now = t0() + chrono::Duration::hours(offset_hours);

        let chain = InterceptorChain::new().with(Arc::new(SandboxValidator::new(24)));
        let decision = chain.run(&context);
        prop_assert!(decision.deny);
        prop_assert!(decision.has_code(ErrorCode::ContainmentViolation));
    }
}
