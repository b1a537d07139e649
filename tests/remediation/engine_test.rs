//! Applying plans: blast radius, dry runs, approval and re-attestation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use gatekeeper::audit::metrics::Counter;
use gatekeeper::audit::{DecisionCode, GovernanceLogger};
use gatekeeper::drift::{DriftReport, DriftType};
use gatekeeper::governance::GovernanceSettings;
use gatekeeper::policy::RuleBasedEvaluator;
use gatekeeper::proof::canonical::spec_hash;
use gatekeeper::remediation::{
    generate_remediation_plan, ActionStatus, ApplyOptions, BatchOptions, RemediationEngine,
    RemediationError,
};
use gatekeeper::store::memory::MemoryAgentStore;
use gatekeeper::store::{AgentStore, StoreError};
use gatekeeper::types::{AgentRecord, AgentSpec, Anatomy, GovernanceStatus, PolicyDecision};

use crate::support::{
    attestor, bundle, capabilities, governed_record, governed_with, t0, Harness,
};

fn harness() -> Harness {
    // Reconciliation stays out of the way; these tests drive the engine.
    Harness::new(GovernanceSettings {
        auto_reconcile: false,
        ..GovernanceSettings::default()
    })
}

fn budget_of(spec: &AgentSpec) -> f64 {
    match spec {
        AgentSpec::Governed(governed) => governed.governance.economics.monthly_budget_usd,
        AgentSpec::Sandbox(_) => 0.0,
    }
}

async fn drift_for(h: &Harness, agent_id: &str) -> DriftReport {
    h.service
        .detector()
        .detect_agent(agent_id, t0())
        .await
        .expect("readable")
        .expect("drifted")
}

/// Agents approved at a 1000 budget, then the limit drops to 100.
async fn over_budget_agents(h: &Harness, ids: &[&str]) -> Vec<DriftReport> {
    let original = h.load(bundle(1000.0)).await;
    for id in ids {
        h.insert(&governed_record(id, 500.0, &original)).await;
    }
    h.load(bundle(100.0)).await;
    let mut drifts = Vec::new();
    for id in ids {
        drifts.push(drift_for(h, id).await);
    }
    drifts
}

#[tokio::test]
async fn oversized_batch_touches_nothing() {
    let h = harness();
    let drifts = over_budget_agents(&h, &["agent-1", "agent-2", "agent-3"]).await;
    let before = records(&h, &["agent-1", "agent-2", "agent-3"]).await;

    let err = h
        .service
        .remediation()
        .batch_remediation(
            &drifts,
            BatchOptions {
                max_blast_radius: 2,
                apply: ApplyOptions::default(),
            },
        )
        .await
        .expect_err("over blast radius");
    assert!(matches!(
        err,
        RemediationError::BlastRadiusExceeded { count: 3, max: 2 }
    ));

    let after = records(&h, &["agent-1", "agent-2", "agent-3"]).await;
    assert_eq!(before, after);
    assert_eq!(h.metrics.get(Counter::RemediationApplied), 0);
    assert_eq!(h.audit.count(DecisionCode::RemediationApplied), 0);
}

async fn records(h: &Harness, ids: &[&str]) -> Vec<gatekeeper::types::AgentRecord> {
    let mut records = Vec::new();
    for id in ids {
        records.push(h.record(id).await);
    }
    records
}

#[tokio::test]
async fn batch_within_radius_remediates_each_agent() {
    let h = harness();
    let drifts = over_budget_agents(&h, &["agent-1", "agent-2"]).await;
    let batch = h
        .service
        .remediation()
        .batch_remediation(
            &drifts,
            BatchOptions {
                max_blast_radius: 2,
                apply: ApplyOptions::default(),
            },
        )
        .await
        .expect("batch");
    assert_eq!(batch.results.len(), 2);
    assert!(batch.rejected.is_empty());
    for id in ["agent-1", "agent-2"] {
        assert_eq!(budget_of(&h.record(id).await.spec), 100.0);
    }
    assert_eq!(h.metrics.get(Counter::RemediationApplied), 2);
}

#[tokio::test]
async fn safe_plan_lowers_budget_and_reattests() {
    let h = harness();
    let drift = over_budget_agents(&h, &["agent-1"]).await.remove(0);
    let plan = generate_remediation_plan(&drift).expect("plan");
    assert!(plan.is_safe());

    let result = h
        .service
        .remediation()
        .apply_at(&plan, ApplyOptions::default(), t0())
        .await
        .expect("applied");
    assert_eq!(result.applied_count(), 1);
    assert_eq!(result.failed_count(), 0);
    assert!(result.reattested);
    assert_eq!(result.new_status, Some(GovernanceStatus::GovernedValid));

    let record = h.record("agent-1").await;
    assert_eq!(budget_of(&record.spec), 100.0);
    assert_eq!(record.status, GovernanceStatus::GovernedValid);
    let snapshot = h.registry.get_snapshot(&plan.policy_set).expect("snapshot");
    let proof = record.proof().expect("proof");
    assert_eq!(proof.policy_hash, snapshot.hash);
    assert_eq!(proof.policy_decision, PolicyDecision::Pass);

    // The new proof admits the agent and nothing is left to detect.
    assert!(h.service.check_admission_at("agent-1", t0()).await.allow);
    assert!(h
        .service
        .detector()
        .detect_agent("agent-1", t0())
        .await
        .expect("readable")
        .is_none());
    assert_eq!(h.audit.count(DecisionCode::ProofReattested), 1);
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let h = harness();
    let drift = over_budget_agents(&h, &["agent-1"]).await.remove(0);
    let plan = generate_remediation_plan(&drift).expect("plan");
    let before = h.record("agent-1").await;

    let result = h
        .service
        .remediation()
        .apply_at(
            &plan,
            ApplyOptions {
                dry_run: true,
                force: false,
            },
            t0(),
        )
        .await
        .expect("validated");
    assert!(result.dry_run);
    assert_eq!(result.outcomes[0].status, ActionStatus::WouldApply);
    assert_eq!(result.applied_count(), 0);
    assert!(!result.reattested);
    assert_eq!(h.record("agent-1").await, before);
}

#[tokio::test]
async fn unsafe_plan_requires_force_and_still_skips_manual_steps() {
    let h = harness();
    let original = h.load(bundle(1000.0)).await;
    let mut record = governed_record("agent-1", 500.0, &original);
    if let AgentSpec::Governed(spec) = &mut record.spec {
        spec.governance.economics.monthly_budget_usd = 1.0;
    }
    h.insert(&record).await;
    let drift = drift_for(&h, "agent-1").await;
    let plan = generate_remediation_plan(&drift).expect("plan");
    assert!(plan.requires_approval);

    let err = h
        .service
        .remediation()
        .apply_at(&plan, ApplyOptions::default(), t0())
        .await
        .expect_err("needs approval");
    assert!(matches!(err, RemediationError::ApprovalRequired { .. }));

    let forced = h
        .service
        .remediation()
        .apply_at(
            &plan,
            ApplyOptions {
                dry_run: false,
                force: true,
            },
            t0(),
        )
        .await
        .expect("forced");
    assert_eq!(forced.outcomes[0].status, ActionStatus::Skipped);
    assert!(!forced.reattested);
    assert_eq!(h.record("agent-1").await, record);
}

#[tokio::test]
async fn remaining_violations_leave_agent_restricted() {
    let h = harness();
    let original = h.load(bundle(1000.0)).await;
    // Empty anatomy has no automatic fix.
    h.insert(&governed_with(
        "agent-1",
        Anatomy::default(),
        500.0,
        capabilities(&["search_knowledge"]),
        &original,
    ))
    .await;
    h.load(bundle(100.0)).await;
    let plan = generate_remediation_plan(&drift_for(&h, "agent-1").await).expect("plan");

    let result = h
        .service
        .remediation()
        .apply_at(
            &plan,
            ApplyOptions {
                dry_run: false,
                force: true,
            },
            t0(),
        )
        .await
        .expect("forced");
    assert_eq!(result.applied_count(), 1);
    assert_eq!(result.new_status, Some(GovernanceStatus::GovernedRestricted));

    let record = h.record("agent-1").await;
    assert_eq!(record.status, GovernanceStatus::GovernedRestricted);
    assert_eq!(
        record.proof().expect("proof").policy_decision,
        PolicyDecision::Fail
    );
}

#[tokio::test]
async fn disallowed_capabilities_are_removed() {
    let h = harness();
    let original = h.load(bundle(1000.0)).await;
    h.insert(&governed_with(
        "agent-1",
        crate::support::anatomy(),
        50.0,
        capabilities(&["search_knowledge", "summarize"]),
        &original,
    ))
    .await;
    let mut narrowed = bundle(1000.0);
    narrowed.allowed_capabilities = Some(capabilities(&["search_knowledge"]));
    h.load(narrowed).await;

    let result = h
        .service
        .remediate(
            "agent-1",
            ApplyOptions {
                dry_run: false,
                force: false,
            },
        )
        .await
        .expect("remediated");
    assert_eq!(result.applied_count(), 1);

    let record = h.record("agent-1").await;
    assert_eq!(
        record.governance().expect("governed").capabilities,
        capabilities(&["search_knowledge"])
    );
    assert_eq!(record.status, GovernanceStatus::GovernedValid);
}

#[tokio::test]
async fn compliant_agent_has_nothing_to_do() {
    let h = harness();
    let snapshot = h.load(bundle(1000.0)).await;
    h.insert(&governed_record("agent-1", 500.0, &snapshot)).await;
    let result = h
        .service
        .remediate("agent-1", ApplyOptions::default())
        .await
        .expect("ok");
    assert!(result.outcomes.is_empty());
    assert!(!result.reattested);
}

/// Delegates to the harness store but fails the `fail_on`-th save.
struct FailNthSave {
    inner: Arc<MemoryAgentStore>,
    saves: AtomicUsize,
    fail_on: usize,
}

#[async_trait]
impl AgentStore for FailNthSave {
    async fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>, StoreError> {
        self.inner.get(agent_id).await
    }

    async fn save(&self, record: &AgentRecord) -> Result<(), StoreError> {
        let n = self.saves.fetch_add(1, Ordering::SeqCst);
        if n.checked_add(1) == Some(self.fail_on) {
            return Err(StoreError::Unavailable("disk full".to_owned()));
        }
        self.inner.save(record).await
    }

    async fn update_status(
        &self,
        agent_id: &str,
        status: GovernanceStatus,
        reason: &str,
    ) -> Result<(), StoreError> {
        self.inner.update_status(agent_id, status, reason).await
    }

    async fn list_governed(&self) -> Result<Vec<AgentRecord>, StoreError> {
        self.inner.list_governed().await
    }
}

fn engine_failing_save(h: &Harness, fail_on: usize) -> RemediationEngine {
    let store = Arc::new(FailNthSave {
        inner: Arc::clone(&h.agents),
        saves: AtomicUsize::new(0),
        fail_on,
    });
    RemediationEngine::new(
        store,
        Arc::clone(&h.registry),
        Arc::new(RuleBasedEvaluator::new()),
        attestor(),
        Arc::new(GovernanceLogger::new(h.audit.clone())),
        Arc::clone(&h.metrics),
    )
}

/// The stored proof binds exactly the stored spec.
fn assert_consistent(record: &AgentRecord) {
    let hash = spec_hash(&record.spec).expect("hash");
    assert_eq!(record.proof().expect("proof").spec_hash, hash);
}

/// Over budget and holding a capability the new policy disallows.
async fn doubly_drifted(h: &Harness) -> DriftReport {
    let original = h.load(bundle(1000.0)).await;
    h.insert(&governed_with(
        "agent-1",
        crate::support::anatomy(),
        500.0,
        capabilities(&["search_knowledge", "summarize"]),
        &original,
    ))
    .await;
    let mut narrowed = bundle(100.0);
    narrowed.allowed_capabilities = Some(capabilities(&["search_knowledge"]));
    h.load(narrowed).await;
    drift_for(h, "agent-1").await
}

#[tokio::test]
async fn failed_action_keeps_earlier_actions_and_a_matching_proof() {
    let h = harness();
    let drift = doubly_drifted(&h).await;
    let plan = generate_remediation_plan(&drift).expect("plan");
    assert_eq!(plan.actions.len(), 2);
    assert!(plan.is_safe());

    let result = engine_failing_save(&h, 2)
        .apply_at(&plan, ApplyOptions::default(), t0())
        .await
        .expect("failures are reported, not raised");
    let statuses: Vec<_> = result.outcomes.iter().map(|o| o.status).collect();
    assert_eq!(statuses, vec![ActionStatus::Applied, ActionStatus::Failed]);
    assert!(result.outcomes[1]
        .message
        .as_deref()
        .is_some_and(|m| m.contains("disk full")));
    assert!(result.reattested);
    assert_eq!(result.new_status, Some(GovernanceStatus::GovernedRestricted));

    // First action stays applied and its proof matches the stored spec.
    let record = h.record("agent-1").await;
    assert_consistent(&record);
    assert_eq!(record.status, GovernanceStatus::GovernedRestricted);
    assert_eq!(
        record.proof().expect("proof").policy_decision,
        PolicyDecision::Fail
    );
    let remaining = drift_for(&h, "agent-1").await;
    assert_eq!(remaining.drift_type, DriftType::PolicyChange);
    assert_eq!(h.metrics.get(Counter::RemediationApplied), 1);
    assert_eq!(h.metrics.get(Counter::RemediationFailed), 1);
}

#[tokio::test]
async fn failed_save_never_looks_like_tampering() {
    let h = harness();
    let drift = over_budget_agents(&h, &["agent-1"]).await.remove(0);
    let plan = generate_remediation_plan(&drift).expect("plan");
    let before = h.record("agent-1").await;

    let result = engine_failing_save(&h, 1)
        .apply_at(&plan, ApplyOptions::default(), t0())
        .await
        .expect("failures are reported, not raised");
    assert_eq!(result.outcomes[0].status, ActionStatus::Failed);
    assert!(!result.reattested);

    assert_eq!(h.record("agent-1").await, before);
    let drift = drift_for(&h, "agent-1").await;
    assert_eq!(drift.drift_type, DriftType::PolicyChange);
}
