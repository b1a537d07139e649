//! Rule-based evaluation collects every violation with actionable detail.

use gatekeeper::policy::evaluator::{
    EvaluationSubject, PolicyEvaluator, PromotionContext, RuleBasedEvaluator, RuleId,
    ViolationDetail, BUDGET_FIELD, CAPABILITIES_FIELD, TEMPERATURE_FIELD,
};
use gatekeeper::types::{
    Actor, ActorRole, AgentSpec, Anatomy, Economics, ErrorCode, GovernanceConfig,
};

use crate::support::{anatomy, bundle, capabilities, sandbox_record, POLICY_SET};

fn governance(budget: f64, caps: &[&str]) -> GovernanceConfig {
    GovernanceConfig {
        policy_set: POLICY_SET.to_owned(),
        capabilities: capabilities(caps),
        economics: Economics {
            monthly_budget_usd: budget,
        },
        proof: None,
    }
}

fn admin() -> Actor {
    Actor::new("alice", ActorRole::AgentAdmin)
}

#[test]
fn budget_over_org_limit_is_denied_with_both_numbers() {
    let record = sandbox_record("agent-1");
    let gov = governance(5000.0, &["search_knowledge"]);
    let policy = bundle(1000.0);
    let actor = admin();
    let evaluation = RuleBasedEvaluator::new().evaluate(
        &EvaluationSubject::promotion(&record, &gov),
        &PromotionContext {
            actor: &actor,
            policy: &policy,
        },
    );

    assert!(!evaluation.allow);
    assert_eq!(evaluation.denies.len(), 1);
    let deny = &evaluation.denies[0];
    assert_eq!(deny.rule, RuleId::BudgetLimit);
    assert_eq!(deny.code, ErrorCode::BudgetExceeded);
    assert!(deny.message.contains("5000"), "message: {}", deny.message);
    assert!(deny.message.contains("1000"), "message: {}", deny.message);
    assert_eq!(
        deny.detail,
        ViolationDetail::OverLimit {
            field: BUDGET_FIELD.to_owned(),
            actual: 5000.0,
            limit: 1000.0,
        }
    );
}

#[test]
fn compliant_request_is_allowed() {
    let record = sandbox_record("agent-1");
    let gov = governance(500.0, &["search_knowledge", "summarize"]);
    let policy = bundle(1000.0);
    let actor = admin();
    let evaluation = RuleBasedEvaluator::new().evaluate(
        &EvaluationSubject::promotion(&record, &gov),
        &PromotionContext {
            actor: &actor,
            policy: &policy,
        },
    );
    assert!(evaluation.allow);
    assert!(evaluation.denies.is_empty());
}

#[test]
fn every_violation_is_collected() {
    let mut record = sandbox_record("agent-1");
    if let AgentSpec::Sandbox(spec) = &mut record.spec {
        spec.anatomy = Anatomy::default();
        spec.sandbox_constraints.external_calls = true;
    }
    let gov = governance(9000.0, &["launch_missiles"]);
    let policy = bundle(1000.0);
    let viewer = Actor::new("bob", ActorRole::Viewer);
    let evaluation = RuleBasedEvaluator::new().evaluate(
        &EvaluationSubject::promotion(&record, &gov),
        &PromotionContext {
            actor: &viewer,
            policy: &policy,
        },
    );

    let rules: Vec<RuleId> = evaluation.denies.iter().map(|d| d.rule).collect();
    assert_eq!(
        rules,
        vec![
            RuleId::ActorRole,
            RuleId::AnatomyPresent,
            RuleId::SandboxContainment,
            RuleId::CapabilityAllowList,
            RuleId::BudgetLimit,
        ]
    );
    assert_eq!(
        evaluation.error_codes(),
        vec![
            ErrorCode::PolicyDenied,
            ErrorCode::ContainmentViolation,
            ErrorCode::CapabilityDenied,
            ErrorCode::BudgetExceeded,
        ]
    );
    assert_eq!(evaluation.reasons().len(), 5);
}

#[test]
fn disallowed_capabilities_are_listed() {
    let record = sandbox_record("agent-1");
    let gov = governance(10.0, &["search_knowledge", "shell_exec", "wire_transfer"]);
    let policy = bundle(1000.0);
    let actor = admin();
    let evaluation = RuleBasedEvaluator::new().evaluate(
        &EvaluationSubject::promotion(&record, &gov),
        &PromotionContext {
            actor: &actor,
            policy: &policy,
        },
    );
    assert_eq!(
        evaluation.denies[0].detail,
        ViolationDetail::DisallowedValues {
            field: CAPABILITIES_FIELD.to_owned(),
            values: vec!["shell_exec".to_owned(), "wire_transfer".to_owned()],
        }
    );
}

#[test]
fn bundle_allow_list_overrides_evaluator_list() {
    let record = sandbox_record("agent-1");
    let gov = governance(10.0, &["shell_exec"]);
    let mut policy = bundle(1000.0);
    policy.allowed_capabilities = Some(capabilities(&["shell_exec"]));
    let actor = admin();
    let evaluation = RuleBasedEvaluator::new().evaluate(
        &EvaluationSubject::promotion(&record, &gov),
        &PromotionContext {
            actor: &actor,
            policy: &policy,
        },
    );
    assert!(evaluation.allow);
}

#[test]
fn compliance_agents_are_held_to_the_temperature_ceiling() {
    let mut record = sandbox_record("agent-1");
    if let AgentSpec::Sandbox(spec) = &mut record.spec {
        let mut hot = anatomy();
        hot.role_class = Some("compliance".to_owned());
        if let Some(reasoning) = hot.reasoning.as_mut() {
            reasoning.temperature = Some(0.9);
        }
        spec.anatomy = hot;
    }
    let gov = governance(10.0, &[]);
    let policy = bundle(1000.0);
    let actor = admin();
    let evaluation = RuleBasedEvaluator::new().evaluate(
        &EvaluationSubject::promotion(&record, &gov),
        &PromotionContext {
            actor: &actor,
            policy: &policy,
        },
    );
    assert_eq!(evaluation.denies.len(), 1);
    assert_eq!(evaluation.denies[0].rule, RuleId::ComplianceTemperature);
    assert_eq!(
        evaluation.denies[0].detail,
        ViolationDetail::OverLimit {
            field: TEMPERATURE_FIELD.to_owned(),
            actual: 0.9,
            limit: 0.3,
        }
    );
}
