//! Plans narrow scope automatically and escalate everything else.

use serde_json::json;

use gatekeeper::drift::{DriftReport, DriftType, RecommendedAction, Severity};
use gatekeeper::policy::evaluator::{
    PolicyViolation, RuleId, ViolationDetail, BUDGET_FIELD, CAPABILITIES_FIELD, TEMPERATURE_FIELD,
};
use gatekeeper::remediation::{generate_remediation_plan, ActionType, BlastRadius};
use gatekeeper::types::ErrorCode;

fn report(drift_type: DriftType, violations: Vec<PolicyViolation>) -> DriftReport {
    DriftReport {
        agent_id: "agent-1".to_owned(),
        policy_set: "ws1".to_owned(),
        drift_type,
        severity: Severity::High,
        details: "drifted".to_owned(),
        violations,
        recommended_action: RecommendedAction::AutoRemediate,
    }
}

fn over_budget() -> PolicyViolation {
    PolicyViolation {
        rule: RuleId::BudgetLimit,
        code: ErrorCode::BudgetExceeded,
        message: "monthly budget $5000 exceeds organisation limit $1000".to_owned(),
        detail: ViolationDetail::OverLimit {
            field: BUDGET_FIELD.to_owned(),
            actual: 5000.0,
            limit: 1000.0,
        },
    }
}

fn disallowed() -> PolicyViolation {
    PolicyViolation {
        rule: RuleId::CapabilityAllowList,
        code: ErrorCode::CapabilityDenied,
        message: "capabilities not on the allow-list: shell_exec".to_owned(),
        detail: ViolationDetail::DisallowedValues {
            field: CAPABILITIES_FIELD.to_owned(),
            values: vec!["shell_exec".to_owned()],
        },
    }
}

fn too_hot() -> PolicyViolation {
    PolicyViolation {
        rule: RuleId::ComplianceTemperature,
        code: ErrorCode::PolicyDenied,
        message: "compliance agents require temperature <= 0.3, got 0.9".to_owned(),
        detail: ViolationDetail::OverLimit {
            field: TEMPERATURE_FIELD.to_owned(),
            actual: 0.9,
            limit: 0.3,
        },
    }
}

#[test]
fn budget_violation_becomes_a_safe_lower_limit() {
    let plan = generate_remediation_plan(&report(DriftType::PolicyChange, vec![over_budget()]))
        .expect("plan");
    assert!(plan.is_safe());
    assert!(!plan.requires_approval);
    assert_eq!(plan.blast_radius, BlastRadius::Low);
    assert_eq!(plan.actions.len(), 1);

    let action = &plan.actions[0];
    assert_eq!(action.action_type, ActionType::LowerLimit);
    assert_eq!(action.field, BUDGET_FIELD);
    assert_eq!(action.old_value, json!(5000.0));
    assert_eq!(action.new_value, json!(1000.0));
    assert!(action.safe);
}

#[test]
fn three_safe_actions_are_medium_radius() {
    let plan = generate_remediation_plan(&report(
        DriftType::PolicyChange,
        vec![disallowed(), too_hot(), over_budget()],
    ))
    .expect("plan");
    assert!(plan.is_safe());
    assert_eq!(plan.blast_radius, BlastRadius::Medium);
    let types: Vec<ActionType> = plan.actions.iter().map(|a| a.action_type).collect();
    assert_eq!(
        types,
        vec![ActionType::RemoveValues, ActionType::LowerLimit, ActionType::LowerLimit]
    );
}

#[test]
fn violation_without_detail_needs_approval() {
    let opaque = PolicyViolation {
        rule: RuleId::AnatomyPresent,
        code: ErrorCode::PolicyDenied,
        message: "agent 'agent-1' has an empty anatomy".to_owned(),
        detail: ViolationDetail::None,
    };
    let plan = generate_remediation_plan(&report(
        DriftType::PolicyChange,
        vec![over_budget(), opaque],
    ))
    .expect("plan");
    assert!(plan.requires_approval);
    assert!(!plan.is_safe());
    assert_eq!(plan.blast_radius, BlastRadius::High);
    assert_eq!(plan.actions[1].action_type, ActionType::ManualReview);
    assert_eq!(plan.actions[1].field, "rule:anatomy_present");
}

#[test]
fn tamper_expiry_and_invalid_are_manual() {
    for drift_type in [DriftType::SpecTamper, DriftType::Expired, DriftType::Invalid] {
        let plan = generate_remediation_plan(&report(drift_type, Vec::new())).expect("plan");
        assert!(plan.requires_approval, "{drift_type}");
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].action_type, ActionType::ManualReview);
        assert_eq!(plan.actions[0].field, drift_type.as_str());
    }
}

#[test]
fn policy_change_without_violations_has_no_plan() {
    assert!(generate_remediation_plan(&report(DriftType::PolicyChange, Vec::new())).is_none());
}

#[test]
fn plan_serializes_action_type_as_type() {
    let plan = generate_remediation_plan(&report(DriftType::PolicyChange, vec![disallowed()]))
        .expect("plan");
    let value = serde_json::to_value(&plan).expect("json");
    assert_eq!(value["actions"][0]["type"], "remove_values");
    assert_eq!(value["blast_radius"], "low");
    assert_eq!(value["drift_type"], "policy_change");
}
