//! Policy hot-reload through the service: roles, failures, watcher updates.

use std::path::PathBuf;

use gatekeeper::audit::metrics::Counter;
use gatekeeper::audit::DecisionCode;
use gatekeeper::governance::{GovernanceError, GovernanceSettings};
use gatekeeper::policy::watcher::PolicyUpdate;
use gatekeeper::policy::RegistryError;
use gatekeeper::types::{Actor, ActorRole};

use crate::support::{bundle, Harness, POLICY_SET};

fn policy_admin() -> Actor {
    Actor::new("carol", ActorRole::PolicyAdmin)
}

#[tokio::test]
async fn first_reload_reports_none_as_previous_hash() {
    let h = Harness::new(GovernanceSettings::default());
    let report = h
        .service
        .hot_reload_policy(POLICY_SET, bundle(1000.0), &policy_admin())
        .await
        .expect("reload");
    assert_eq!(report.old_hash, "none");
    assert_eq!(report.version, 1);
    assert!(report.invalidated_agent_ids.is_empty());
    assert!(report.reconcile_error.is_none());

    let second = h
        .service
        .hot_reload_policy(POLICY_SET, bundle(900.0), &policy_admin())
        .await
        .expect("reload");
    assert_eq!(second.old_hash, report.new_hash);
    assert_eq!(h.metrics.get(Counter::PolicyReloadSuccess), 2);
    assert_eq!(h.audit.count(DecisionCode::PolicyReloaded), 2);
}

#[tokio::test]
async fn only_policy_admins_may_reload() {
    let h = Harness::new(GovernanceSettings::default());
    let before = h.load(bundle(1000.0)).await;

    for role in [ActorRole::Viewer, ActorRole::AgentAdmin] {
        let err = h
            .service
            .hot_reload_policy(POLICY_SET, bundle(1.0), &Actor::new("mallory", role))
            .await
            .expect_err("forbidden");
        assert!(matches!(err, GovernanceError::Forbidden { .. }));
    }

    let after = h.registry.get_snapshot(POLICY_SET).expect("snapshot");
    assert_eq!(after.hash, before.hash);
    assert_eq!(h.metrics.get(Counter::PolicyReloadFailure), 2);
    assert_eq!(h.audit.count(DecisionCode::PolicyReloadFailed), 2);
}

#[tokio::test]
async fn persist_failure_keeps_the_old_snapshot() {
    let h = Harness::new(GovernanceSettings::default());
    let before = h.load(bundle(1000.0)).await;
    h.bundles.set_failing(true);

    let err = h
        .service
        .hot_reload_policy(POLICY_SET, bundle(10.0), &policy_admin())
        .await
        .expect_err("persist fails");
    assert!(matches!(
        err,
        GovernanceError::Registry(RegistryError::PersistBundle { .. })
    ));
    assert_eq!(
        h.registry.get_snapshot(POLICY_SET).expect("snapshot").hash,
        before.hash
    );
    assert_eq!(h.metrics.get(Counter::PolicyReloadFailure), 1);
}

#[tokio::test]
async fn watcher_updates_skip_unchanged_bundles() {
    let h = Harness::new(GovernanceSettings::default());
    let update = |max: f64| PolicyUpdate {
        policy_set: POLICY_SET.to_owned(),
        bundle: bundle(max),
        path: PathBuf::from("/policies/ws1.json"),
    };

    let first = h.service.apply_policy_update(update(1000.0)).await;
    assert_eq!(first.expect("adopted").version, 1);
    assert!(h.service.apply_policy_update(update(1000.0)).await.is_none());
    let third = h.service.apply_policy_update(update(500.0)).await;
    assert_eq!(third.expect("adopted").version, 2);
}

#[tokio::test]
async fn signer_revocation_is_audited_once() {
    let h = Harness::new(GovernanceSettings::default());
    h.load(bundle(1000.0)).await;
    assert!(h.service.revoke_signer("old-ca").await.expect("revoke"));
    assert!(!h.service.revoke_signer("old-ca").await.expect("revoke"));
    assert_eq!(h.audit.count(DecisionCode::SignerRevoked), 1);

    assert!(h.service.unrevoke_signer("old-ca").await.expect("unrevoke"));
    assert!(!h.service.unrevoke_signer("old-ca").await.expect("unrevoke"));
    assert_eq!(h.audit.count(DecisionCode::SignerUnrevoked), 1);
}
