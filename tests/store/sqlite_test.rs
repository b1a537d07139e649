//! SQLite persistence: agents, bundle history, registry state, audit trail.

use std::sync::Arc;

use serde_json::json;

use gatekeeper::audit::DecisionCode;
use gatekeeper::policy::registry::{Invalidation, RegistryState};
use gatekeeper::policy::PolicyRegistry;
use gatekeeper::store::sqlite::SqliteStore;
use gatekeeper::store::{
    AgentStore, AuditSink, PolicyBundleStore, RegistryStateStore, StoreError,
};
use gatekeeper::types::GovernanceStatus;

use crate::support::{bundle, governed_record, sandbox_record, t0, POLICY_SET};

async fn open(dir: &tempfile::TempDir) -> SqliteStore {
    SqliteStore::open(&dir.path().join("data").join("gatekeeper.db"))
        .await
        .expect("open")
}

#[tokio::test]
async fn open_creates_parent_directories_and_is_reentrant() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open(&dir).await;
    store.save(&sandbox_record("agent-1")).await.expect("save");
    drop(store);

    // Schema application is idempotent.
    let reopened = open(&dir).await;
    assert!(reopened.get("agent-1").await.expect("get").is_some());
}

#[tokio::test]
async fn agent_records_round_trip_and_upsert() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open(&dir).await;
    let mut record = sandbox_record("agent-1");
    store.save(&record).await.expect("save");
    assert_eq!(store.get("agent-1").await.expect("get"), Some(record.clone()));
    assert_eq!(store.get("ghost").await.expect("get"), None);

    record.status_reason = Some("edited".to_owned());
    store.save(&record).await.expect("upsert");
    assert_eq!(
        store
            .get("agent-1")
            .await
            .expect("get")
            .and_then(|r| r.status_reason),
        Some("edited".to_owned())
    );
}

#[tokio::test]
async fn update_status_rewrites_the_stored_document() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open(&dir).await;
    let registry = PolicyRegistry::new(Arc::new(store.clone()), Arc::new(store.clone()));
    registry
        .hot_reload(POLICY_SET, bundle(1000.0))
        .await
        .expect("reload");
    let snapshot = registry.get_snapshot(POLICY_SET).expect("snapshot");
    store
        .save(&governed_record("agent-1", 10.0, &snapshot))
        .await
        .expect("save");

    store
        .update_status("agent-1", GovernanceStatus::GovernedRestricted, "over budget")
        .await
        .expect("update");
    let record = store.get("agent-1").await.expect("get").expect("present");
    assert_eq!(record.status, GovernanceStatus::GovernedRestricted);
    assert_eq!(record.status_reason.as_deref(), Some("over budget"));
    // The proof is untouched by a status write.
    assert!(record.proof().is_some());

    let err = store
        .update_status("ghost", GovernanceStatus::GovernedValid, "x")
        .await
        .expect_err("missing");
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn list_governed_excludes_sandboxes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open(&dir).await;
    let registry = PolicyRegistry::new(Arc::new(store.clone()), Arc::new(store.clone()));
    registry
        .hot_reload(POLICY_SET, bundle(1000.0))
        .await
        .expect("reload");
    let snapshot = registry.get_snapshot(POLICY_SET).expect("snapshot");

    store.save(&sandbox_record("sandbox-1")).await.expect("save");
    store
        .save(&governed_record("gov-b", 10.0, &snapshot))
        .await
        .expect("save");
    store
        .save(&governed_record("gov-a", 10.0, &snapshot))
        .await
        .expect("save");

    let ids: Vec<String> = store
        .list_governed()
        .await
        .expect("list")
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec!["gov-a".to_owned(), "gov-b".to_owned()]);
}

#[tokio::test]
async fn bundles_keep_every_version() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open(&dir).await;
    assert!(store.load(POLICY_SET).await.expect("load").is_none());

    store.persist(POLICY_SET, 1, &bundle(1000.0)).await.expect("persist");
    store.persist(POLICY_SET, 2, &bundle(500.0)).await.expect("persist");
    store.persist("ws2", 1, &bundle(10.0)).await.expect("persist");

    let latest = store.load(POLICY_SET).await.expect("load").expect("stored");
    assert_eq!(latest.version, 2);
    assert_eq!(latest.bundle, bundle(500.0));
    assert_eq!(
        store.stored_policy_sets().await.expect("sets"),
        vec![POLICY_SET.to_owned(), "ws2".to_owned()]
    );
}

#[tokio::test]
async fn registry_state_replaces_wholesale() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open(&dir).await;
    assert_eq!(store.load_state().await.expect("load"), RegistryState::default());

    let mut state = RegistryState::default();
    state.revoked_signers.insert("old-ca".to_owned());
    state.invalidated_agents.insert(
        "agent-1".to_owned(),
        Invalidation {
            reason: "spec_tamper".to_owned(),
            at: t0(),
        },
    );
    store.persist_state(&state).await.expect("persist");
    assert_eq!(store.load_state().await.expect("load"), state);

    state.revoked_signers.clear();
    store.persist_state(&state).await.expect("persist");
    let loaded = store.load_state().await.expect("load");
    assert!(loaded.revoked_signers.is_empty());
    assert_eq!(loaded.invalidated_agents.len(), 1);
}

#[tokio::test]
async fn audit_rows_are_counted_by_code() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open(&dir).await;
    store
        .record(DecisionCode::AdmissionDenied, &json!({"agent_id": "a"}))
        .await
        .expect("record");
    store
        .record(DecisionCode::AdmissionDenied, &json!({"agent_id": "b"}))
        .await
        .expect("record");
    store
        .record(DecisionCode::PolicyReloaded, &json!({}))
        .await
        .expect("record");
    assert_eq!(store.audit_count(DecisionCode::AdmissionDenied).await.expect("count"), 2);
    assert_eq!(store.audit_count(DecisionCode::PolicyReloaded).await.expect("count"), 1);
    assert_eq!(store.audit_count(DecisionCode::DriftDetected).await.expect("count"), 0);
}

#[tokio::test]
async fn registry_survives_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let live_hash = {
        let store = open(&dir).await;
        let registry = PolicyRegistry::new(Arc::new(store.clone()), Arc::new(store.clone()));
        registry
            .hot_reload(POLICY_SET, bundle(1000.0))
            .await
            .expect("reload");
        registry
            .hot_reload(POLICY_SET, bundle(600.0))
            .await
            .expect("reload");
        registry.add_revoked_signer("old-ca").await.expect("revoke");
        registry.get_snapshot(POLICY_SET).expect("snapshot").hash.clone()
    };

    let store = open(&dir).await;
    let registry = PolicyRegistry::new(Arc::new(store.clone()), Arc::new(store.clone()));
    let sets = store.stored_policy_sets().await.expect("sets");
    assert_eq!(registry.restore(&sets).await.expect("restore"), 1);
    let snapshot = registry.get_snapshot(POLICY_SET).expect("snapshot");
    assert_eq!(snapshot.hash, live_hash);
    assert_eq!(snapshot.version, 2);
    assert!(snapshot.is_revoked("old-ca"));
}
