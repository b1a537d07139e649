//! In-process store implementations.
//!
//! Used by tests and by embedders that keep state elsewhere. Each store can
//! be switched into a failing mode to exercise the persistence error paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::{
    AgentStore, AuditSink, MetricsSink, PolicyBundleStore, RegistryStateStore, StoreError,
    StoredBundle,
};
use crate::audit::metrics::Counter;
use crate::audit::DecisionCode;
use crate::policy::registry::RegistryState;
use crate::policy::PolicyBundle;
use crate::types::{AgentRecord, GovernanceStatus};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_owned()))
}

fn check_available(failing: &AtomicBool) -> Result<(), StoreError> {
    if failing.load(Ordering::SeqCst) {
        return Err(StoreError::Unavailable("store switched to failing mode".to_owned()));
    }
    Ok(())
}

/// In-memory [`AgentStore`].
#[derive(Debug, Default)]
pub struct MemoryAgentStore {
    agents: Mutex<BTreeMap<String, AgentRecord>>,
    failing: AtomicBool,
}

impl MemoryAgentStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `records`.
    pub fn with_records(records: impl IntoIterator<Item = AgentRecord>) -> Self {
        let agents = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        Self {
            agents: Mutex::new(agents),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentStore for MemoryAgentStore {
    async fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>, StoreError> {
        check_available(&self.failing)?;
        Ok(lock(&self.agents)?.get(agent_id).cloned())
    }

    async fn save(&self, record: &AgentRecord) -> Result<(), StoreError> {
        check_available(&self.failing)?;
        lock(&self.agents)?.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        agent_id: &str,
        status: GovernanceStatus,
        reason: &str,
    ) -> Result<(), StoreError> {
        check_available(&self.failing)?;
        let mut agents = lock(&self.agents)?;
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| StoreError::NotFound(agent_id.to_owned()))?;
        record.status = status;
        record.status_reason = Some(reason.to_owned());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn list_governed(&self) -> Result<Vec<AgentRecord>, StoreError> {
        check_available(&self.failing)?;
        Ok(lock(&self.agents)?
            .values()
            .filter(|r| r.is_governed())
            .cloned()
            .collect())
    }
}

/// In-memory [`PolicyBundleStore`] keeping every version.
#[derive(Debug, Default)]
pub struct MemoryPolicyBundleStore {
    bundles: Mutex<HashMap<String, Vec<StoredBundle>>>,
    failing: AtomicBool,
}

impl MemoryPolicyBundleStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of persisted versions for `policy_set`.
    pub fn version_count(&self, policy_set: &str) -> usize {
        self.bundles
            .lock()
            .map(|b| b.get(policy_set).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

#[async_trait]
impl PolicyBundleStore for MemoryPolicyBundleStore {
    async fn load(&self, policy_set: &str) -> Result<Option<StoredBundle>, StoreError> {
        check_available(&self.failing)?;
        Ok(lock(&self.bundles)?
            .get(policy_set)
            .and_then(|versions| versions.last().cloned()))
    }

    async fn persist(
        &self,
        policy_set: &str,
        version: u64,
        bundle: &PolicyBundle,
    ) -> Result<(), StoreError> {
        check_available(&self.failing)?;
        lock(&self.bundles)?
            .entry(policy_set.to_owned())
            .or_default()
            .push(StoredBundle {
                version,
                bundle: bundle.clone(),
            });
        Ok(())
    }
}

/// In-memory [`RegistryStateStore`].
#[derive(Debug, Default)]
pub struct MemoryRegistryStateStore {
    state: Mutex<RegistryState>,
    failing: AtomicBool,
}

impl MemoryRegistryStateStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl RegistryStateStore for MemoryRegistryStateStore {
    async fn load_state(&self) -> Result<RegistryState, StoreError> {
        check_available(&self.failing)?;
        Ok(lock(&self.state)?.clone())
    }

    async fn persist_state(&self, state: &RegistryState) -> Result<(), StoreError> {
        check_available(&self.failing)?;
        *lock(&self.state)? = state.clone();
        Ok(())
    }
}

/// In-memory [`AuditSink`] that keeps every record.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<(DecisionCode, serde_json::Value)>>,
}

impl MemoryAuditSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all records so far.
    pub fn records(&self) -> Vec<(DecisionCode, serde_json::Value)> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Number of records carrying `code`.
    pub fn count(&self, code: DecisionCode) -> usize {
        self.records
            .lock()
            .map(|r| r.iter().filter(|(c, _)| *c == code).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(
        &self,
        code: DecisionCode,
        context: &serde_json::Value,
    ) -> Result<(), StoreError> {
        lock(&self.records)?.push((code, context.clone()));
        Ok(())
    }
}

/// [`MetricsSink`] that sums increments per counter.
#[derive(Debug, Default)]
pub struct MemoryMetricsSink {
    totals: Mutex<HashMap<Counter, u64>>,
    calls: AtomicU64,
}

impl MemoryMetricsSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of increments received for `counter`.
    pub fn total(&self, counter: Counter) -> u64 {
        self.totals
            .lock()
            .map(|t| t.get(&counter).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Number of `increment` calls received.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn increment(&self, counter: Counter, by: u64) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut totals) = self.totals.lock() {
            let slot = totals.entry(counter).or_insert(0);
            *slot = slot.saturating_add(by);
        }
    }
}
