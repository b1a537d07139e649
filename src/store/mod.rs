//! Persistence collaborators consumed by the governance core.
//!
//! The core never owns durable state: agents, policy bundles, registry
//! revocation/invalidation state and the audit trail all live behind these
//! traits. [`memory`] provides in-process implementations, [`sqlite`] a
//! SQLite-backed one.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::audit::metrics::Counter;
use crate::audit::DecisionCode;
use crate::policy::registry::RegistryState;
use crate::policy::PolicyBundle;
use crate::types::{AgentRecord, GovernanceStatus};

/// Errors produced by store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Stored document could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Addressed row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Stored data violates an invariant.
    #[error("corrupt record: {0}")]
    Corrupt(String),
    /// Store is unreachable or was closed.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A persisted policy bundle with its version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBundle {
    /// Monotonic version per policy set.
    pub version: u64,
    /// The bundle itself.
    pub bundle: PolicyBundle,
}

/// Agent record store.
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Fetch one agent.
    async fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>, StoreError>;
    /// Insert or replace an agent record.
    async fn save(&self, record: &AgentRecord) -> Result<(), StoreError>;
    /// Update the cached governance status.
    async fn update_status(
        &self,
        agent_id: &str,
        status: GovernanceStatus,
        reason: &str,
    ) -> Result<(), StoreError>;
    /// Every agent with a governed spec.
    async fn list_governed(&self) -> Result<Vec<AgentRecord>, StoreError>;
}

/// Durable policy bundle store.
#[async_trait]
pub trait PolicyBundleStore: Send + Sync {
    /// Latest bundle for a policy set.
    async fn load(&self, policy_set: &str) -> Result<Option<StoredBundle>, StoreError>;
    /// Durably record a new bundle version. Must be flushed on return.
    async fn persist(
        &self,
        policy_set: &str,
        version: u64,
        bundle: &PolicyBundle,
    ) -> Result<(), StoreError>;
}

/// Durable store for process-wide revocation and invalidation state.
#[async_trait]
pub trait RegistryStateStore: Send + Sync {
    /// Load the last persisted state (empty if none).
    async fn load_state(&self) -> Result<RegistryState, StoreError>;
    /// Replace the persisted state.
    async fn persist_state(&self, state: &RegistryState) -> Result<(), StoreError>;
}

/// Append-only decision trail. The core never reads it back.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append one decision.
    async fn record(
        &self,
        code: DecisionCode,
        context: &serde_json::Value,
    ) -> Result<(), StoreError>;
}

/// Counter sink for an external metrics backend.
pub trait MetricsSink: Send + Sync {
    /// Add `by` to `counter`.
    fn increment(&self, counter: Counter, by: u64);
}
