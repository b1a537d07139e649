//! Live policy snapshots with atomic hot-reload.
//!
//! Each policy set maps to one immutable [`PolicySnapshot`] behind an `Arc`.
//! Readers clone the `Arc` once and keep that view for the whole check; the
//! map lock is held only long enough to copy or swap the pointer. Every
//! mutation builds fresh snapshots and swaps them in.
//!
//! Writers (reload, revocation, invalidation) serialize on one async mutex
//! that also owns the process-wide [`RegistryState`]. State is persisted
//! before the in-memory swap, so a failed write leaves readers on the old
//! snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::PolicyBundle;
use crate::proof::canonical::{bundle_hash, CanonicalError};
use crate::store::{PolicyBundleStore, RegistryStateStore, StoreError};

/// `old_hash` reported on the first load of a policy set.
pub const NO_PREVIOUS_HASH: &str = "none";

/// Why and when an agent was invalidated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
    /// Human-readable reason.
    pub reason: String,
    /// When the invalidation was recorded.
    pub at: DateTime<Utc>,
}

/// Process-wide signer revocations and agent invalidations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryState {
    /// Authorities whose proofs are no longer trusted.
    #[serde(default)]
    pub revoked_signers: BTreeSet<String>,
    /// Agents barred from admission.
    #[serde(default)]
    pub invalidated_agents: BTreeMap<String, Invalidation>,
}

/// Immutable view of one policy set.
#[derive(Debug, Clone, Serialize)]
pub struct PolicySnapshot {
    /// Policy set name.
    pub policy_set: String,
    /// Monotonic version, starting at 1.
    pub version: u64,
    /// `sha256:<hex>` of the canonical bundle.
    pub hash: String,
    /// The bundle.
    pub bundle: Arc<PolicyBundle>,
    /// Revoked signer authorities.
    pub revoked_signers: BTreeSet<String>,
    /// Invalidated agents.
    pub invalidated_agents: BTreeMap<String, Invalidation>,
    /// When this bundle version was loaded.
    pub loaded_at: DateTime<Utc>,
}

impl PolicySnapshot {
    /// Invalidation entry for `agent_id`, if any.
    pub fn invalidation(&self, agent_id: &str) -> Option<&Invalidation> {
        self.invalidated_agents.get(agent_id)
    }

    /// Whether `authority` is revoked.
    pub fn is_revoked(&self, authority: &str) -> bool {
        self.revoked_signers.contains(authority)
    }

    fn with_state(&self, state: &RegistryState) -> Self {
        Self {
            policy_set: self.policy_set.clone(),
            version: self.version,
            hash: self.hash.clone(),
            bundle: Arc::clone(&self.bundle),
            revoked_signers: state.revoked_signers.clone(),
            invalidated_agents: state.invalidated_agents.clone(),
            loaded_at: self.loaded_at,
        }
    }
}

/// Hashes reported by a successful reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadOutcome {
    /// Policy set that was reloaded.
    pub policy_set: String,
    /// Previous hash, or [`NO_PREVIOUS_HASH`].
    pub old_hash: String,
    /// Hash now in effect.
    pub new_hash: String,
    /// Version now in effect.
    pub version: u64,
}

/// Errors from registry writes.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Bundle could not be hashed.
    #[error("failed to hash policy bundle: {0}")]
    Hash(#[from] CanonicalError),
    /// Bundle could not be persisted; the current snapshot is unchanged.
    #[error("failed to persist policy bundle for {policy_set}: {source}")]
    PersistBundle {
        /// Policy set being reloaded.
        policy_set: String,
        /// Underlying store error.
        #[source]
        source: StoreError,
    },
    /// Registry state could not be loaded or persisted.
    #[error("failed to persist registry state: {0}")]
    State(#[source] StoreError),
    /// Bundle could not be restored from the store.
    #[error("failed to load policy bundle for {policy_set}: {source}")]
    LoadBundle {
        /// Policy set being restored.
        policy_set: String,
        /// Underlying store error.
        #[source]
        source: StoreError,
    },
}

/// Current snapshot per policy set.
pub struct PolicyRegistry {
    snapshots: RwLock<HashMap<String, Arc<PolicySnapshot>>>,
    writer: Mutex<RegistryState>,
    bundles: Arc<dyn PolicyBundleStore>,
    state_store: Arc<dyn RegistryStateStore>,
}

impl std::fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("policy_sets", &self.policy_sets())
            .finish_non_exhaustive()
    }
}

impl PolicyRegistry {
    /// Empty registry persisting through the given stores.
    pub fn new(
        bundles: Arc<dyn PolicyBundleStore>,
        state_store: Arc<dyn RegistryStateStore>,
    ) -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            writer: Mutex::new(RegistryState::default()),
            bundles,
            state_store,
        }
    }

    /// Current snapshot of `policy_set`, if loaded.
    pub fn get_snapshot(&self, policy_set: &str) -> Option<Arc<PolicySnapshot>> {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(policy_set)
            .cloned()
    }

    /// Names of all loaded policy sets, sorted.
    pub fn policy_sets(&self) -> Vec<String> {
        let mut sets: Vec<String> = self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        sets.sort();
        sets
    }

    /// Copy of the process-wide revocation and invalidation state.
    pub async fn state(&self) -> RegistryState {
        self.writer.lock().await.clone()
    }

    /// Load persisted state and the latest bundle of each of `policy_sets`.
    ///
    /// Returns the number of policy sets restored.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] if a store read or hash fails.
    pub async fn restore(&self, policy_sets: &[String]) -> Result<usize, RegistryError> {
        let mut state = self.writer.lock().await;
        *state = self
            .state_store
            .load_state()
            .await
            .map_err(RegistryError::State)?;

        let mut restored = 0usize;
        for policy_set in policy_sets {
            let stored = self.bundles.load(policy_set).await.map_err(|source| {
                RegistryError::LoadBundle {
                    policy_set: policy_set.clone(),
                    source,
                }
            })?;
            let Some(stored) = stored else {
                debug!(policy_set = %policy_set, "no persisted bundle to restore");
                continue;
            };
            let hash = bundle_hash(&stored.bundle)?;
            let snapshot = PolicySnapshot {
                policy_set: policy_set.clone(),
                version: stored.version,
                hash,
                bundle: Arc::new(stored.bundle),
                revoked_signers: state.revoked_signers.clone(),
                invalidated_agents: state.invalidated_agents.clone(),
                loaded_at: Utc::now(),
            };
            self.swap(policy_set, snapshot);
            restored = restored.saturating_add(1);
        }
        self.rebuild_all(&state);

        info!(
            restored,
            revoked = state.revoked_signers.len(),
            invalidated = state.invalidated_agents.len(),
            "policy registry restored"
        );
        Ok(restored)
    }

    /// Atomically replace the bundle of `policy_set`.
    ///
    /// Revocations and invalidations carry forward. The bundle is persisted
    /// before the swap; on persistence failure the current snapshot stays.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] if hashing or persistence fails.
    pub async fn hot_reload(
        &self,
        policy_set: &str,
        bundle: PolicyBundle,
    ) -> Result<ReloadOutcome, RegistryError> {
        let state = self.writer.lock().await;
        self.reload_locked(policy_set, bundle, &state).await
    }

    /// Like [`hot_reload`](Self::hot_reload), but replaces the process-wide
    /// state with `replacement` instead of carrying it forward.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] if hashing or persistence fails.
    pub async fn hot_reload_replacing(
        &self,
        policy_set: &str,
        bundle: PolicyBundle,
        replacement: RegistryState,
    ) -> Result<ReloadOutcome, RegistryError> {
        let mut state = self.writer.lock().await;
        self.state_store
            .persist_state(&replacement)
            .await
            .map_err(RegistryError::State)?;
        match self.reload_locked(policy_set, bundle, &replacement).await {
            Ok(outcome) => {
                *state = replacement;
                self.rebuild_all(&state);
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback) = self.state_store.persist_state(&state).await {
                    warn!(error = %rollback, "failed to roll back registry state");
                }
                Err(e)
            }
        }
    }

    async fn reload_locked(
        &self,
        policy_set: &str,
        bundle: PolicyBundle,
        state: &RegistryState,
    ) -> Result<ReloadOutcome, RegistryError> {
        let new_hash = bundle_hash(&bundle)?;
        let previous = self.get_snapshot(policy_set);
        let old_hash = previous
            .as_ref()
            .map_or_else(|| NO_PREVIOUS_HASH.to_owned(), |s| s.hash.clone());
        let version = previous
            .as_ref()
            .map_or(1, |s| s.version.saturating_add(1));

        self.bundles
            .persist(policy_set, version, &bundle)
            .await
            .map_err(|source| {
                warn!(policy_set, error = %source, "policy bundle persistence failed");
                RegistryError::PersistBundle {
                    policy_set: policy_set.to_owned(),
                    source,
                }
            })?;

        let snapshot = PolicySnapshot {
            policy_set: policy_set.to_owned(),
            version,
            hash: new_hash.clone(),
            bundle: Arc::new(bundle),
            revoked_signers: state.revoked_signers.clone(),
            invalidated_agents: state.invalidated_agents.clone(),
            loaded_at: Utc::now(),
        };
        self.swap(policy_set, snapshot);

        info!(policy_set, version, %old_hash, %new_hash, "policy snapshot swapped");
        Ok(ReloadOutcome {
            policy_set: policy_set.to_owned(),
            old_hash,
            new_hash,
            version,
        })
    }

    /// Add agents to the invalidation map. Existing entries keep their
    /// original reason.
    ///
    /// Returns the ids that were newly invalidated.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::State`] if the new state cannot be persisted.
    pub async fn invalidate_agents(
        &self,
        agent_ids: &[String],
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<String>, RegistryError> {
        let mut state = self.writer.lock().await;
        let mut next = state.clone();
        let mut added = Vec::new();
        for agent_id in agent_ids {
            if next.invalidated_agents.contains_key(agent_id) {
                continue;
            }
            next.invalidated_agents.insert(
                agent_id.clone(),
                Invalidation {
                    reason: reason.to_owned(),
                    at,
                },
            );
            added.push(agent_id.clone());
        }
        if added.is_empty() {
            return Ok(added);
        }
        self.commit_state(&mut state, next).await?;
        Ok(added)
    }

    /// Remove `agent_id` from the invalidation map. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::State`] if the new state cannot be persisted.
    pub async fn clear_invalidation(&self, agent_id: &str) -> Result<bool, RegistryError> {
        let mut state = self.writer.lock().await;
        if !state.invalidated_agents.contains_key(agent_id) {
            return Ok(false);
        }
        let mut next = state.clone();
        next.invalidated_agents.remove(agent_id);
        self.commit_state(&mut state, next).await?;
        Ok(true)
    }

    /// Revoke `authority` across every policy set. Returns whether it was newly added.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::State`] if the new state cannot be persisted.
    pub async fn add_revoked_signer(&self, authority: &str) -> Result<bool, RegistryError> {
        let mut state = self.writer.lock().await;
        if state.revoked_signers.contains(authority) {
            return Ok(false);
        }
        let mut next = state.clone();
        next.revoked_signers.insert(authority.to_owned());
        self.commit_state(&mut state, next).await?;
        Ok(true)
    }

    /// Restore trust in `authority`. Returns whether it was revoked.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::State`] if the new state cannot be persisted.
    pub async fn remove_revoked_signer(&self, authority: &str) -> Result<bool, RegistryError> {
        let mut state = self.writer.lock().await;
        if !state.revoked_signers.contains(authority) {
            return Ok(false);
        }
        let mut next = state.clone();
        next.revoked_signers.remove(authority);
        self.commit_state(&mut state, next).await?;
        Ok(true)
    }

    async fn commit_state(
        &self,
        current: &mut RegistryState,
        next: RegistryState,
    ) -> Result<(), RegistryError> {
        self.state_store
            .persist_state(&next)
            .await
            .map_err(RegistryError::State)?;
        *current = next;
        self.rebuild_all(current);
        Ok(())
    }

    fn swap(&self, policy_set: &str, snapshot: PolicySnapshot) {
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(policy_set.to_owned(), Arc::new(snapshot));
    }

    fn rebuild_all(&self, state: &RegistryState) {
        let mut snapshots = self
            .snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for snapshot in snapshots.values_mut() {
            *snapshot = Arc::new(snapshot.with_state(state));
        }
    }
}
