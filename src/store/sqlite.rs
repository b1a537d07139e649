//! SQLite-backed stores.
//!
//! One [`SqliteStore`] implements every persistence trait over a shared pool.
//! The schema is applied inline via `include_str!` on open.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::debug;

use super::{
    AgentStore, AuditSink, PolicyBundleStore, RegistryStateStore, StoreError, StoredBundle,
};
use crate::audit::DecisionCode;
use crate::policy::registry::{Invalidation, RegistryState};
use crate::policy::PolicyBundle;
use crate::types::{AgentRecord, GovernanceStatus};

/// Governance schema applied on open.
pub const SCHEMA: &str = include_str!("../../migrations/001_governance.sql");

/// SQLite implementation of the governance stores.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open governance db at {}", path.display()))?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, applying the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub async fn from_pool(pool: SqlitePool) -> anyhow::Result<Self> {
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("failed to apply governance schema")?;
        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Number of audit rows carrying `code`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn audit_count(&self, code: DecisionCode) -> Result<u64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM audit_log WHERE code = ?1")
            .bind(code.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(row.0).unwrap_or(0))
    }

    /// Every policy set with at least one persisted bundle, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn stored_policy_sets(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT policy_set FROM policy_bundles ORDER BY policy_set",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(set,)| set).collect())
    }
}

#[async_trait]
impl AgentStore for SqliteStore {
    async fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT record FROM agents WHERE id = ?1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(json,)| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn save(&self, record: &AgentRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        sqlx::query(
            "INSERT INTO agents (id, mode, policy_set, status, status_reason, record, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(id) DO UPDATE SET \
                mode = excluded.mode, policy_set = excluded.policy_set, \
                status = excluded.status, status_reason = excluded.status_reason, \
                record = excluded.record, updated_at = excluded.updated_at",
        )
        .bind(&record.id)
        .bind(record.spec.mode())
        .bind(record.policy_set())
        .bind(record.status.as_str())
        .bind(record.status_reason.as_deref())
        .bind(json)
        .bind(timestamp(record.updated_at))
        .execute(&self.pool)
        .await?;

        debug!(agent_id = %record.id, status = %record.status, "agent record saved");
        Ok(())
    }

    async fn update_status(
        &self,
        agent_id: &str,
        status: GovernanceStatus,
        reason: &str,
    ) -> Result<(), StoreError> {
        let now = timestamp(Utc::now());
        let result = sqlx::query(
            "UPDATE agents \
             SET status = ?1, status_reason = ?2, updated_at = ?3, \
                 record = json_set(record, '$.status', ?1, '$.status_reason', ?2, '$.updated_at', ?3) \
             WHERE id = ?4",
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(now)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(agent_id.to_owned()));
        }
        Ok(())
    }

    async fn list_governed(&self) -> Result<Vec<AgentRecord>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT record FROM agents WHERE mode = 'governed' ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(json,)| serde_json::from_str(&json).map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl PolicyBundleStore for SqliteStore {
    async fn load(&self, policy_set: &str) -> Result<Option<StoredBundle>, StoreError> {
        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT version, bundle FROM policy_bundles \
             WHERE policy_set = ?1 ORDER BY version DESC LIMIT 1",
        )
        .bind(policy_set)
        .fetch_optional(&self.pool)
        .await?;

        let Some((version, json)) = row else {
            return Ok(None);
        };
        let version = u64::try_from(version)
            .map_err(|_| StoreError::Corrupt(format!("negative version for {policy_set}")))?;
        Ok(Some(StoredBundle {
            version,
            bundle: serde_json::from_str(&json)?,
        }))
    }

    async fn persist(
        &self,
        policy_set: &str,
        version: u64,
        bundle: &PolicyBundle,
    ) -> Result<(), StoreError> {
        let version = i64::try_from(version)
            .map_err(|_| StoreError::Corrupt(format!("version {version} out of range")))?;
        let json = serde_json::to_string(bundle)?;
        sqlx::query(
            "INSERT OR REPLACE INTO policy_bundles (policy_set, version, bundle) VALUES (?1, ?2, ?3)",
        )
        .bind(policy_set)
        .bind(version)
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RegistryStateStore for SqliteStore {
    async fn load_state(&self) -> Result<RegistryState, StoreError> {
        let signers: Vec<(String,)> = sqlx::query_as("SELECT authority FROM revoked_signers")
            .fetch_all(&self.pool)
            .await?;
        let invalidations: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT agent_id, reason, invalidated_at FROM invalidated_agents",
        )
        .fetch_all(&self.pool)
        .await?;

        let revoked_signers: BTreeSet<String> = signers.into_iter().map(|(a,)| a).collect();
        let mut invalidated_agents = BTreeMap::new();
        for (agent_id, reason, at) in invalidations {
            let at = DateTime::parse_from_rfc3339(&at)
                .map_err(|e| StoreError::Corrupt(format!("invalidation of {agent_id}: {e}")))?
                .with_timezone(&Utc);
            invalidated_agents.insert(agent_id, Invalidation { reason, at });
        }

        Ok(RegistryState {
            revoked_signers,
            invalidated_agents,
        })
    }

    async fn persist_state(&self, state: &RegistryState) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM revoked_signers")
            .execute(&mut *tx)
            .await?;
        for authority in &state.revoked_signers {
            sqlx::query("INSERT INTO revoked_signers (authority) VALUES (?1)")
                .bind(authority)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM invalidated_agents")
            .execute(&mut *tx)
            .await?;
        for (agent_id, invalidation) in &state.invalidated_agents {
            sqlx::query(
                "INSERT INTO invalidated_agents (agent_id, reason, invalidated_at) VALUES (?1, ?2, ?3)",
            )
            .bind(agent_id)
            .bind(&invalidation.reason)
            .bind(timestamp(invalidation.at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for SqliteStore {
    async fn record(
        &self,
        code: DecisionCode,
        context: &serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO audit_log (code, context) VALUES (?1, ?2)")
            .bind(code.as_str())
            .bind(serde_json::to_string(context)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
