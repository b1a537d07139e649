//! Admission entry point.
//!
//! All IO (agent lookup, snapshot fetch, spec hashing) happens here, before
//! the chain runs. Lookup failures are decisions, not errors.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::interceptors::{GovernedValidator, SandboxValidator};
use super::rate_limit::RateLimitInterceptor;
use super::status::derive_status;
use super::{AdmissionContext, InterceptorChain, InterceptorDecision};
use crate::audit::metrics::{Counter, GovernanceMetrics};
use crate::audit::GovernanceLogger;
use crate::config::AdmissionConfig;
use crate::policy::PolicyRegistry;
use crate::proof::canonical::spec_hash;
use crate::proof::ProofVerifier;
use crate::store::AgentStore;
use crate::types::ErrorCode;

/// Sandbox validator, governed validator, then the optional rate limiter.
pub fn standard_chain(verifier: ProofVerifier, config: &AdmissionConfig) -> InterceptorChain {
    let mut chain = InterceptorChain::new()
        .with(Arc::new(SandboxValidator::new(config.expiry_warning_hours)))
        .with(Arc::new(GovernedValidator::new(verifier)));
    if config.max_starts_per_window > 0 {
        chain.register(Arc::new(RateLimitInterceptor::new(
            config.window_secs,
            config.max_starts_per_window,
        )));
    }
    chain
}

/// Decides whether an agent may start.
pub struct AdmissionController {
    registry: Arc<PolicyRegistry>,
    agents: Arc<dyn AgentStore>,
    chain: InterceptorChain,
    verifier: ProofVerifier,
    logger: Arc<GovernanceLogger>,
    metrics: Arc<GovernanceMetrics>,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    /// Wire a controller from its collaborators.
    pub fn new(
        registry: Arc<PolicyRegistry>,
        agents: Arc<dyn AgentStore>,
        chain: InterceptorChain,
        verifier: ProofVerifier,
        logger: Arc<GovernanceLogger>,
        metrics: Arc<GovernanceMetrics>,
    ) -> Self {
        Self {
            registry,
            agents,
            chain,
            verifier,
            logger,
            metrics,
        }
    }

    /// Decide on `agent_id` now.
    pub async fn check_admission(&self, agent_id: &str) -> InterceptorDecision {
        self.check_admission_at(agent_id, Utc::now()).await
    }

    /// Decide on `agent_id` as of `now`.
    pub async fn check_admission_at(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> InterceptorDecision {
        let decision = self.decide(agent_id, now).await;

        let counter = if decision.deny {
            Counter::AdmissionDenied
        } else if decision.restrict {
            Counter::AdmissionRestricted
        } else {
            Counter::AdmissionAllowed
        };
        self.metrics.incr(counter);
        self.logger.admission(agent_id, &decision).await;
        decision
    }

    async fn decide(&self, agent_id: &str, now: DateTime<Utc>) -> InterceptorDecision {
        let record = match self.agents.get(agent_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return InterceptorDecision::deny(
                    ErrorCode::AgentNotFound,
                    format!("agent '{agent_id}' does not exist"),
                );
            }
            Err(e) => {
                warn!(agent_id, error = %e, "agent store unavailable during admission");
                return InterceptorDecision::deny(
                    ErrorCode::RuntimeUnavailable,
                    format!("agent store unavailable: {e}"),
                );
            }
        };

        let hash = match spec_hash(&record.spec) {
            Ok(hash) => hash,
            Err(e) => {
                return InterceptorDecision::deny(
                    ErrorCode::InterceptorError,
                    format!("agent spec could not be hashed: {e}"),
                );
            }
        };
        let snapshot = record
            .policy_set()
            .and_then(|set| self.registry.get_snapshot(set));

        let derived = derive_status(&record, snapshot.as_deref(), &self.verifier, &hash, now);

        let ctx = AdmissionContext {
            agent: record,
            snapshot,
            spec_hash: hash,
            now,
        };
        let decision = self.chain.run(&ctx);

        if let Some((status, reason)) = derived {
            if status != ctx.agent.status {
                match self.agents.update_status(agent_id, status, &reason).await {
                    Ok(()) => {
                        info!(agent_id, from = %ctx.agent.status, to = %status, "status re-derived");
                        self.logger
                            .status_changed(agent_id, ctx.agent.status, status, &reason)
                            .await;
                    }
                    Err(e) => warn!(agent_id, error = %e, "failed to write back derived status"),
                }
            }
        }

        decision
    }
}
