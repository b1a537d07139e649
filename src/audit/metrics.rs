//! Lock-free governance counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::MetricsSink;

/// Counter identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    /// Admission allowed.
    AdmissionAllowed,
    /// Admission allowed with advisories.
    AdmissionRestricted,
    /// Admission denied.
    AdmissionDenied,
    /// Promotion attempted.
    PromotionAttempts,
    /// Promotion denied.
    PromotionDenied,
    /// Hot-reload succeeded.
    PolicyReloadSuccess,
    /// Hot-reload failed.
    PolicyReloadFailure,
    /// Agents invalidated.
    InvalidationEvents,
    /// Drift scans completed.
    DriftScans,
    /// Agents found drifted.
    DriftDetected,
    /// Remediation actions applied.
    RemediationApplied,
    /// Remediation actions failed.
    RemediationFailed,
}

const COUNTERS: [Counter; 12] = [
    Counter::AdmissionAllowed,
    Counter::AdmissionRestricted,
    Counter::AdmissionDenied,
    Counter::PromotionAttempts,
    Counter::PromotionDenied,
    Counter::PolicyReloadSuccess,
    Counter::PolicyReloadFailure,
    Counter::InvalidationEvents,
    Counter::DriftScans,
    Counter::DriftDetected,
    Counter::RemediationApplied,
    Counter::RemediationFailed,
];

impl Counter {
    fn index(self) -> usize {
        match self {
            Self::AdmissionAllowed => 0,
            Self::AdmissionRestricted => 1,
            Self::AdmissionDenied => 2,
            Self::PromotionAttempts => 3,
            Self::PromotionDenied => 4,
            Self::PolicyReloadSuccess => 5,
            Self::PolicyReloadFailure => 6,
            Self::InvalidationEvents => 7,
            Self::DriftScans => 8,
            Self::DriftDetected => 9,
            Self::RemediationApplied => 10,
            Self::RemediationFailed => 11,
        }
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Admission allowed.
    pub admission_allowed: u64,
    /// Admission allowed with advisories.
    pub admission_restricted: u64,
    /// Admission denied.
    pub admission_denied: u64,
    /// Promotion attempted.
    pub promotion_attempts: u64,
    /// Promotion denied.
    pub promotion_denied: u64,
    /// Hot-reload succeeded.
    pub policy_reload_success: u64,
    /// Hot-reload failed.
    pub policy_reload_failure: u64,
    /// Agents invalidated.
    pub invalidation_events: u64,
    /// Drift scans completed.
    pub drift_scans: u64,
    /// Agents found drifted.
    pub drift_detected: u64,
    /// Remediation actions applied.
    pub remediation_applied: u64,
    /// Remediation actions failed.
    pub remediation_failed: u64,
}

/// In-process counters, mirrored to an optional [`MetricsSink`].
pub struct GovernanceMetrics {
    counters: [AtomicU64; 12],
    sink: Option<Arc<dyn MetricsSink>>,
}

impl std::fmt::Debug for GovernanceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl GovernanceMetrics {
    /// Counters without an external sink.
    pub fn new() -> Self {
        Self {
            counters: Default::default(),
            sink: None,
        }
    }

    /// Counters mirrored to `sink`.
    pub fn with_sink(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            counters: Default::default(),
            sink: Some(sink),
        }
    }

    /// Add one to `counter`.
    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    /// Add `by` to `counter`.
    pub fn add(&self, counter: Counter, by: u64) {
        if by == 0 {
            return;
        }
        if let Some(slot) = self.counters.get(counter.index()) {
            slot.fetch_add(by, Ordering::Relaxed);
        }
        if let Some(sink) = &self.sink {
            sink.increment(counter, by);
        }
    }

    /// Current value of `counter`.
    pub fn get(&self, counter: Counter) -> u64 {
        self.counters
            .get(counter.index())
            .map_or(0, |slot| slot.load(Ordering::Relaxed))
    }

    /// Copy every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snap = MetricsSnapshot::default();
        for counter in COUNTERS {
            let value = self.get(counter);
            let field = match counter {
                Counter::AdmissionAllowed => &mut snap.admission_allowed,
                Counter::AdmissionRestricted => &mut snap.admission_restricted,
                Counter::AdmissionDenied => &mut snap.admission_denied,
                Counter::PromotionAttempts => &mut snap.promotion_attempts,
                Counter::PromotionDenied => &mut snap.promotion_denied,
                Counter::PolicyReloadSuccess => &mut snap.policy_reload_success,
                Counter::PolicyReloadFailure => &mut snap.policy_reload_failure,
                Counter::InvalidationEvents => &mut snap.invalidation_events,
                Counter::DriftScans => &mut snap.drift_scans,
                Counter::DriftDetected => &mut snap.drift_detected,
                Counter::RemediationApplied => &mut snap.remediation_applied,
                Counter::RemediationFailed => &mut snap.remediation_failed,
            };
            *field = value;
        }
        snap
    }
}

impl Default for GovernanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}
