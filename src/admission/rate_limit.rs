//! Per-agent sliding-window start limiter.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};

use super::{AdmissionContext, Interceptor, InterceptorDecision, InterceptorError};
use crate::types::ErrorCode;

/// Name of [`RateLimitInterceptor`].
pub const RATE_LIMITER: &str = "rate_limiter";

/// Sliding-window limit on starts per agent.
///
/// Register it last so only starts that passed every other check consume
/// budget. Windows follow the admission clock (`ctx.now`). Uses a sync
/// [`Mutex`]; the critical section never awaits.
#[derive(Debug)]
pub struct RateLimitInterceptor {
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    max_starts: u32,
    window: TimeDelta,
}

impl RateLimitInterceptor {
    /// Allow at most `max_starts` admissions per agent in `window_secs`.
    pub fn new(window_secs: u64, max_starts: u32) -> Self {
        let window = i64::try_from(window_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        Self {
            windows: Mutex::new(HashMap::new()),
            max_starts,
            window,
        }
    }

    /// Agents currently holding at least one start in their window.
    pub fn tracked_agents(&self) -> usize {
        self.windows.lock().map_or(0, |w| w.len())
    }
}

impl Interceptor for RateLimitInterceptor {
    fn name(&self) -> &str {
        RATE_LIMITER
    }

    fn execute(&self, ctx: &AdmissionContext) -> Result<InterceptorDecision, InterceptorError> {
        let mut windows = self
            .windows
            .lock()
            .map_err(|e| InterceptorError::Unavailable(format!("rate limiter lock poisoned: {e}")))?;

        // A window reaching past the start of time keeps everything.
        let cutoff = ctx
            .now
            .checked_sub_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        windows.retain(|_, starts| {
            starts.retain(|t| *t >= cutoff);
            !starts.is_empty()
        });

        let window = windows.entry(ctx.agent.id.clone()).or_default();
        let count = u32::try_from(window.len()).unwrap_or(u32::MAX);
        if count >= self.max_starts {
            return Ok(InterceptorDecision::deny(
                ErrorCode::RateLimitExceeded,
                format!(
                    "{count} starts in the last {}s (limit: {})",
                    self.window.num_seconds(),
                    self.max_starts
                ),
            ));
        }
        window.push_back(ctx.now);
        Ok(InterceptorDecision::allow())
    }
}
