//! In-process GCRA backend.
//!
//! Keeps one [`GcraState`] per key in a TTL cache. Enforcement is local to
//! this process: two processes using this backend on the same key each
//! admit the full budget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::backend::{Decision, RateLimiterBackend, RateSpec};
use super::cache::TtlCache;
use super::gcra::{CasExhausted, Gcra, GcraState, Verdict, MAX_CAS_ATTEMPTS};
use super::release::Release;
use crate::clock::{Clock, SystemClock};
use crate::error::{RatekeeperError, Result};

/// The local GCRA engine.
pub struct LocalGcra {
    clock: Arc<dyn Clock>,
    states: TtlCache<String, Arc<GcraState>>,
    max_attempts: u32,
}

impl LocalGcra {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            states: TtlCache::new(Arc::clone(&clock)),
            clock,
            max_attempts: MAX_CAS_ATTEMPTS,
        }
    }

    /// Override the compare-and-swap attempt bound.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Number of keys currently holding state.
    pub fn tracked_keys(&self) -> usize {
        self.states.len()
    }

    /// Drop state for keys idle past their TTL.
    pub fn purge_expired(&self) -> usize {
        self.states.purge_expired()
    }

    fn state_for(&self, key: &str, window: Duration) -> Arc<GcraState> {
        self.states.get_or_insert_with(&key.to_string(), window, || {
            debug!(key = %key, window = ?window, "Creating local GCRA state");
            Arc::new(GcraState::new())
        })
    }
}

impl Default for LocalGcra {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiterBackend for LocalGcra {
    fn algorithm(&self) -> &'static str {
        "local_gcra"
    }

    async fn admit(&self, spec: &RateSpec<'_>, burst: u64) -> Result<Decision> {
        let window = spec.window_duration();
        let gcra = Gcra::from_window(spec.rate, window, burst);
        let state = self.state_for(spec.key, window);
        let now = u64::try_from(self.clock.now().as_nanos()).unwrap_or(u64::MAX);

        match state.admit(&gcra, now, spec.cost, self.max_attempts) {
            Ok(Verdict::Allow { tat }) => {
                // Keep the state at least as long as its schedule is ahead of
                // now, otherwise eviction would hand out a fresh burst early.
                let ahead = Duration::from_nanos(tat - now);
                if ahead > window {
                    self.states.extend(&spec.key.to_string(), ahead);
                }
                trace!(key = %spec.key, cost = spec.cost, tat, "Local GCRA admitted");
                Ok(Decision::allowed(Release::noop()))
            }
            Ok(Verdict::Deny { retry_after }) => {
                let retry_after = Duration::from_nanos(retry_after);
                trace!(key = %spec.key, cost = spec.cost, retry_after = ?retry_after, "Local GCRA denied");
                Ok(Decision::denied(retry_after))
            }
            Err(CasExhausted { attempts }) => {
                warn!(key = %spec.key, attempts, "Local GCRA contention limit reached");
                Err(RatekeeperError::Contention {
                    key: spec.key.to_string(),
                    attempts,
                })
            }
        }
    }
}
