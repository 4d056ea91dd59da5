//! Generic Cell Rate Algorithm, virtual scheduling form.
//!
//! The algorithm tracks a single theoretical arrival time (TAT) per key.
//! All quantities here are plain integer ticks; the local engine and the
//! in-memory store use nanoseconds, the Lua procedure uses microseconds.

use std::cmp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bound on compare-and-swap attempts for one decision.
pub const MAX_CAS_ATTEMPTS: u32 = 100;

/// GCRA parameters derived from a rate, a window and a burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gcra {
    /// Ticks "paid" by one unit of cost.
    emission_interval: u64,
    /// How far ahead of now the schedule may run, `(burst + 1) * T`.
    tolerance: u64,
}

/// Outcome of evaluating one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Conforming; the key's TAT becomes `tat`.
    Allow { tat: u64 },
    /// Not conforming; retry no sooner than `retry_after` ticks from now.
    Deny { retry_after: u64 },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow { .. })
    }
}

impl Gcra {
    /// Build parameters for `rate` units per `window` ticks with room for
    /// `burst` units on top of steady pacing.
    pub fn new(rate: u64, window: u64, burst: u64) -> Self {
        let emission_interval = cmp::max(window / cmp::max(rate, 1), 1);
        let tolerance = emission_interval.saturating_mul(burst.saturating_add(1));
        Self {
            emission_interval,
            tolerance,
        }
    }

    /// Parameters in nanosecond ticks.
    pub fn from_window(rate: u64, window: Duration, burst: u64) -> Self {
        let window = u64::try_from(window.as_nanos()).unwrap_or(u64::MAX);
        Self::new(rate, window, burst)
    }

    pub fn emission_interval(&self) -> u64 {
        self.emission_interval
    }

    pub fn tolerance(&self) -> u64 {
        self.tolerance
    }

    /// Evaluate `cost` units arriving at `now` against a stored `tat`.
    ///
    /// A missing TAT is represented as 0, which behaves exactly like a key
    /// whose schedule has fully drained.
    pub fn evaluate(&self, tat: u64, now: u64, cost: u64) -> Verdict {
        let new_tat = cmp::max(tat, now).saturating_add(cost.saturating_mul(self.emission_interval));
        let allow_at = new_tat.saturating_sub(self.tolerance);
        if now < allow_at {
            Verdict::Deny {
                retry_after: allow_at - now,
            }
        } else {
            Verdict::Allow { tat: new_tat }
        }
    }
}

/// Compare-and-swap retries ran out before a decision could be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasExhausted {
    pub attempts: u32,
}

/// Per-key GCRA state for the local engine.
///
/// Safe for concurrent use: decisions are committed with a
/// compare-and-swap, so two callers on the same key are serialized without
/// holding a lock.
#[derive(Debug, Default)]
pub struct GcraState {
    tat: AtomicU64,
}

impl GcraState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored theoretical arrival time, 0 when nothing was admitted yet.
    pub fn tat(&self) -> u64 {
        self.tat.load(Ordering::Acquire)
    }

    /// Evaluate and, when allowed, commit one request.
    ///
    /// Denials never write. Each failed exchange means another caller
    /// committed in between, so the decision is recomputed on the fresh TAT
    /// at most `max_attempts` times.
    pub fn admit(
        &self,
        gcra: &Gcra,
        now: u64,
        cost: u64,
        max_attempts: u32,
    ) -> Result<Verdict, CasExhausted> {
        let mut prev = self.tat.load(Ordering::Acquire);
        for _ in 0..max_attempts {
            let verdict = gcra.evaluate(prev, now, cost);
            let new_tat = match verdict {
                Verdict::Allow { tat } => tat,
                Verdict::Deny { .. } => return Ok(verdict),
            };
            match self
                .tat
                .compare_exchange_weak(prev, new_tat, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(verdict),
                Err(current) => prev = current,
            }
        }
        Err(CasExhausted {
            attempts: max_attempts,
        })
    }
}
