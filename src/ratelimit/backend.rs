//! Backend trait for abstracting local and distributed implementations.

use std::time::Duration;

use async_trait::async_trait;

use super::release::Release;
use crate::error::{Result, ValidationError};

/// Validated arguments of one rate-limit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSpec<'a> {
    /// Units consumed by this call
    pub cost: u64,
    /// Units allowed per window
    pub rate: u64,
    /// Window length in seconds
    pub window: u64,
    /// The rate-limited key
    pub key: &'a str,
}

impl<'a> RateSpec<'a> {
    /// Validate raw arguments, checking cost, rate, window and key in that
    /// order.
    pub fn new(cost: i64, rate: i64, window: i64, key: &'a str) -> std::result::Result<Self, ValidationError> {
        if cost < 1 {
            return Err(ValidationError::Cost);
        }
        if rate < 1 {
            return Err(ValidationError::Rate);
        }
        if window < 1 {
            return Err(ValidationError::Window);
        }
        if key.is_empty() {
            return Err(ValidationError::Key);
        }
        Ok(Self {
            cost: cost as u64,
            rate: rate as u64,
            window: window as u64,
            key,
        })
    }

    pub fn window_duration(&self) -> Duration {
        Duration::from_secs(self.window)
    }
}

/// Outcome of a rate-limit call.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Whether the call was admitted (and its cost consumed)
    pub allowed: bool,
    /// How long to wait before the same call could be admitted; zero when allowed
    pub retry_after: Duration,
    /// Refund handle; a no-op unless the backend supports compensation
    pub release: Release,
}

impl Decision {
    pub fn allowed(release: Release) -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
            release,
        }
    }

    pub fn denied(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
            release: Release::noop(),
        }
    }
}

/// Trait for rate limiter implementations.
///
/// Each backend admits or denies one validated request and consumes quota
/// only when it admits.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Algorithm name used in logs and timing tags.
    fn algorithm(&self) -> &'static str;

    /// Decide on `spec`, allowing `burst` units on top of steady pacing
    /// where the algorithm has a notion of burst.
    async fn admit(&self, spec: &RateSpec<'_>, burst: u64) -> Result<Decision>;
}
