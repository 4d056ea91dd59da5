//! The public rate limiter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::backend::{Decision, RateLimiterBackend, RateSpec};
use super::local::LocalGcra;
use super::release::Release;
use super::remote_gcra::RemoteGcra;
use super::sliding_window::SlidingWindowLog;
use crate::config::{BackendKind, RatekeeperConfig};
use crate::error::{RatekeeperError, Result};
use crate::metrics::{MetricsSink, NoopMetrics, TimingTags, TracingMetrics, ALLOW_TIMING};
use crate::store::{RedisStore, ScriptStore};

/// The backend a [`Limiter`] dispatches to, fixed at construction.
pub enum Engine {
    Local(LocalGcra),
    RemoteGcra(RemoteGcra),
    SlidingWindow(SlidingWindowLog),
}

#[async_trait]
impl RateLimiterBackend for Engine {
    fn algorithm(&self) -> &'static str {
        match self {
            Engine::Local(engine) => engine.algorithm(),
            Engine::RemoteGcra(engine) => engine.algorithm(),
            Engine::SlidingWindow(engine) => engine.algorithm(),
        }
    }

    async fn admit(&self, spec: &RateSpec<'_>, burst: u64) -> Result<Decision> {
        match self {
            Engine::Local(engine) => engine.admit(spec, burst).await,
            Engine::RemoteGcra(engine) => engine.admit(spec, burst).await,
            Engine::SlidingWindow(engine) => engine.admit(spec, burst).await,
        }
    }
}

/// Enforces "at most `rate` cost units per `window` seconds per key".
///
/// A limiter is bound to exactly one backend and is immutable once built.
/// It is cheap to clone and safe to share across tasks; clones share the
/// backend state.
#[derive(Clone)]
pub struct Limiter {
    engine: Arc<Engine>,
    burst: Option<u64>,
    deadline: Option<Duration>,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("algorithm", &self.algorithm())
            .field("burst", &self.burst)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::local()
    }
}

impl Limiter {
    /// Create a limiter around an engine.
    pub fn new(engine: Engine) -> Self {
        Self {
            engine: Arc::new(engine),
            burst: None,
            deadline: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// In-process GCRA limiter.
    pub fn local() -> Self {
        Self::new(Engine::Local(LocalGcra::new()))
    }

    /// GCRA limiter coordinated through `store`.
    pub fn remote_gcra(store: Arc<dyn ScriptStore>) -> Self {
        Self::new(Engine::RemoteGcra(RemoteGcra::new(store)))
    }

    /// Sliding-window-log limiter coordinated through `store`.
    pub fn sliding_window(store: Arc<dyn ScriptStore>) -> Self {
        Self::new(Engine::SlidingWindow(SlidingWindowLog::new(store)))
    }

    /// Build a limiter from configuration, connecting to Redis if the
    /// backend needs it.
    pub async fn from_config(config: &RatekeeperConfig) -> Result<Self> {
        config.validate()?;
        let backend = &config.backend;

        let engine = match backend.kind {
            BackendKind::Local => Engine::Local(LocalGcra::new()),
            BackendKind::RedisGcra | BackendKind::RedisSlidingWindow => {
                let url = backend
                    .redis_url
                    .as_deref()
                    .ok_or_else(|| RatekeeperError::Config("redis_url is required".to_string()))?;
                let store: Arc<dyn ScriptStore> = Arc::new(RedisStore::connect(url).await?);
                if backend.kind == BackendKind::RedisGcra {
                    Engine::RemoteGcra(RemoteGcra::new(store).with_key_prefix(&backend.key_prefix))
                } else {
                    Engine::SlidingWindow(
                        SlidingWindowLog::new(store).with_key_prefix(&backend.key_prefix),
                    )
                }
            }
        };

        let mut limiter = Self::new(engine);
        limiter.burst = config.limiter.burst;
        limiter.deadline = config.limiter.deadline();
        if config.limiter.timing_events {
            limiter.metrics = Arc::new(TracingMetrics);
        }
        Ok(limiter)
    }

    /// Use a fixed burst instead of each call's rate.
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    /// Record call timings to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Abort calls that take longer than `deadline`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Name of the backend algorithm.
    pub fn algorithm(&self) -> &'static str {
        self.engine.algorithm()
    }

    /// Try to consume `cost` units of `rate` per `window` seconds for `key`.
    ///
    /// Returns whether the call was admitted and a handle refunding the
    /// consumed units (a no-op unless the backend supports it).
    pub async fn allow(&self, cost: i64, rate: i64, window: i64, key: &str) -> Result<(bool, Release)> {
        let decision = self.allow_after(cost, rate, window, key).await?;
        Ok((decision.allowed, decision.release))
    }

    /// Like [`allow`](Self::allow), also reporting how long to wait before
    /// retrying when the call is denied.
    pub async fn allow_after(&self, cost: i64, rate: i64, window: i64, key: &str) -> Result<Decision> {
        let spec = RateSpec::new(cost, rate, window, key)?;
        let burst = self.burst.unwrap_or(spec.rate);
        let algorithm = self.engine.algorithm();

        let started = Instant::now();
        let result = match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.engine.admit(&spec, burst))
                .await
                .unwrap_or_else(|_| {
                    Err(RatekeeperError::Cancelled {
                        elapsed: started.elapsed(),
                    })
                }),
            None => self.engine.admit(&spec, burst).await,
        };
        let elapsed = started.elapsed();

        self.metrics.record_timing(
            ALLOW_TIMING,
            &TimingTags {
                key,
                algorithm,
                rate: spec.rate,
                window: spec.window,
            },
            elapsed,
        );

        match &result {
            Ok(decision) if !decision.allowed => debug!(
                key = %key,
                algorithm,
                cost = spec.cost,
                rate = spec.rate,
                window = spec.window,
                retry_after = ?decision.retry_after,
                "Rate limit exceeded"
            ),
            Ok(_) => {}
            Err(e) => warn!(key = %key, algorithm, error = %e, "Rate limit check failed"),
        }

        result
    }
}
