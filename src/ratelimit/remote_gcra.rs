//! Redis-coordinated GCRA backend.
//!
//! The TAT lives in the store and every decision is one atomic procedure,
//! so callers in any number of processes see a single serialized schedule.
//! Admissions are final; the release handle is always a no-op.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::backend::{Decision, RateLimiterBackend, RateSpec};
use super::release::Release;
use super::reply::parse_reply;
use crate::error::Result;
use crate::store::{Procedure, ScriptStore};

pub struct RemoteGcra {
    store: Arc<dyn ScriptStore>,
    key_prefix: String,
}

impl RemoteGcra {
    pub fn new(store: Arc<dyn ScriptStore>) -> Self {
        Self {
            store,
            key_prefix: String::new(),
        }
    }

    /// Namespace every store key with `prefix`.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

#[async_trait]
impl RateLimiterBackend for RemoteGcra {
    fn algorithm(&self) -> &'static str {
        "redis_gcra"
    }

    async fn admit(&self, spec: &RateSpec<'_>, burst: u64) -> Result<Decision> {
        let key = format!("{}{}", self.key_prefix, spec.key);
        let procedure = Procedure::Gcra {
            burst,
            rate: spec.rate,
            window: spec.window,
            cost: spec.cost,
        };

        let value = self.store.invoke(&key, &procedure).await?;
        let reply = parse_reply(procedure.name(), value, false)?;

        trace!(
            key = %key,
            allowed = reply.allowed,
            observed_at = ?reply.observed_at,
            retry_after = ?reply.retry_after,
            "Remote GCRA decided"
        );

        if reply.allowed {
            Ok(Decision::allowed(Release::noop()))
        } else {
            Ok(Decision::denied(reply.retry_after))
        }
    }
}
