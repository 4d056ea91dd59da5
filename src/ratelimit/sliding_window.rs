//! Redis-coordinated sliding-window-log backend.
//!
//! Every admitted unit is one sorted-set member scored by admission time.
//! Because the procedure reports exactly which members it inserted, an
//! admission can later be refunded through its [`Release`] handle.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;
use uuid::Uuid;

use super::backend::{Decision, RateLimiterBackend, RateSpec};
use super::release::Release;
use super::reply::{parse_reply, violation};
use crate::error::Result;
use crate::store::{Procedure, ScriptStore};

pub struct SlidingWindowLog {
    store: Arc<dyn ScriptStore>,
    key_prefix: String,
}

impl SlidingWindowLog {
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
impl RateLimiterBackend for SlidingWindowLog {
    fn algorithm(&self) -> &'static str {
        "redis_sliding_window"
    }

    /// The log has no burst beyond `rate` itself, so `burst` is unused.
    async fn admit(&self, spec: &RateSpec<'_>, _burst: u64) -> Result<Decision> {
        let key = format!("{}{}", self.key_prefix, spec.key);
        let procedure = Procedure::SlidingWindow {
            rate: spec.rate,
            window: spec.window,
            cost: spec.cost,
            member_prefix: Uuid::new_v4().to_string(),
        };

        let value = self.store.invoke(&key, &procedure).await?;
        let reply = parse_reply(procedure.name(), value, true)?;

        trace!(
            key = %key,
            allowed = reply.allowed,
            inserted = reply.members.len(),
            observed_at = ?reply.observed_at,
            retry_after = ?reply.retry_after,
            "Sliding window decided"
        );

        if !reply.allowed {
            if !reply.members.is_empty() {
                return Err(violation(
                    procedure.name(),
                    format!("denied reply carries {} members", reply.members.len()),
                ));
            }
            return Ok(Decision::denied(reply.retry_after));
        }

        if reply.members.len() as u64 != spec.cost {
            return Err(violation(
                procedure.name(),
                format!(
                    "admitted {} units but reported {} members",
                    spec.cost,
                    reply.members.len()
                ),
            ));
        }

        let release = Release::from_parts(Arc::clone(&self.store), key, reply.members);
        Ok(Decision::allowed(release))
    }
}
