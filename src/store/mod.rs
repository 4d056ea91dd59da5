//! Remote state for the distributed backends.
//!
//! A [`ScriptStore`] runs a rate-limit [`Procedure`] atomically against one
//! key and hands back the raw structured reply; the backends in
//! [`crate::ratelimit`] interpret it. Any store with atomic multi-step
//! execution can implement the contract: [`RedisStore`] does it with Lua,
//! [`MemoryStore`] with a mutex.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;

use crate::error::Result;

/// Raw reply of a procedure.
pub use redis::Value;

/// An atomic server-side rate-limit procedure and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Procedure {
    /// GCRA check-and-update.
    ///
    /// Reply: `[now_us, allowed, retry_after_us]`.
    Gcra {
        burst: u64,
        rate: u64,
        window: u64,
        cost: u64,
    },
    /// Sliding-window log prune, count and conditional insert.
    ///
    /// Reply: `[now_us, allowed, retry_after_us, [member, ...]]`.
    SlidingWindow {
        rate: u64,
        window: u64,
        cost: u64,
        member_prefix: String,
    },
}

impl Procedure {
    pub fn name(&self) -> &'static str {
        match self {
            Procedure::Gcra { .. } => "gcra",
            Procedure::SlidingWindow { .. } => "sliding_window",
        }
    }
}

/// Store capability consumed by the remote backends.
#[async_trait]
pub trait ScriptStore: Send + Sync + std::fmt::Debug {
    /// Run `procedure` atomically against `key`.
    async fn invoke(&self, key: &str, procedure: &Procedure) -> Result<Value>;

    /// Remove the named members from the sorted set at `key`.
    ///
    /// Returns how many were actually present. Absent members are not an
    /// error.
    async fn remove_members(&self, key: &str, members: &[String]) -> Result<u64>;
}
