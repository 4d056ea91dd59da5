//! Redis-backed [`ScriptStore`].
//!
//! Procedures are Lua scripts run with `EVALSHA` (falling back to `EVAL`
//! on a script cache miss), which Redis executes without interleaving
//! other commands.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script, Value};
use tracing::{debug, info, trace};

use super::{Procedure, ScriptStore};
use crate::error::{RatekeeperError, Result};

const GCRA_SCRIPT: &str = include_str!("scripts/gcra.lua");
const SLIDING_WINDOW_SCRIPT: &str = include_str!("scripts/sliding_window.lua");

/// A [`ScriptStore`] talking to a Redis server.
///
/// Cloning is cheap; clones share the underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    gcra: Script,
    sliding_window: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("gcra_sha", &self.gcra.get_hash())
            .field("sliding_window_sha", &self.sliding_window.get_hash())
            .finish()
    }
}

impl RedisStore {
    /// Connect to the Redis server at `url` and verify it answers.
    pub async fn connect(url: &str) -> Result<Self> {
        info!(url = %url, "Connecting to Redis");

        let client = Client::open(url)
            .map_err(|e| RatekeeperError::Config(format!("invalid Redis URL {}: {}", url, e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| RatekeeperError::transport("connect", e))?;

        let store = Self::new(conn);
        store.ping().await?;

        info!("Redis connection established");
        Ok(store)
    }

    /// Wrap an existing connection.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            gcra: Script::new(GCRA_SCRIPT),
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
        }
    }

    /// Round-trip a `PING`.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let reply: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RatekeeperError::transport("ping", e))?;

        if reply != "PONG" {
            return Err(RatekeeperError::protocol(
                "ping",
                format!("expected PONG, got {:?}", reply),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ScriptStore for RedisStore {
    async fn invoke(&self, key: &str, procedure: &Procedure) -> Result<Value> {
        let mut conn = self.conn.clone();

        let invocation = match procedure {
            Procedure::Gcra {
                burst,
                rate,
                window,
                cost,
            } => {
                let mut invocation = self.gcra.prepare_invoke();
                invocation.key(key).arg(*burst).arg(*rate).arg(*window).arg(*cost);
                invocation
            }
            Procedure::SlidingWindow {
                rate,
                window,
                cost,
                member_prefix,
            } => {
                let mut invocation = self.sliding_window.prepare_invoke();
                invocation
                    .key(key)
                    .arg(*rate)
                    .arg(*window)
                    .arg(*cost)
                    .arg(member_prefix.as_str());
                invocation
            }
        };

        trace!(key = %key, procedure = procedure.name(), "Invoking Redis script");

        let reply: Value = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RatekeeperError::transport(procedure.name(), e))?;

        Ok(reply)
    }

    async fn remove_members(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("ZREM")
            .arg(key)
            .arg(members)
            .query_async(&mut conn)
            .await
            .map_err(|e| RatekeeperError::transport("release", e))?;

        debug!(key = %key, requested = members.len(), removed, "Removed reserved members");
        Ok(removed)
    }
}
