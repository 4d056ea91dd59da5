//! In-process [`ScriptStore`].
//!
//! Runs the same procedures as the Lua scripts, with the same replies, but
//! under a single mutex instead of inside Redis. Useful for embedding the
//! remote backends in one process and for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::Value;
use tracing::trace;

use super::{Procedure, ScriptStore};
use crate::clock::{Clock, SystemClock};
use crate::error::{RatekeeperError, Result};
use crate::ratelimit::{Gcra, Verdict};

enum Slot {
    Tat {
        tat: u64,
        expires_at: u64,
    },
    Log {
        /// `(admitted_at, member)` in admission order.
        entries: Vec<(u64, String)>,
        expires_at: u64,
    },
}

impl Slot {
    fn expires_at(&self) -> u64 {
        match self {
            Slot::Tat { expires_at, .. } | Slot::Log { expires_at, .. } => *expires_at,
        }
    }
}

/// A [`ScriptStore`] kept in memory.
#[derive(Debug)]
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<String, Slot>>,
    invocations: AtomicU64,
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::Tat { tat, .. } => write!(f, "Tat({})", tat),
            Slot::Log { entries, .. } => write!(f, "Log({} entries)", entries.len()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            slots: Mutex::new(HashMap::new()),
            invocations: AtomicU64::new(0),
        }
    }

    /// Number of live entries in the sorted set at `key` (`ZCARD`).
    pub fn cardinality(&self, key: &str) -> usize {
        let now = self.now();
        match self.slots.lock().get(key) {
            Some(Slot::Log {
                entries,
                expires_at,
            }) if *expires_at > now => entries.len(),
            _ => 0,
        }
    }

    /// Members of the sorted set at `key`, oldest first.
    pub fn members(&self, key: &str) -> Vec<String> {
        let now = self.now();
        match self.slots.lock().get(key) {
            Some(Slot::Log {
                entries,
                expires_at,
            }) if *expires_at > now => entries.iter().map(|(_, m)| m.clone()).collect(),
            _ => Vec::new(),
        }
    }

    /// How many procedures and removals this store has served.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    fn now(&self) -> u64 {
        nanos(self.clock.now())
    }

    fn run_gcra(
        &self,
        slots: &mut HashMap<String, Slot>,
        key: &str,
        now: u64,
        gcra: Gcra,
        cost: u64,
    ) -> Result<Value> {
        let tat = match slots.get(key) {
            Some(Slot::Tat { tat, .. }) => *tat,
            Some(Slot::Log { .. }) => return Err(wrong_type("gcra")),
            None => 0,
        };

        match gcra.evaluate(tat, now, cost) {
            Verdict::Allow { tat } => {
                slots.insert(
                    key.to_string(),
                    Slot::Tat {
                        tat,
                        expires_at: tat.max(now.saturating_add(1)),
                    },
                );
                Ok(reply(now, true, 0, None))
            }
            Verdict::Deny { retry_after } => Ok(reply(now, false, retry_after, None)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_sliding_window(
        &self,
        slots: &mut HashMap<String, Slot>,
        key: &str,
        now: u64,
        rate: u64,
        window: u64,
        cost: u64,
        member_prefix: &str,
    ) -> Result<Value> {
        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot::Log {
            entries: Vec::new(),
            expires_at: 0,
        });
        let (entries, expires_at) = match slot {
            Slot::Log {
                entries,
                expires_at,
            } => (entries, expires_at),
            Slot::Tat { .. } => return Err(wrong_type("sliding_window")),
        };

        let cutoff = now.saturating_sub(window);
        entries.retain(|(at, _)| *at > cutoff);

        let count = entries.len() as u64;
        if count + cost > rate {
            let retry_after = if cost > rate {
                window
            } else {
                let need = (count + cost - rate) as usize;
                entries[need - 1].0.saturating_add(window).saturating_sub(now)
            };
            return Ok(reply(now, false, retry_after, Some(Vec::new())));
        }

        let members: Vec<String> = (1..=cost)
            .map(|i| format!("{}:{}", member_prefix, i))
            .collect();
        entries.extend(members.iter().map(|m| (now, m.clone())));
        *expires_at = now.saturating_add(window);

        Ok(reply(now, true, 0, Some(members)))
    }
}

#[async_trait]
impl ScriptStore for MemoryStore {
    async fn invoke(&self, key: &str, procedure: &Procedure) -> Result<Value> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.slots.lock();
        // Read under the lock so entries are appended in time order.
        let now = self.now();

        if slots.get(key).map_or(false, |slot| slot.expires_at() <= now) {
            slots.remove(key);
        }

        trace!(key = %key, procedure = procedure.name(), "Invoking in-memory procedure");

        match procedure {
            Procedure::Gcra {
                burst,
                rate,
                window,
                cost,
            } => {
                let gcra = Gcra::from_window(*rate, Duration::from_secs(*window), *burst);
                self.run_gcra(&mut slots, key, now, gcra, *cost)
            }
            Procedure::SlidingWindow {
                rate,
                window,
                cost,
                member_prefix,
            } => {
                let window = nanos(Duration::from_secs(*window));
                self.run_sliding_window(&mut slots, key, now, *rate, window, *cost, member_prefix)
            }
        }
    }

    async fn remove_members(&self, key: &str, members: &[String]) -> Result<u64> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.slots.lock();

        match slots.get_mut(key) {
            Some(Slot::Log { entries, .. }) => {
                let before = entries.len();
                entries.retain(|(_, member)| !members.contains(member));
                Ok((before - entries.len()) as u64)
            }
            Some(Slot::Tat { .. }) => Err(wrong_type("release")),
            None => Ok(0),
        }
    }
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Nanoseconds to whole microseconds, rounding up so a pending wait never
/// reads as zero.
fn micros_ceil(n: u64) -> i64 {
    (n / 1_000 + u64::from(n % 1_000 != 0)) as i64
}

fn reply(now: u64, allowed: bool, retry_after: u64, members: Option<Vec<String>>) -> Value {
    let mut items = vec![
        Value::Int((now / 1_000) as i64),
        Value::Int(i64::from(allowed)),
        Value::Int(micros_ceil(retry_after)),
    ];
    if let Some(members) = members {
        items.push(Value::Array(
            members
                .into_iter()
                .map(|m| Value::BulkString(m.into_bytes()))
                .collect(),
        ));
    }
    Value::Array(items)
}

fn wrong_type(procedure: &'static str) -> RatekeeperError {
    RatekeeperError::transport(
        procedure,
        redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "WRONGTYPE",
            "Operation against a key holding the wrong kind of value".to_string(),
        )),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tokio_test::{assert_err, assert_ok};

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::starting_at(Duration::from_secs(1_000));
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    fn sliding(rate: u64, cost: u64, prefix: &str) -> Procedure {
        Procedure::SlidingWindow {
            rate,
            window: 10,
            cost,
            member_prefix: prefix.to_string(),
        }
    }

    #[tokio::test]
    async fn test_gcra_reply_shape() {
        let (store, _clock) = store();
        let procedure = Procedure::Gcra {
            burst: 0,
            rate: 1,
            window: 1,
            cost: 1,
        };

        let allowed = assert_ok!(store.invoke("k", &procedure).await);
        assert_eq!(
            allowed,
            Value::Array(vec![Value::Int(1_000_000_000), Value::Int(1), Value::Int(0)])
        );

        let denied = assert_ok!(store.invoke("k", &procedure).await);
        assert_eq!(
            denied,
            Value::Array(vec![
                Value::Int(1_000_000_000),
                Value::Int(0),
                Value::Int(1_000_000)
            ])
        );
    }

    #[tokio::test]
    async fn test_gcra_state_expires_with_schedule() {
        let (store, clock) = store();
        let procedure = Procedure::Gcra {
            burst: 0,
            rate: 1,
            window: 1,
            cost: 1,
        };

        assert_ok!(store.invoke("k", &procedure).await);
        clock.advance(Duration::from_secs(1));
        let reply = assert_ok!(store.invoke("k", &procedure).await);
        assert_eq!(
            reply,
            Value::Array(vec![Value::Int(1_001_000_000), Value::Int(1), Value::Int(0)])
        );
    }

    #[tokio::test]
    async fn test_sliding_window_insert_and_deny() {
        let (store, clock) = store();

        let reply = assert_ok!(store.invoke("log", &sliding(3, 2, "a")).await);
        assert_eq!(
            reply,
            Value::Array(vec![
                Value::Int(1_000_000_000),
                Value::Int(1),
                Value::Int(0),
                Value::Array(vec![
                    Value::BulkString(b"a:1".to_vec()),
                    Value::BulkString(b"a:2".to_vec()),
                ]),
            ])
        );
        assert_eq!(store.cardinality("log"), 2);

        clock.advance(Duration::from_secs(4));
        assert_ok!(store.invoke("log", &sliding(3, 1, "b")).await);
        assert_eq!(store.members("log"), vec!["a:1", "a:2", "b:1"]);

        // Full: the first entry expires 6s from now.
        let reply = assert_ok!(store.invoke("log", &sliding(3, 1, "c")).await);
        assert_eq!(
            reply,
            Value::Array(vec![
                Value::Int(1_004_000_000),
                Value::Int(0),
                Value::Int(6_000_000),
                Value::Array(vec![]),
            ])
        );

        // Two units need both "a" entries gone, same instant.
        let reply = assert_ok!(store.invoke("log", &sliding(3, 2, "d")).await);
        assert_eq!(
            reply,
            Value::Array(vec![
                Value::Int(1_004_000_000),
                Value::Int(0),
                Value::Int(6_000_000),
                Value::Array(vec![]),
            ])
        );

        // Entries exactly one window old are pruned.
        clock.advance(Duration::from_secs(6));
        assert_ok!(store.invoke("log", &sliding(3, 1, "e")).await);
        assert_eq!(store.members("log"), vec!["b:1", "e:1"]);
    }

    #[tokio::test]
    async fn test_sliding_window_cost_above_rate() {
        let (store, _clock) = store();

        let reply = assert_ok!(store.invoke("log", &sliding(2, 3, "a")).await);
        assert_eq!(
            reply,
            Value::Array(vec![
                Value::Int(1_000_000_000),
                Value::Int(0),
                Value::Int(10_000_000),
                Value::Array(vec![]),
            ])
        );
    }

    #[tokio::test]
    async fn test_remove_members() {
        let (store, _clock) = store();
        assert_ok!(store.invoke("log", &sliding(5, 2, "a")).await);
        assert_ok!(store.invoke("log", &sliding(5, 1, "b")).await);

        let removed = assert_ok!(
            store
                .remove_members("log", &["a:1".to_string(), "a:2".to_string()])
                .await
        );
        assert_eq!(removed, 2);
        assert_eq!(store.members("log"), vec!["b:1"]);

        let removed = assert_ok!(store.remove_members("log", &["a:1".to_string()]).await);
        assert_eq!(removed, 0);

        let removed = assert_ok!(store.remove_members("missing", &["x".to_string()]).await);
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let (store, _clock) = store();
        let gcra = Procedure::Gcra {
            burst: 1,
            rate: 1,
            window: 1,
            cost: 1,
        };
        assert_ok!(store.invoke("k", &gcra).await);

        let err = assert_err!(store.invoke("k", &sliding(1, 1, "a")).await);
        assert!(matches!(err, RatekeeperError::Transport { procedure: "sliding_window", .. }));
        assert!(!err.is_retryable());
        assert_eq!(store.invocations(), 2);
    }

    #[tokio::test]
    async fn test_sliding_window_huge_window() {
        let (store, clock) = store();
        let procedure = Procedure::SlidingWindow {
            rate: 1,
            window: 20_000_000_000,
            cost: 1,
            member_prefix: "a".to_string(),
        };

        let reply = assert_ok!(store.invoke("log", &procedure).await);
        assert!(matches!(&reply, Value::Array(items) if items[1] == Value::Int(1)));

        clock.advance(Duration::from_secs(60));
        let reply = assert_ok!(store.invoke("log", &procedure).await);
        match reply {
            Value::Array(items) => {
                assert_eq!(items[1], Value::Int(0));
                assert!(matches!(items[2], Value::Int(retry) if retry > 0));
            }
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(store.cardinality("log"), 1);
    }

    /// Moves forward one microsecond on every read.
    #[derive(Debug, Default)]
    struct TickingClock(AtomicU64);

    impl Clock for TickingClock {
        fn now(&self) -> Duration {
            Duration::from_micros(1_000_000 + self.0.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_entries_stay_in_time_order() {
        let store = Arc::new(MemoryStore::with_clock(Arc::new(TickingClock::default())));

        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let procedure = Procedure::SlidingWindow {
                        rate: 1_000,
                        window: 60,
                        cost: 1,
                        member_prefix: format!("m{}", i),
                    };
                    store.invoke("log", &procedure).await
                })
            })
            .collect();
        for task in tasks {
            assert_ok!(assert_ok!(task.await));
        }

        let slots = store.slots.lock();
        match slots.get("log") {
            Some(Slot::Log { entries, .. }) => {
                assert_eq!(entries.len(), 64);
                assert!(entries.windows(2).all(|pair| pair[0].0 <= pair[1].0));
            }
            other => panic!("unexpected slot {:?}", other),
        }
    }
}
