//! Compensation handles.
//!
//! A [`Release`] is bound to the exact sorted-set members written by one
//! admission. Releasing removes those members and nothing else, so it is a
//! true refund even while other callers keep adding and removing entries on
//! the same key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::Result;
use crate::store::ScriptStore;

struct Reservation {
    store: Arc<dyn ScriptStore>,
    key: String,
    members: Vec<String>,
    released: AtomicBool,
}

/// Handle that refunds the quota consumed by one admission.
///
/// Backends without compensation, and denied calls, hand out a no-op
/// handle so callers can release unconditionally. Clones share state: once
/// any clone has released, the others are no-ops too.
#[derive(Clone, Default)]
pub struct Release {
    inner: Option<Arc<Reservation>>,
}

impl std::fmt::Debug for Release {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            None => f.write_str("Release(noop)"),
            Some(reservation) => f
                .debug_struct("Release")
                .field("key", &reservation.key)
                .field("members", &reservation.members)
                .field("released", &reservation.released.load(Ordering::Relaxed))
                .finish(),
        }
    }
}

impl Release {
    /// A handle that does nothing.
    pub fn noop() -> Self {
        Self { inner: None }
    }

    /// Bind a handle to `members` of the sorted set at `key`.
    ///
    /// This is also how a different task or process that learned the key
    /// and member ids rebuilds a handle for them.
    pub fn from_parts(store: Arc<dyn ScriptStore>, key: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            inner: Some(Arc::new(Reservation {
                store,
                key: key.into(),
                members,
                released: AtomicBool::new(false),
            })),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }

    /// Whether a release through this handle (or a clone) has completed.
    pub fn is_released(&self) -> bool {
        self.inner
            .as_ref()
            .map_or(false, |r| r.released.load(Ordering::Acquire))
    }

    /// Store key the reservation lives under.
    pub fn key(&self) -> Option<&str> {
        self.inner.as_ref().map(|r| r.key.as_str())
    }

    /// Member ids the reservation holds.
    pub fn members(&self) -> &[String] {
        match &self.inner {
            Some(reservation) => &reservation.members,
            None => &[],
        }
    }

    /// Give the reserved units back.
    ///
    /// Releasing twice is harmless: the second call returns without touching
    /// the store. A failed release leaves the handle reserved so it can be
    /// retried. Members already pruned by the window are simply absent.
    pub async fn release(&self) -> Result<()> {
        let Some(reservation) = &self.inner else {
            return Ok(());
        };

        if reservation.released.load(Ordering::Acquire) {
            trace!(key = %reservation.key, "Reservation already released");
            return Ok(());
        }

        let removed = reservation
            .store
            .remove_members(&reservation.key, &reservation.members)
            .await?;
        reservation.released.store(true, Ordering::Release);

        debug!(
            key = %reservation.key,
            reserved = reservation.members.len(),
            removed,
            "Released reservation"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Procedure};
    use tokio_test::assert_ok;

    async fn reserve(store: &Arc<MemoryStore>, key: &str, cost: u64, prefix: &str) -> Vec<String> {
        let procedure = Procedure::SlidingWindow {
            rate: 100,
            window: 60,
            cost,
            member_prefix: prefix.to_string(),
        };
        store.invoke(key, &procedure).await.unwrap();
        (1..=cost).map(|i| format!("{}:{}", prefix, i)).collect()
    }

    #[tokio::test]
    async fn test_noop_release() {
        let release = Release::noop();
        assert!(release.is_noop());
        assert_ok!(release.release().await);
        assert!(!release.is_released());
        assert!(release.members().is_empty());
        assert_eq!(release.key(), None);
    }

    #[tokio::test]
    async fn test_release_removes_only_its_members() {
        let store = Arc::new(MemoryStore::new());
        let mine = reserve(&store, "k", 3, "mine").await;
        reserve(&store, "k", 2, "theirs").await;

        let release = Release::from_parts(store.clone(), "k", mine);
        assert_ok!(release.release().await);

        assert!(release.is_released());
        assert_eq!(store.members("k"), vec!["theirs:1", "theirs:2"]);
    }

    #[tokio::test]
    async fn test_release_is_idempotent_across_clones() {
        let store = Arc::new(MemoryStore::new());
        let mine = reserve(&store, "k", 1, "mine").await;

        let release = Release::from_parts(store.clone(), "k", mine);
        let clone = release.clone();

        assert_ok!(release.release().await);
        let calls = store.invocations();

        assert!(clone.is_released());
        assert_ok!(clone.release().await);
        assert_eq!(store.invocations(), calls);
    }

    #[tokio::test]
    async fn test_release_after_members_expired() {
        let store = Arc::new(MemoryStore::new());
        let release = Release::from_parts(store.clone(), "gone", vec!["x:1".to_string()]);

        assert_ok!(release.release().await);
        assert!(release.is_released());
    }
}
