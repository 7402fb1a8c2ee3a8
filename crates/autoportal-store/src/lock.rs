//! Advisory per-account refresh lock.
//!
//! A lease built on the store's atomic conditional set. The lock exists to
//! avoid wasted duplicate refresh work between a foreground request and the
//! scheduled batch run; it is not a hard mutual exclusion. Callers that
//! fail to acquire proceed anyway in degraded mode, and the credential
//! cache's overwrite semantics keep the final state correct.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::TtlStore;
use crate::AccountKey;

pub struct RefreshLock {
    store: Arc<dyn TtlStore>,
    lease: Duration,
}

impl RefreshLock {
    pub fn new(store: Arc<dyn TtlStore>, lease: Duration) -> Self {
        Self { store, lease }
    }

    fn storage_key(key: &AccountKey) -> String {
        format!("account:{}:lock", key)
    }

    /// Try to take the lease. Returns `false` when another holder is live
    /// or the store is unreachable; the caller must not block on this.
    ///
    /// The lease self-expires after the configured duration, bounding the
    /// damage of a crashed holder.
    pub async fn acquire(&self, key: &AccountKey) -> bool {
        let holder = Uuid::new_v4();
        match self
            .store
            .set_if_absent(&Self::storage_key(key), holder.as_bytes(), self.lease)
            .await
        {
            Ok(acquired) => {
                debug!(account = %key, acquired, "refresh lock attempt");
                acquired
            }
            Err(error) => {
                warn!(account = %key, error = %error, "refresh lock store unreachable, proceeding unlocked");
                false
            }
        }
    }

    /// Best-effort release; failures are swallowed. A missed release is
    /// healed by lease expiry.
    pub async fn release(&self, key: &AccountKey) {
        if let Err(error) = self.store.delete(&Self::storage_key(key)).await {
            warn!(account = %key, error = %error, "refresh lock release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTtlStore;

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let lock = RefreshLock::new(Arc::new(MemoryTtlStore::new()), Duration::from_secs(5));
        let key = AccountKey::new("acct-1");

        assert!(lock.acquire(&key).await);
        assert!(!lock.acquire(&key).await);

        lock.release(&key).await;
        assert!(lock.acquire(&key).await);
    }

    #[tokio::test]
    async fn lease_expires_without_release() {
        let lock = RefreshLock::new(Arc::new(MemoryTtlStore::new()), Duration::from_millis(50));
        let key = AccountKey::new("acct-1");

        assert!(lock.acquire(&key).await);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(lock.acquire(&key).await);
    }

    struct FailingTtlStore;

    #[async_trait::async_trait]
    impl TtlStore for FailingTtlStore {
        async fn get(&self, _key: &str) -> anyhow::Result<Option<Vec<u8>>> {
            anyhow::bail!("store offline")
        }

        async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> anyhow::Result<()> {
            anyhow::bail!("store offline")
        }

        async fn set_if_absent(
            &self,
            _key: &str,
            _value: &[u8],
            _ttl: Duration,
        ) -> anyhow::Result<bool> {
            anyhow::bail!("store offline")
        }

        async fn delete(&self, _key: &str) -> anyhow::Result<()> {
            anyhow::bail!("store offline")
        }
    }

    #[tokio::test]
    async fn unreachable_store_reads_as_busy() {
        let lock = RefreshLock::new(Arc::new(FailingTtlStore), Duration::from_secs(5));
        let key = AccountKey::new("acct-1");

        // The caller proceeds unlocked; release is swallowed too.
        assert!(!lock.acquire(&key).await);
        lock.release(&key).await;
    }

    #[tokio::test]
    async fn locks_are_per_account() {
        let store = Arc::new(MemoryTtlStore::new());
        let lock = RefreshLock::new(store, Duration::from_secs(5));

        assert!(lock.acquire(&AccountKey::new("a")).await);
        assert!(lock.acquire(&AccountKey::new("b")).await);
    }
}
