//! Change-detection snapshots of dashboard reads.
//!
//! A snapshot is a reduced, comparable projection of a full data fetch:
//! only scalar top-level fields are kept. The batch refresher compares the
//! new projection with the stored one to decide whether a refresh produced
//! materially new data worth notifying about.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::store::TtlStore;
use crate::AccountKey;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub fields: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Snapshot {
    /// Project a full fetch into the comparable form. Arrays and nested
    /// objects are dropped; only scalars participate in change detection.
    pub fn project(data: &Value) -> Self {
        let mut fields = BTreeMap::new();
        if let Some(object) = data.as_object() {
            for (name, value) in object {
                if value.is_string() || value.is_number() || value.is_boolean() {
                    fields.insert(name.clone(), value.clone());
                }
            }
        }
        Self {
            fields,
            timestamp: Utc::now(),
        }
    }

    pub fn differs_from(&self, other: &Snapshot) -> bool {
        self.fields != other.fields
    }
}

/// Snapshot persistence, same fail-open posture as the credential cache.
#[derive(Clone)]
pub struct SnapshotStore {
    store: Arc<dyn TtlStore>,
    ttl: Duration,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn TtlStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn storage_key(key: &AccountKey) -> String {
        format!("account:{}:snapshot", key)
    }

    pub async fn get(&self, key: &AccountKey) -> Option<Snapshot> {
        let raw = match self.store.get(&Self::storage_key(key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(error) => {
                warn!(account = %key, error = %error, "snapshot read failed, treating as miss");
                return None;
            }
        };
        serde_json::from_slice(&raw).ok()
    }

    /// Supersedes any previous snapshot for the account.
    pub async fn put(&self, key: &AccountKey, snapshot: &Snapshot) {
        let raw = match serde_json::to_vec(snapshot) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(account = %key, error = %error, "failed to serialize snapshot");
                return;
            }
        };
        if let Err(error) = self.store.set(&Self::storage_key(key), &raw, self.ttl).await {
            warn!(account = %key, error = %error, "failed to store snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTtlStore;
    use serde_json::json;

    #[test]
    fn projection_keeps_only_scalars() {
        let data = json!({
            "balance": 42.5,
            "plan": "premium",
            "active": true,
            "entries": [1, 2, 3],
            "nested": {"a": 1}
        });
        let snapshot = Snapshot::project(&data);
        assert_eq!(snapshot.fields.len(), 3);
        assert!(snapshot.fields.contains_key("balance"));
        assert!(!snapshot.fields.contains_key("entries"));
        assert!(!snapshot.fields.contains_key("nested"));
    }

    #[test]
    fn differs_ignores_timestamp() {
        let a = Snapshot::project(&json!({"plan": "basic"}));
        let mut b = Snapshot::project(&json!({"plan": "basic"}));
        b.timestamp = b.timestamp + chrono::Duration::hours(1);
        assert!(!a.differs_from(&b));

        let c = Snapshot::project(&json!({"plan": "premium"}));
        assert!(a.differs_from(&c));
    }

    #[tokio::test]
    async fn store_roundtrip_supersedes() {
        let snapshots =
            SnapshotStore::new(Arc::new(MemoryTtlStore::new()), Duration::from_secs(3600));
        let key = AccountKey::new("acct-1");

        let first = Snapshot::project(&json!({"plan": "basic"}));
        snapshots.put(&key, &first).await;
        assert_eq!(snapshots.get(&key).await, Some(first.clone()));

        let second = Snapshot::project(&json!({"plan": "premium"}));
        snapshots.put(&key, &second).await;
        assert_eq!(snapshots.get(&key).await, Some(second));
    }
}
