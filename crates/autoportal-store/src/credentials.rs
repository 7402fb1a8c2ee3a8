//! Per-account credential bundle cache.
//!
//! A bundle is the opaque artifact set produced by a successful login
//! (typically session cookies). Freshness is judged by the explicit
//! `expires_at` timestamp, independent of the store-level TTL, so a bundle
//! that outlived its session is never handed to the cheap path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::TtlStore;
use crate::AccountKey;

/// One named artifact inside a bundle (cookie name/value plus attributes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialItem {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl CredentialItem {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            attributes: BTreeMap::new(),
        }
    }
}

/// Authentication artifact set for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialBundle {
    pub items: Vec<CredentialItem>,
    pub expires_at: Option<DateTime<Utc>>,
    pub saved_at: DateTime<Utc>,
}

impl CredentialBundle {
    pub fn new(items: Vec<CredentialItem>) -> Self {
        Self {
            items,
            expires_at: None,
            saved_at: Utc::now(),
        }
    }

    pub fn with_expiry(items: Vec<CredentialItem>, expires_at: DateTime<Utc>) -> Self {
        Self {
            items,
            expires_at: Some(expires_at),
            saved_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the bundle is still usable at `now`.
    ///
    /// Falls back to the earliest per-item `expires` attribute (RFC 3339)
    /// when no explicit expiry was recorded. A bundle with neither is
    /// treated as stale.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        if let Some(expires_at) = self.expires_at {
            return expires_at > now;
        }

        let earliest = self
            .items
            .iter()
            .filter_map(|item| item.attributes.get("expires"))
            .filter_map(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
            .min();

        match earliest {
            Some(expiry) => expiry > now,
            None => false,
        }
    }
}

/// Credential cache keyed by account, built on [`TtlStore`].
///
/// Store failures are swallowed: a failed read is a miss and a failed write
/// is logged and dropped, pushing callers onto the expensive path instead
/// of failing them.
#[derive(Clone)]
pub struct CredentialCache {
    store: Arc<dyn TtlStore>,
    ttl: Duration,
}

impl CredentialCache {
    pub fn new(store: Arc<dyn TtlStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn storage_key(key: &AccountKey) -> String {
        format!("account:{}:credentials", key)
    }

    pub async fn get(&self, key: &AccountKey) -> Option<CredentialBundle> {
        let raw = match self.store.get(&Self::storage_key(key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(error) => {
                warn!(account = %key, error = %error, "credential store read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_slice::<CredentialBundle>(&raw) {
            Ok(bundle) if !bundle.is_empty() => Some(bundle),
            Ok(_) => None,
            Err(error) => {
                warn!(account = %key, error = %error, "stored credential bundle is unreadable");
                None
            }
        }
    }

    /// Persist a bundle, superseding any previous entry.
    ///
    /// Empty bundles are never persisted; the previous entry (if any) stays
    /// in place. The old entry is deleted before the new write, not merged.
    pub async fn put(&self, key: &AccountKey, bundle: &CredentialBundle) {
        if bundle.is_empty() {
            debug!(account = %key, "refusing to cache empty credential bundle");
            return;
        }

        let raw = match serde_json::to_vec(bundle) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(account = %key, error = %error, "failed to serialize credential bundle");
                return;
            }
        };

        let storage_key = Self::storage_key(key);
        if let Err(error) = self.store.delete(&storage_key).await {
            warn!(account = %key, error = %error, "failed to delete superseded credentials");
        }
        if let Err(error) = self.store.set(&storage_key, &raw, self.ttl).await {
            warn!(account = %key, error = %error, "failed to cache credential bundle");
        } else {
            debug!(account = %key, items = bundle.items.len(), "credential bundle cached");
        }
    }

    /// Explicit delete, used before a forced batch refresh so nothing reads
    /// stale data mid-run.
    pub async fn invalidate(&self, key: &AccountKey) {
        if let Err(error) = self.store.delete(&Self::storage_key(key)).await {
            warn!(account = %key, error = %error, "failed to invalidate credentials");
        }
    }
}
