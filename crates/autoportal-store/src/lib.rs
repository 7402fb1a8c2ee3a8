//! Autoportal storage layer.
//!
//! Shared TTL key-value abstraction plus the stateful components built on
//! top of it: the per-account credential cache, the advisory refresh lock
//! and the dashboard snapshot store.
//!
//! All consumers treat store unavailability as a cache miss (or a busy
//! lock), never as a fatal error. The system must keep functioning in
//! degraded mode when the store is fully down.

pub mod credentials;
pub mod lock;
pub mod snapshot;
pub mod store;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use credentials::{CredentialBundle, CredentialCache, CredentialItem};
pub use lock::RefreshLock;
pub use snapshot::{Snapshot, SnapshotStore};
pub use store::{MemoryTtlStore, RedbTtlStore, TtlStore};

/// Stable identifier for one end-user's managed portal account.
///
/// Sanitized on construction so it can be embedded in store keys without
/// further escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountKey(String);

impl AccountKey {
    /// Create a key from a raw identifier, replacing anything outside
    /// `[A-Za-z0-9_.-]` with `_`.
    pub fn new(raw: impl AsRef<str>) -> Self {
        let sanitized: String = raw
            .as_ref()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        Self(sanitized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_key_sanitizes_to_restricted_charset() {
        let key = AccountKey::new("user@example.com:42");
        assert_eq!(key.as_str(), "user_example.com_42");
    }

    #[test]
    fn account_key_keeps_allowed_characters() {
        let key = AccountKey::new("tenant-1_a.b");
        assert_eq!(key.as_str(), "tenant-1_a.b");
    }
}
