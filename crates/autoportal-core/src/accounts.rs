//! Collaborator contracts: account directory, secret resolution and the
//! puzzle-solving service.

use anyhow::Result;
use async_trait::async_trait;
use autoportal_store::AccountKey;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub key: AccountKey,
    pub secret_ref: String,
    pub active: bool,
}

/// Persistent account/profile store, consumed read-only.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn list_accounts(&self) -> Result<Vec<AccountRecord>>;

    async fn get_account(&self, key: &AccountKey) -> Result<Option<AccountRecord>> {
        Ok(self
            .list_accounts()
            .await?
            .into_iter()
            .find(|record| &record.key == key))
    }
}

/// Login material for one account. Never logged.
#[derive(Clone)]
pub struct PortalSecret {
    pub username: String,
    pub password: String,
}

/// Resolves the opaque `secret_ref` carried by an [`AccountRecord`] into
/// usable login material.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, secret_ref: &str) -> Result<PortalSecret>;
}

/// External puzzle (CAPTCHA) solving service, used when the portal gates
/// the login form behind a challenge.
#[async_trait]
pub trait PuzzleSolver: Send + Sync {
    async fn solve(&self, challenge: &[u8]) -> Result<String>;
}
