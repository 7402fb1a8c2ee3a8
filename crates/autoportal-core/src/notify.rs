//! Outbound notification contract.

use anyhow::Result;
use async_trait::async_trait;
use autoportal_store::AccountKey;
use tracing::info;

/// Push channel for account-level events (dashboard changes, refresh
/// failures). Delivery is best-effort; callers swallow errors.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, key: &AccountKey, message: &str) -> Result<()>;
}

/// Default sink that only logs. Useful for deployments without a push
/// channel and for tests.
#[derive(Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, key: &AccountKey, message: &str) -> Result<()> {
        info!(account = %key, message, "notification");
        Ok(())
    }
}
