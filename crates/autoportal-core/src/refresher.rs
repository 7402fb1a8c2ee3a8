//! Scheduled batch credential refresh.
//!
//! Once a day every active account gets its cached credentials invalidated
//! and re-established through the orchestrator, so interactive traffic
//! mostly hits the cheap path with warm bundles. A post-refresh dashboard
//! read feeds change detection: when the snapshot differs from the stored
//! one, the account's notifier channel is pinged.

use std::sync::Arc;

use anyhow::anyhow;
use autoportal_store::{AccountKey, CredentialCache, Snapshot, SnapshotStore};
use futures::future::join_all;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::accounts::AccountDirectory;
use crate::error::PortalError;
use crate::notify::Notifier;
use crate::orchestrator::RetryOrchestrator;

/// 04:00 UTC daily, when portal traffic is lowest.
pub const DEFAULT_REFRESH_CRON: &str = "0 0 4 * * *";

/// Result of refreshing one account during a batch run.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub key: AccountKey,
    pub success: bool,
    pub detail: String,
}

pub struct BatchRefresher {
    orchestrator: Arc<RetryOrchestrator>,
    directory: Arc<dyn AccountDirectory>,
    cache: CredentialCache,
    snapshots: SnapshotStore,
    notifier: Arc<dyn Notifier>,
}

impl BatchRefresher {
    pub fn new(
        orchestrator: Arc<RetryOrchestrator>,
        directory: Arc<dyn AccountDirectory>,
        cache: CredentialCache,
        snapshots: SnapshotStore,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            orchestrator,
            directory,
            cache,
            snapshots,
            notifier,
        }
    }

    /// Refresh all active accounts in parallel. Per-account failures are
    /// reported in the outcomes, never propagated; one broken account must
    /// not starve the rest of the batch.
    pub async fn run_once(&self) -> Vec<RefreshOutcome> {
        let accounts = match self.directory.list_accounts().await {
            Ok(accounts) => accounts,
            Err(error) => {
                warn!(error = %error, "account listing failed, skipping batch refresh");
                return Vec::new();
            }
        };

        let jobs = accounts
            .into_iter()
            .filter(|record| record.active)
            .map(|record| self.refresh_one(record.key));
        let outcomes = join_all(jobs).await;

        let failures = outcomes.iter().filter(|outcome| !outcome.success).count();
        info!(
            total = outcomes.len(),
            failures, "batch credential refresh finished"
        );
        outcomes
    }

    async fn refresh_one(&self, key: AccountKey) -> RefreshOutcome {
        // Drop the old bundle first so nothing reads stale data mid-run.
        self.cache.invalidate(&key).await;

        match self.orchestrator.refresh_account(&key).await {
            Ok(_) => {
                if let Err(error) = self.check_for_changes(&key).await {
                    warn!(account = %key, error = %error, "post-refresh change check failed");
                }
                RefreshOutcome {
                    key,
                    success: true,
                    detail: "credentials refreshed".to_string(),
                }
            }
            Err(error) => {
                warn!(account = %key, error = %error, "batch refresh failed for account");
                RefreshOutcome {
                    detail: error.to_string(),
                    key,
                    success: false,
                }
            }
        }
    }

    /// Read the dashboard with the just-refreshed credentials and notify
    /// when its comparable projection changed since the previous run.
    async fn check_for_changes(&self, key: &AccountKey) -> Result<(), PortalError> {
        let data = self.orchestrator.perform_read(key, "overview").await?;
        let snapshot = Snapshot::project(&data);

        if let Some(previous) = self.snapshots.get(key).await {
            if snapshot.differs_from(&previous) {
                info!(account = %key, "dashboard data changed since last refresh");
                if let Err(error) = self
                    .notifier
                    .notify(key, "portal dashboard data changed since the last refresh")
                    .await
                {
                    warn!(account = %key, error = %error, "change notification failed");
                }
            }
        }

        self.snapshots.put(key, &snapshot).await;
        Ok(())
    }

    /// Register the batch run with a cron scheduler and start it. The
    /// returned scheduler owns the job; dropping it stops the schedule.
    pub async fn schedule(self: &Arc<Self>, cron: &str) -> anyhow::Result<JobScheduler> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|error| anyhow!("failed to create scheduler: {error}"))?;

        let refresher = self.clone();
        let job = Job::new_async(cron, move |_id, _scheduler| {
            let refresher = refresher.clone();
            Box::pin(async move {
                refresher.run_once().await;
            })
        })
        .map_err(|error| anyhow!("invalid refresh schedule '{cron}': {error}"))?;

        scheduler
            .add(job)
            .await
            .map_err(|error| anyhow!("failed to add refresh job: {error}"))?;
        scheduler
            .start()
            .await
            .map_err(|error| anyhow!("failed to start scheduler: {error}"))?;
        info!(cron, "batch refresh scheduled");
        Ok(scheduler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{AccountRecord, PortalSecret, SecretResolver};
    use crate::config::RetryConfig;
    use crate::direct::{DirectClient, DirectResponse};
    use crate::operation::MutationOp;
    use anyhow::Result;
    use async_trait::async_trait;
    use autoportal_engine::{
        AutomationEngine, ContextHandle, FormField, PoolConfig, SessionPool,
    };
    use autoportal_store::{
        CredentialBundle, CredentialItem, MemoryTtlStore, RefreshLock, TtlStore,
    };
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{watch, Mutex};
    use tokio::time::timeout;

    fn fresh_bundle() -> CredentialBundle {
        CredentialBundle::with_expiry(
            vec![CredentialItem::new("session", "batch")],
            Utc::now() + ChronoDuration::hours(1),
        )
    }

    /// Direct client that always logs in and serves a configurable
    /// dashboard body.
    struct StubDirect {
        body: Mutex<String>,
    }

    impl StubDirect {
        fn new(body: &str) -> Self {
            Self {
                body: Mutex::new(body.to_string()),
            }
        }

        async fn set_body(&self, body: &str) {
            *self.body.lock().await = body.to_string();
        }
    }

    #[async_trait]
    impl DirectClient for StubDirect {
        async fn read(
            &self,
            _bundle: &CredentialBundle,
            _query: &str,
        ) -> Result<DirectResponse, PortalError> {
            Ok(DirectResponse {
                status: 200,
                location: None,
                body: self.body.lock().await.clone(),
                refreshed: None,
            })
        }

        async fn mutate(
            &self,
            _bundle: &CredentialBundle,
            _op: &MutationOp,
        ) -> Result<DirectResponse, PortalError> {
            Ok(DirectResponse {
                status: 200,
                location: None,
                body: "{}".to_string(),
                refreshed: None,
            })
        }

        async fn login(
            &self,
            _secret: &PortalSecret,
        ) -> Result<Option<CredentialBundle>, PortalError> {
            Ok(Some(fresh_bundle()))
        }
    }

    /// Engine that should never be reached in these tests.
    struct IdleEngine {
        disconnect_tx: watch::Sender<bool>,
        contexts_created: AtomicUsize,
    }

    impl Default for IdleEngine {
        fn default() -> Self {
            let (disconnect_tx, _) = watch::channel(false);
            Self {
                disconnect_tx,
                contexts_created: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AutomationEngine for IdleEngine {
        async fn launch(&self) -> Result<()> {
            Ok(())
        }

        async fn create_context(&self) -> Result<ContextHandle> {
            self.contexts_created.fetch_add(1, Ordering::SeqCst);
            Ok(ContextHandle::new())
        }

        async fn navigate(&self, _ctx: &ContextHandle, _url: &str, _t: Duration) -> Result<()> {
            Ok(())
        }

        async fn read_cookies(&self, _ctx: &ContextHandle) -> Result<CredentialBundle> {
            Ok(fresh_bundle())
        }

        async fn set_cookies(&self, _ctx: &ContextHandle, _b: &CredentialBundle) -> Result<()> {
            Ok(())
        }

        async fn fill_and_submit(&self, _ctx: &ContextHandle, _f: &[FormField]) -> Result<()> {
            Ok(())
        }

        async fn read(&self, _ctx: &ContextHandle, _query: &str) -> Result<Value> {
            Ok(Value::Null)
        }

        async fn close_context(&self, _ctx: &ContextHandle) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        fn disconnect_signal(&self) -> watch::Receiver<bool> {
            self.disconnect_tx.subscribe()
        }
    }

    struct ManyAccounts {
        count: usize,
    }

    #[async_trait]
    impl AccountDirectory for ManyAccounts {
        async fn list_accounts(&self) -> Result<Vec<AccountRecord>> {
            let mut records: Vec<AccountRecord> = (0..self.count)
                .map(|i| AccountRecord {
                    key: AccountKey::new(format!("acct-{i}")),
                    secret_ref: format!("ref-{i}"),
                    active: true,
                })
                .collect();
            records.push(AccountRecord {
                key: AccountKey::new("acct-disabled"),
                secret_ref: "ref-disabled".to_string(),
                active: false,
            });
            Ok(records)
        }
    }

    struct StaticSecrets;

    #[async_trait]
    impl SecretResolver for StaticSecrets {
        async fn resolve(&self, _secret_ref: &str) -> Result<PortalSecret> {
            Ok(PortalSecret {
                username: "user".to_string(),
                password: "pass".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _key: &AccountKey, _message: &str) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        refresher: Arc<BatchRefresher>,
        direct: Arc<StubDirect>,
        notifier: Arc<CountingNotifier>,
        store: Arc<MemoryTtlStore>,
    }

    fn fixture(accounts: usize, body: &str) -> Fixture {
        let config = RetryConfig {
            cheap_backoff: vec![Duration::from_millis(1)],
            expensive_backoff: Duration::from_millis(1),
            pool: PoolConfig {
                spare_target: 0,
                ..PoolConfig::default()
            },
            ..RetryConfig::default()
        };

        let store: Arc<MemoryTtlStore> = Arc::new(MemoryTtlStore::new());
        let store_dyn: Arc<dyn TtlStore> = store.clone();
        let cache = CredentialCache::new(store_dyn.clone(), config.credential_ttl);
        let snapshots = SnapshotStore::new(store_dyn.clone(), config.credential_ttl);
        let lock = RefreshLock::new(store_dyn, config.lock_lease);

        let engine: Arc<dyn AutomationEngine> = Arc::new(IdleEngine::default());
        let pool = Arc::new(SessionPool::new(engine.clone(), config.pool.clone()));
        let direct = Arc::new(StubDirect::new(body));
        let directory: Arc<dyn AccountDirectory> = Arc::new(ManyAccounts { count: accounts });
        let notifier = Arc::new(CountingNotifier::default());

        let orchestrator = Arc::new(RetryOrchestrator::new(
            cache.clone(),
            lock,
            pool,
            engine,
            direct.clone() as Arc<dyn DirectClient>,
            directory.clone(),
            Arc::new(StaticSecrets),
            None,
            config,
        ));

        let refresher = Arc::new(BatchRefresher::new(
            orchestrator,
            directory,
            cache,
            snapshots,
            notifier.clone() as Arc<dyn Notifier>,
        ));

        Fixture {
            refresher,
            direct,
            notifier,
            store,
        }
    }

    #[tokio::test]
    async fn batch_run_refreshes_every_active_account() {
        let fx = fixture(5, "{\"plan\":\"basic\"}");

        let outcomes = timeout(Duration::from_secs(10), fx.refresher.run_once())
            .await
            .expect("batch run must terminate");
        assert_eq!(outcomes.len(), 5, "disabled account is skipped");
        assert!(outcomes.iter().all(|outcome| outcome.success));
    }

    #[tokio::test]
    async fn foreground_lock_is_respected_but_never_blocks_the_batch() {
        let fx = fixture(5, "{\"plan\":\"basic\"}");

        // A foreground refresh holds acct-2's lock for the whole run.
        let foreground = RefreshLock::new(
            fx.store.clone() as Arc<dyn TtlStore>,
            Duration::from_secs(60),
        );
        let contended = AccountKey::new("acct-2");
        assert!(foreground.acquire(&contended).await);

        let outcomes = timeout(Duration::from_secs(10), fx.refresher.run_once())
            .await
            .expect("batch run must terminate despite the held lock");
        assert_eq!(outcomes.len(), 5);
        assert!(outcomes.iter().all(|outcome| outcome.success));

        // The batch proceeded in degraded mode without touching the
        // foreign lease.
        assert!(!foreground.acquire(&contended).await);
    }

    #[tokio::test]
    async fn snapshot_change_notifies_exactly_once() {
        let fx = fixture(1, "{\"plan\":\"basic\"}");

        fx.refresher.run_once().await;
        assert_eq!(fx.notifier.sent.load(Ordering::SeqCst), 0, "first run seeds the snapshot");

        fx.direct.set_body("{\"plan\":\"premium\"}").await;
        fx.refresher.run_once().await;
        assert_eq!(fx.notifier.sent.load(Ordering::SeqCst), 1);

        fx.refresher.run_once().await;
        assert_eq!(fx.notifier.sent.load(Ordering::SeqCst), 1, "unchanged data stays quiet");
    }

    #[tokio::test]
    async fn unreachable_directory_yields_an_empty_run() {
        struct BrokenDirectory;

        #[async_trait]
        impl AccountDirectory for BrokenDirectory {
            async fn list_accounts(&self) -> Result<Vec<AccountRecord>> {
                Err(anyhow!("directory offline"))
            }
        }

        let fx = fixture(1, "{}");
        let refresher = Arc::new(BatchRefresher::new(
            fx.refresher.orchestrator.clone(),
            Arc::new(BrokenDirectory),
            fx.refresher.cache.clone(),
            fx.refresher.snapshots.clone(),
            fx.notifier.clone() as Arc<dyn Notifier>,
        ));

        assert!(refresher.run_once().await.is_empty());
    }
}
