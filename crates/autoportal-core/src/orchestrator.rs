//! Retry and fallback orchestration.
//!
//! Every portal operation runs through [`RetryOrchestrator::run`]: try the
//! cheap direct-protocol path while the cached credentials look fresh, then
//! refresh credentials under the advisory lock and retry, then fall back to
//! a full automation session from the bounded pool. Transient failures get
//! a fixed backoff on the cheap path and never count as credential expiry;
//! only an explicit unauthorized classification triggers a refresh.

use std::sync::Arc;

use autoportal_engine::{AutomationEngine, ContextHandle, FormField, PooledSession, SessionPool};
use autoportal_store::{AccountKey, CredentialBundle, CredentialCache, RefreshLock};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::accounts::{AccountDirectory, AccountRecord, PortalSecret, PuzzleSolver, SecretResolver};
use crate::classify::FailureKind;
use crate::config::RetryConfig;
use crate::direct::DirectClient;
use crate::error::PortalError;
use crate::operation::{MutationOp, MutationOutcome, PortalOperation};

enum OpResult {
    Data(Value),
    Mutation(MutationOutcome),
}

pub struct RetryOrchestrator {
    cache: CredentialCache,
    lock: RefreshLock,
    pool: Arc<SessionPool>,
    engine: Arc<dyn AutomationEngine>,
    direct: Arc<dyn DirectClient>,
    directory: Arc<dyn AccountDirectory>,
    secrets: Arc<dyn SecretResolver>,
    solver: Option<Arc<dyn PuzzleSolver>>,
    config: RetryConfig,
}

impl RetryOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: CredentialCache,
        lock: RefreshLock,
        pool: Arc<SessionPool>,
        engine: Arc<dyn AutomationEngine>,
        direct: Arc<dyn DirectClient>,
        directory: Arc<dyn AccountDirectory>,
        secrets: Arc<dyn SecretResolver>,
        solver: Option<Arc<dyn PuzzleSolver>>,
        config: RetryConfig,
    ) -> Self {
        Self {
            cache,
            lock,
            pool,
            engine,
            direct,
            directory,
            secrets,
            solver,
            config,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Fetch structured data from the portal dashboard.
    pub async fn perform_read(&self, key: &AccountKey, query: &str) -> Result<Value, PortalError> {
        match self.run(key, PortalOperation::Read { query }).await? {
            OpResult::Data(value) => Ok(value),
            OpResult::Mutation(_) => {
                Err(PortalError::Transient("read produced a mutation result".to_string()))
            }
        }
    }

    /// Apply a sub-account mutation.
    pub async fn perform_mutation(
        &self,
        key: &AccountKey,
        op: &MutationOp,
    ) -> Result<MutationOutcome, PortalError> {
        match self.run(key, PortalOperation::Mutate { op }).await? {
            OpResult::Mutation(outcome) => Ok(outcome),
            OpResult::Data(_) => {
                Err(PortalError::Transient("mutation produced a read result".to_string()))
            }
        }
    }

    /// Force a credential refresh for one account, caching the new bundle.
    ///
    /// The advisory lock is taken when free; when another holder is live
    /// the refresh proceeds anyway and the cache's supersede semantics keep
    /// the final state consistent.
    pub async fn refresh_account(&self, key: &AccountKey) -> Result<CredentialBundle, PortalError> {
        let held = self.lock.acquire(key).await;
        if !held {
            debug!(account = %key, "refresh lock busy, refreshing unlocked");
        }
        let result = self.perform_login(key).await;
        if held {
            self.lock.release(key).await;
        }
        result
    }

    async fn run(&self, key: &AccountKey, op: PortalOperation<'_>) -> Result<OpResult, PortalError> {
        let cheap_supported = self.direct.supports(&op);
        let fresh = self.fresh_bundle(key).await;
        let mut need_refresh = fresh.is_none();
        let mut last = PortalError::Transient("no usable path attempted".to_string());

        if cheap_supported {
            if let Some(bundle) = &fresh {
                match self.cheap_with_retries(key, bundle, &op).await {
                    Ok(result) => return Ok(result),
                    Err(error @ PortalError::Unauthorized) => {
                        need_refresh = true;
                        last = error;
                    }
                    Err(error) if error.is_retryable() => {
                        // A transient portal failure says nothing about the
                        // credentials; skip the refresh and go expensive.
                        need_refresh = false;
                        last = error;
                    }
                    Err(error) => return Err(error),
                }
            }
        }

        for pass in 1..=self.config.max_passes {
            if pass > 1 {
                let delay = self.config.expensive_backoff * 2u32.pow(pass - 2);
                debug!(account = %key, pass, delay_ms = delay.as_millis() as u64, "backing off before next pass");
                sleep(delay).await;
            }

            if need_refresh {
                match self.refresh_account(key).await {
                    Ok(bundle) => {
                        need_refresh = false;
                        if cheap_supported {
                            match self.cheap_attempt(key, &bundle, &op).await {
                                Ok(result) => return Ok(result),
                                Err(error) if error.is_retryable() => {
                                    debug!(account = %key, error = %error, "post-refresh cheap retry failed");
                                }
                                Err(error) => return Err(error),
                            }
                        }
                    }
                    Err(error) if error.is_retryable() => {
                        warn!(account = %key, error = %error, "credential refresh failed, trying the session path");
                    }
                    Err(error) => return Err(error),
                }
            }

            match self.expensive_attempt(key, &op).await {
                Ok(result) => return Ok(result),
                Err(error) if error.is_retryable() => {
                    need_refresh = matches!(error, PortalError::Unauthorized);
                    last = error;
                }
                Err(error) => return Err(error),
            }
        }

        warn!(account = %key, passes = self.config.max_passes, error = %last, "retry budget exhausted");
        Err(PortalError::RetriesExhausted {
            passes: self.config.max_passes,
            last: Box::new(last),
        })
    }

    async fn fresh_bundle(&self, key: &AccountKey) -> Option<CredentialBundle> {
        self.cache
            .get(key)
            .await
            .filter(|bundle| bundle.is_fresh(Utc::now()))
    }

    /// Cheap-path attempt with fixed backoff on transient failures only.
    async fn cheap_with_retries(
        &self,
        key: &AccountKey,
        bundle: &CredentialBundle,
        op: &PortalOperation<'_>,
    ) -> Result<OpResult, PortalError> {
        let mut attempt = 0;
        loop {
            match self.cheap_attempt(key, bundle, op).await {
                Err(PortalError::Transient(reason)) if attempt < self.config.cheap_backoff.len() => {
                    let delay = self.config.cheap_backoff[attempt];
                    debug!(account = %key, reason, delay_ms = delay.as_millis() as u64, "cheap path retry");
                    sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn cheap_attempt(
        &self,
        key: &AccountKey,
        bundle: &CredentialBundle,
        op: &PortalOperation<'_>,
    ) -> Result<OpResult, PortalError> {
        let response = match op {
            PortalOperation::Read { query } => self.direct.read(bundle, query).await?,
            PortalOperation::Mutate { op } => self.direct.mutate(bundle, op).await?,
        };

        match response.kind() {
            FailureKind::Success => {
                if let Some(rotated) = response.refreshed.clone() {
                    let mut rotated = rotated;
                    self.stamp_assumed_lifetime(&mut rotated);
                    self.cache.put(key, &rotated).await;
                }
                match op {
                    PortalOperation::Read { .. } => Ok(OpResult::Data(parse_body(&response.body))),
                    PortalOperation::Mutate { op } => Ok(OpResult::Mutation(MutationOutcome {
                        success: true,
                        message: format!("{} accepted", op.describe()),
                    })),
                }
            }
            FailureKind::Unauthorized => Err(PortalError::Unauthorized),
            FailureKind::Transient => Err(PortalError::Transient(format!(
                "portal returned status {}",
                response.status
            ))),
            FailureKind::ClientError => Err(PortalError::ClientError {
                status: response.status,
                message: body_sample(&response.body),
            }),
        }
    }

    /// One full automation attempt: check out a session, drive it, release.
    async fn expensive_attempt(
        &self,
        key: &AccountKey,
        op: &PortalOperation<'_>,
    ) -> Result<OpResult, PortalError> {
        let session = self.pool.acquire().await?;
        let result = self.drive_session(&session, key, op).await;
        self.pool.release(&session).await;

        match result {
            // Engine failures while the disconnect flag is raised are the
            // disconnect itself; the pool self-heals on the next acquire.
            Err(PortalError::Transient(reason))
                if *self.engine.disconnect_signal().borrow() =>
            {
                warn!(account = %key, reason, "engine disconnected mid-operation");
                Err(PortalError::ProviderDisconnected)
            }
            other => other,
        }
    }

    async fn drive_session(
        &self,
        session: &PooledSession,
        key: &AccountKey,
        op: &PortalOperation<'_>,
    ) -> Result<OpResult, PortalError> {
        let ctx = &session.context;

        match self.fresh_bundle(key).await {
            Some(bundle) => {
                self.engine
                    .set_cookies(ctx, &bundle)
                    .await
                    .map_err(|error| {
                        PortalError::Transient(format!("cookie injection failed: {error}"))
                    })?;
            }
            None => {
                self.automation_login(ctx, key).await?;
            }
        }

        match op {
            PortalOperation::Read { query } => {
                self.navigate(ctx, &self.config.routes.dashboard_url(query)).await?;
                let value = self
                    .engine
                    .read(ctx, query)
                    .await
                    .map_err(|error| PortalError::Transient(format!("page read failed: {error}")))?;
                if login_required(&value) {
                    return Err(PortalError::Unauthorized);
                }
                Ok(OpResult::Data(value))
            }
            PortalOperation::Mutate { op } => {
                self.navigate(ctx, &self.config.routes.manage_url()).await?;
                if let Err(error) = self.engine.fill_and_submit(ctx, &op.form_fields()).await {
                    return self.post_submit_verdict(op, error);
                }
                match self.engine.read(ctx, "operation-result").await {
                    Ok(value) => {
                        if login_required(&value) {
                            return Err(PortalError::Unauthorized);
                        }
                        Ok(OpResult::Mutation(mutation_outcome(op, &value)))
                    }
                    Err(error) => self.post_submit_verdict(op, error),
                }
            }
        }
    }

    /// An engine failure after the form went in is ambiguous: the portal
    /// may well have applied the change. The policy flag decides whether
    /// that ambiguity reads as success or as a retryable failure.
    fn post_submit_verdict(
        &self,
        op: &MutationOp,
        error: anyhow::Error,
    ) -> Result<OpResult, PortalError> {
        if self.config.assume_success_on_post_submit_teardown {
            warn!(error = %error, "engine failed after form submit, assuming the portal applied it");
            Ok(OpResult::Mutation(MutationOutcome {
                success: true,
                message: format!("{} assumed applied despite engine teardown", op.describe()),
            }))
        } else {
            Err(PortalError::Transient(format!(
                "engine failed after form submit: {error}"
            )))
        }
    }

    /// Log in for one account, preferring the cheap protocol login and
    /// falling back to a pooled automation session.
    async fn perform_login(&self, key: &AccountKey) -> Result<CredentialBundle, PortalError> {
        let record = self.resolve_record(key).await?;
        let secret = self.resolve_secret(&record).await?;

        match self.direct.login(&secret).await {
            Ok(Some(mut bundle)) => {
                self.stamp_assumed_lifetime(&mut bundle);
                self.cache.put(key, &bundle).await;
                info!(account = %key, "direct login succeeded");
                return Ok(bundle);
            }
            Ok(None) => {
                debug!(account = %key, "portal requires the full login flow");
            }
            Err(PortalError::Unauthorized) => return Err(PortalError::Unauthorized),
            Err(error) => {
                warn!(account = %key, error = %error, "direct login failed, falling back to automation");
            }
        }

        let session = self.pool.acquire().await?;
        let result = self.automation_login(&session.context, key).await;
        self.pool.release(&session).await;
        result
    }

    /// Drive the portal login form inside an existing context and cache the
    /// resulting bundle.
    async fn automation_login(
        &self,
        ctx: &ContextHandle,
        key: &AccountKey,
    ) -> Result<CredentialBundle, PortalError> {
        let record = self.resolve_record(key).await?;
        let secret = self.resolve_secret(&record).await?;

        self.navigate(ctx, &self.config.routes.login_url()).await?;

        let mut fields = vec![
            FormField::new("username", secret.username.clone()),
            FormField::new("password", secret.password.clone()),
        ];
        if let Some(solver) = &self.solver {
            if let Ok(challenge) = self.engine.read(ctx, "login-challenge").await {
                if let Some(payload) = challenge.as_str().filter(|raw| !raw.is_empty()) {
                    let answer = solver.solve(payload.as_bytes()).await.map_err(|error| {
                        PortalError::Transient(format!("puzzle solver failed: {error}"))
                    })?;
                    fields.push(FormField::new("challenge_response", answer));
                }
            }
        }

        self.engine
            .fill_and_submit(ctx, &fields)
            .await
            .map_err(|error| PortalError::Transient(format!("login submit failed: {error}")))?;

        let mut bundle = self
            .engine
            .read_cookies(ctx)
            .await
            .map_err(|error| PortalError::Transient(format!("cookie readout failed: {error}")))?;
        if bundle.is_empty() {
            // No session artifacts after the submit means the portal did
            // not accept the login.
            return Err(PortalError::Unauthorized);
        }

        self.stamp_assumed_lifetime(&mut bundle);
        self.cache.put(key, &bundle).await;
        info!(account = %key, items = bundle.items.len(), "automation login succeeded");
        Ok(bundle)
    }

    async fn resolve_record(&self, key: &AccountKey) -> Result<AccountRecord, PortalError> {
        let record = self
            .directory
            .get_account(key)
            .await
            .map_err(|error| PortalError::Transient(format!("account lookup failed: {error}")))?
            .ok_or_else(|| PortalError::UnknownAccount(key.to_string()))?;
        if !record.active {
            return Err(PortalError::UnknownAccount(format!("{key} is deactivated")));
        }
        Ok(record)
    }

    async fn resolve_secret(&self, record: &AccountRecord) -> Result<PortalSecret, PortalError> {
        self.secrets
            .resolve(&record.secret_ref)
            .await
            .map_err(|error| PortalError::Transient(format!("secret resolution failed: {error}")))
    }

    async fn navigate(&self, ctx: &ContextHandle, url: &str) -> Result<(), PortalError> {
        self.engine
            .navigate(ctx, url, self.config.navigation_timeout)
            .await
            .map_err(|error| PortalError::Transient(format!("navigation failed: {error}")))
    }

    /// Bundles without any expiry signal get the assumed session lifetime
    /// so the cheap path can still use them.
    fn stamp_assumed_lifetime(&self, bundle: &mut CredentialBundle) {
        let has_expiry = bundle.expires_at.is_some()
            || bundle
                .items
                .iter()
                .any(|item| item.attributes.contains_key("expires"));
        if !has_expiry {
            let lifetime = ChronoDuration::from_std(self.config.assumed_session_lifetime)
                .unwrap_or_else(|_| ChronoDuration::hours(12));
            bundle.expires_at = Some(Utc::now() + lifetime);
        }
    }
}

fn login_required(value: &Value) -> bool {
    value
        .get("login_required")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn mutation_outcome(op: &MutationOp, value: &Value) -> MutationOutcome {
    let success = value.get("success").and_then(Value::as_bool).unwrap_or(true);
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .unwrap_or_else(|| op.describe());
    MutationOutcome { success, message }
}

fn parse_body(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

fn body_sample(body: &str) -> String {
    body.chars().take(200).collect()
}
