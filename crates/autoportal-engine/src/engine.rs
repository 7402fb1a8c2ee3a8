//! Opaque automation engine contract.
//!
//! Implementations drive a real browser (or an emulation of one) against
//! the portal. The core never sees page markup; it talks in terms of
//! navigation, cookie transfer, form submission and named read queries.
//! Page-specific selector logic lives entirely behind this trait.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use autoportal_store::CredentialBundle;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

/// Handle to one isolated execution context inside the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextHandle {
    pub id: Uuid,
}

impl ContextHandle {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }
}

impl Default for ContextHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// One field of a form submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    pub value: String,
}

impl FormField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Automation engine collaborator.
///
/// `launch` must be callable again after a disconnect; the pool relies on
/// that for self-healing. The disconnect signal flips to `true` when the
/// engine dies unexpectedly and back to `false` on a successful relaunch.
#[async_trait]
pub trait AutomationEngine: Send + Sync {
    async fn launch(&self) -> Result<()>;

    async fn create_context(&self) -> Result<ContextHandle>;

    async fn navigate(&self, ctx: &ContextHandle, url: &str, timeout: Duration) -> Result<()>;

    async fn read_cookies(&self, ctx: &ContextHandle) -> Result<CredentialBundle>;

    async fn set_cookies(&self, ctx: &ContextHandle, bundle: &CredentialBundle) -> Result<()>;

    async fn fill_and_submit(&self, ctx: &ContextHandle, fields: &[FormField]) -> Result<()>;

    /// Execute a named read query against the current page and return its
    /// structured result.
    async fn read(&self, ctx: &ContextHandle, query: &str) -> Result<Value>;

    async fn close_context(&self, ctx: &ContextHandle) -> Result<()>;

    /// Shut the engine itself down.
    async fn close(&self) -> Result<()>;

    /// Watch channel carrying the disconnected flag.
    fn disconnect_signal(&self) -> watch::Receiver<bool>;
}
