//! Autoportal core: retry and fallback orchestration.
//!
//! Every operation against the portal flows through the
//! [`RetryOrchestrator`]: it prefers the cheap direct-protocol path when a
//! fresh credential bundle is cached, refreshes credentials under the
//! advisory per-account lock when they are rejected, and falls back to a
//! full automation session from the bounded pool when the cheap path is
//! unavailable or keeps failing. The [`BatchRefresher`] drives the same
//! machinery proactively on a daily schedule.

pub mod accounts;
pub mod classify;
pub mod config;
pub mod direct;
pub mod error;
pub mod notify;
pub mod operation;
pub mod orchestrator;
pub mod refresher;

pub use accounts::{AccountDirectory, AccountRecord, PortalSecret, PuzzleSolver, SecretResolver};
pub use classify::{classify, FailureKind};
pub use config::{PortalRoutes, RetryConfig};
pub use direct::{DirectClient, DirectResponse, HttpDirectClient};
pub use error::PortalError;
pub use notify::{LogNotifier, Notifier};
pub use operation::{MutationOp, MutationOutcome, PortalOperation};
pub use orchestrator::RetryOrchestrator;
pub use refresher::{BatchRefresher, RefreshOutcome, DEFAULT_REFRESH_CRON};
