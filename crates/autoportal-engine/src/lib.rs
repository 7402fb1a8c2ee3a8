//! Automation engine contract and session pool.
//!
//! The engine is an opaque collaborator that drives real portal sessions
//! (browser contexts). This crate defines the trait the core consumes and
//! the [`SessionPool`] that enforces a hard cap on concurrently live
//! contexts, queues excess demand FIFO with a bounded wait, and recovers
//! from engine disconnects.

pub mod engine;
pub mod error;
pub mod pool;

pub use engine::{AutomationEngine, ContextHandle, FormField};
pub use error::PoolError;
pub use pool::{PoolConfig, PooledSession, SessionPool, SessionState};
