//! Session pool error types.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no session became available within {0:?}")]
    Exhausted(Duration),

    #[error("automation engine disconnected")]
    Disconnected,

    #[error("session pool is shut down")]
    ShutDown,

    #[error("automation engine error: {0}")]
    Engine(#[from] anyhow::Error),
}
