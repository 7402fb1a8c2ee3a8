//! Portal operation failure taxonomy.

use autoportal_engine::PoolError;

#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    /// The portal rejected the authentication artifacts. Triggers a
    /// credential refresh.
    #[error("portal rejected the cached credentials")]
    Unauthorized,

    /// Timeout, connection reset, 5xx. Retried with backoff; never
    /// interpreted as credential expiry.
    #[error("transient portal failure: {0}")]
    Transient(String),

    /// Structurally invalid request. Terminal, not retried.
    #[error("portal rejected the request (status {status}): {message}")]
    ClientError { status: u16, message: String },

    /// The session pool wait queue timed out. Terminal for this attempt.
    #[error("no automation session became available in time")]
    PoolExhausted,

    /// The automation engine crashed mid-operation. The pool self-heals on
    /// the next acquire; this attempt must restart from scratch.
    #[error("automation engine disconnected mid-operation")]
    ProviderDisconnected,

    #[error("account is not usable: {0}")]
    UnknownAccount(String),

    /// The overall retry budget is spent; carries the last classified
    /// failure.
    #[error("operation failed after {passes} passes: {last}")]
    RetriesExhausted { passes: u32, last: Box<PortalError> },
}

impl PortalError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized
                | Self::Transient(_)
                | Self::PoolExhausted
                | Self::ProviderDisconnected
        )
    }
}

impl From<PoolError> for PortalError {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::Exhausted(_) => Self::PoolExhausted,
            PoolError::Disconnected => Self::ProviderDisconnected,
            PoolError::ShutDown => Self::Transient("session pool is shut down".to_string()),
            PoolError::Engine(source) => Self::Transient(source.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_covers_recoverable_kinds() {
        assert!(PortalError::Unauthorized.is_retryable());
        assert!(PortalError::Transient("reset".into()).is_retryable());
        assert!(PortalError::PoolExhausted.is_retryable());
        assert!(
            !PortalError::ClientError {
                status: 400,
                message: "bad request".into()
            }
            .is_retryable()
        );
    }
}
