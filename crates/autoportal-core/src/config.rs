//! Centralized retry, timeout and routing configuration.
//!
//! All backoff schedules and timeouts live here and are injected into the
//! orchestrator and the pool; no call site carries its own constants.

use std::time::Duration;

use autoportal_engine::PoolConfig;

/// Portal URL layout. The concrete paths are deployment configuration; the
/// defaults match the common layout.
#[derive(Debug, Clone)]
pub struct PortalRoutes {
    pub base_url: String,
    pub login_path: String,
    pub dashboard_path: String,
    pub manage_path: String,
}

impl PortalRoutes {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn login_url(&self) -> String {
        format!("{}{}", self.base_url, self.login_path)
    }

    pub fn dashboard_url(&self, query: &str) -> String {
        format!("{}{}?section={}", self.base_url, self.dashboard_path, query)
    }

    pub fn manage_url(&self) -> String {
        format!("{}{}", self.base_url, self.manage_path)
    }
}

impl Default for PortalRoutes {
    fn default() -> Self {
        Self {
            base_url: "https://portal.invalid".to_string(),
            login_path: "/login".to_string(),
            dashboard_path: "/dashboard".to_string(),
            manage_path: "/account/manage".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Full refresh+fallback passes before giving up.
    pub max_passes: u32,
    /// Fixed delays between cheap-path retries on transient failures.
    pub cheap_backoff: Vec<Duration>,
    /// Base delay before a second expensive pass; doubles per pass.
    pub expensive_backoff: Duration,
    /// Per-request timeout on the direct-protocol client.
    pub request_timeout: Duration,
    /// Per-navigation timeout inside an automation session.
    pub navigation_timeout: Duration,
    /// Store TTL for cached credential bundles and snapshots.
    pub credential_ttl: Duration,
    /// Refresh lock lease; self-expires against crashed holders.
    pub lock_lease: Duration,
    /// Stamped onto login results that carry no explicit expiry, so the
    /// cheap path can still use them.
    pub assumed_session_lifetime: Duration,
    /// Treat engine errors after a form submit as a successful side effect.
    /// Deliberate policy for fire-and-forget mutations; disable to audit.
    pub assume_success_on_post_submit_teardown: bool,
    pub pool: PoolConfig,
    pub routes: PortalRoutes,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_passes: 2,
            cheap_backoff: vec![Duration::from_millis(300), Duration::from_millis(900)],
            expensive_backoff: Duration::from_millis(500),
            request_timeout: Duration::from_secs(10),
            navigation_timeout: Duration::from_secs(10),
            credential_ttl: Duration::from_secs(24 * 3600),
            lock_lease: Duration::from_secs(300),
            assumed_session_lifetime: Duration::from_secs(12 * 3600),
            assume_success_on_post_submit_teardown: true,
            pool: PoolConfig::default(),
            routes: PortalRoutes::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_helpers_compose_urls() {
        let routes = PortalRoutes::new("https://portal.example.com");
        assert_eq!(routes.login_url(), "https://portal.example.com/login");
        assert_eq!(
            routes.dashboard_url("overview"),
            "https://portal.example.com/dashboard?section=overview"
        );
        assert_eq!(
            routes.manage_url(),
            "https://portal.example.com/account/manage"
        );
    }

    #[test]
    fn defaults_match_policy() {
        let config = RetryConfig::default();
        assert_eq!(config.max_passes, 2);
        assert_eq!(config.cheap_backoff.len(), 2);
        assert_eq!(config.pool.max_concurrent, 15);
        assert_eq!(config.pool.wait_timeout, Duration::from_secs(30));
        assert!(config.assume_success_on_post_submit_teardown);
    }
}
